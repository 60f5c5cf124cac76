//! Result printing
//!
//! Logs go to stderr and the log file; stdout only ever carries results,
//! either as human-readable lines or as one pretty-printed JSON document.

use std::io::{self, Write};

use serde::Serialize;

use ltbox_core::prelude::*;

#[derive(Debug, Clone, Copy)]
pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    /// Print `value`, using `human` for the non-JSON form
    pub fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&T) -> String) -> Result<()> {
        let text = self.render(value, human)?;
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", text)?;
        stdout.flush()?;
        Ok(())
    }

    pub fn render<T: Serialize>(&self, value: &T, human: impl FnOnce(&T) -> String) -> Result<String> {
        if self.json {
            Ok(serde_json::to_string_pretty(value).map_err(io::Error::from)?)
        } else {
            Ok(human(value))
        }
    }
}
