//! External tool invocation
//!
//! Every interaction with the device goes through an executable (`adb`,
//! `fastboot`, `QSaharaServer`, `fh_loader`). [`ToolRunner`] is the seam
//! between the orchestration logic and the real processes, so the logic can be
//! exercised against a recorded fake.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use ltbox_core::prelude::*;

/// A single external command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Working directory, inherited when `None`
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Bare tool name without directory or extension, e.g. `fh_loader`
    pub fn tool_name(&self) -> String {
        self.program
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Whether any argument equals `arg` or starts with `arg=`
    pub fn has_flag(&self, flag: &str) -> bool {
        self.args
            .iter()
            .any(|a| a == flag || a.strip_prefix(flag).is_some_and(|rest| rest.starts_with('=')))
    }

    /// Value of a `--flag=value` argument
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args.iter().find_map(|a| {
            a.strip_prefix(flag)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }

    /// Command line as it would be typed, for logs
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Convert a non-zero exit into [`Error::CommandFailed`]
    pub fn into_checked(self, tool: &str) -> Result<ToolOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::command_failed(tool, self.code, self.stderr.trim()))
        }
    }

    /// stdout followed by stderr; fastboot reports variables on stderr
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Runs external tools to completion
#[trait_variant::make(ToolRunner: Send)]
pub trait LocalToolRunner {
    /// Run the invocation and wait for it to exit
    ///
    /// A non-zero exit is *not* an error here; callers decide what it means.
    async fn run(&self, invocation: &Invocation) -> Result<ToolOutput>;
}

/// [`ToolRunner`] backed by real child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ToolOutput> {
        debug!("Running: {}", invocation.command_line());

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.cwd {
            command.current_dir(dir);
        }

        let output = command.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::tool_not_found(invocation.program.display().to_string())
            } else {
                Error::file(&invocation.program, e)
            }
        })?;

        let result = ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!(
            "{} exited with {:?} (stdout: {} bytes, stderr: {} bytes)",
            invocation.tool_name(),
            result.code,
            result.stdout.len(),
            result.stderr.len()
        );
        Ok(result)
    }
}
