//! Everything the device layer needs to reach the hardware

use std::path::PathBuf;

use ltbox_core::StorageType;

use crate::process::{Invocation, ToolOutput, ToolRunner};
use crate::timings::Timings;
use crate::tool_availability::ToolPaths;
use ltbox_core::prelude::*;

/// Default location of the Linux serial symlinks that name USB devices
pub const DEFAULT_SERIAL_BY_ID_DIR: &str = "/dev/serial/by-id";

/// Tool runner plus the static facts about how to drive the device
///
/// Borrowed by [`crate::ModeOrchestrator`] and [`crate::FirehoseChannel`];
/// the mutable per-operation state lives in [`crate::DeviceSession`].
#[derive(Debug)]
pub struct DeviceEnv<R> {
    pub runner: R,
    pub tools: ToolPaths,
    pub timings: Timings,
    pub storage: StorageType,
    /// Directory holding the per-port EDL lock files
    pub lock_dir: PathBuf,
    /// Scanned for QDLoader ports on non-Windows hosts
    pub serial_by_id_dir: PathBuf,
}

impl<R: ToolRunner> DeviceEnv<R> {
    pub fn new(runner: R, tools: ToolPaths) -> Self {
        Self {
            runner,
            tools,
            timings: Timings::default(),
            storage: StorageType::default(),
            lock_dir: std::env::temp_dir().join("ltbox-locks"),
            serial_by_id_dir: PathBuf::from(DEFAULT_SERIAL_BY_ID_DIR),
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_storage(mut self, storage: StorageType) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    pub fn with_serial_by_id_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.serial_by_id_dir = dir.into();
        self
    }

    /// Run an invocation through the configured runner
    pub async fn run(&self, invocation: Invocation) -> Result<ToolOutput> {
        self.runner.run(&invocation).await
    }
}
