//! # ltbox-device - Device Mode Orchestration and Partition I/O
//!
//! Drives a tablet between its three exposed modes and performs sector-level
//! partition I/O in EDL mode. All device access goes through external
//! executables behind the [`ToolRunner`] seam.
//!
//! Depends on [`ltbox_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Orchestration
//! - [`ModeOrchestrator`] - Mode transitions, slot detection, OTA disabling
//! - [`DeviceSession`] - Per-operation mode, transport and slot record
//! - [`Transport`] - The control channel a session currently holds
//!
//! ### Partition I/O
//! - [`FirehoseChannel`] - Programmer upload, read, write, reset, raw program
//! - [`EdlLink`], [`PortLease`] - Exclusive handle on an EDL port
//!
//! ### Tooling
//! - [`ToolRunner`], [`ProcessRunner`] - External process seam
//! - [`ToolPaths`], [`ToolOverrides`] - Executable discovery
//! - [`Timings`] - Settle delays and polling cadence
//! - [`DeviceEnv`] - Runner plus static device facts

pub mod adb;
pub mod edl;
pub mod env;
pub mod fastboot;
pub mod firehose;
pub mod orchestrator;
pub mod process;
pub mod session;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod timings;
pub mod tool_availability;

pub use adb::{SlotQuery, SlotQueryFailure};
pub use edl::{EdlLink, PortLease};
pub use env::DeviceEnv;
pub use firehose::FirehoseChannel;
pub use orchestrator::ModeOrchestrator;
pub use process::{Invocation, LocalToolRunner, ProcessRunner, ToolOutput, ToolRunner};
pub use session::{DeviceSession, Transport};
pub use timings::Timings;
pub use tool_availability::{ToolOverrides, ToolPaths};
