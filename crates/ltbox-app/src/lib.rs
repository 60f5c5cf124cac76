//! # ltbox-app - Configuration and Operations
//!
//! Binds the device and image crates into the operations the CLI exposes.
//! Each operation owns one [`ltbox_device::DeviceSession`] from start to
//! finish; nothing is shared between operations.
//!
//! Depends on [`ltbox_core`], [`ltbox_device`] and [`ltbox_image`].
//!
//! ## Public API
//!
//! - [`LtboxConfig`] - `ltbox.toml` with defaults for every section
//! - [`Operations`] - Read, write, flash, boot backup, rollback and region workflows
//! - [`report`] - Serializable outcomes for the CLI

pub mod config;
pub mod operations;
pub mod report;

pub use config::{BehaviorSettings, LtboxConfig, PathSettings, CONFIG_ENV, CONFIG_FILENAME};
pub use operations::{
    Operations, BOOT_BACKUP_IMAGE, BOOT_LABEL, DEFAULT_DUMP_TARGETS, ROLLBACK_BOOT_IMAGE,
    ROLLBACK_VBMETA_IMAGE,
};
pub use report::{
    DumpedPartition, FlashReport, ImageSummary, PatchedPairSummary, ReadReport, RegionCodePatch,
    RegionCodeReport, RegionConversion, SkippedPartition, WrittenPartition,
};
