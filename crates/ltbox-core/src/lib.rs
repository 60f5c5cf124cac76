//! # ltbox-core - Core Domain Types
//!
//! Foundation crate for LTBox. Provides error handling, logging setup and
//! the device vocabulary shared by every other crate.
//!
//! This crate has **zero internal dependencies**.
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`DeviceMode`] - Interface the device exposes (System, Bootloader, Edl)
//! - [`SlotSuffix`] - A/B slot suffix (`""`, `"_a"`, `"_b"`)
//! - [`StorageType`] - UFS or eMMC, with sector size and loader memory name
//! - [`EdlPort`] - Serial endpoint of a device in EDL mode
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Error enum with `fatal` vs `recoverable` classification
//! - [`ErrorKind`] - Coarse taxonomy bucket of an [`Error`]
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ## Prelude
//!
//! ```rust
//! use ltbox_core::prelude::*;
//! ```

pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;

pub use error::{Error, ErrorKind, NotFoundReason, Result, ResultExt};
pub use types::{DeviceMode, EdlPort, SlotSuffix, StorageType};
