//! Android Verified Boot metadata
//!
//! - [`format`] parses footers, headers and descriptors natively
//! - [`codec`] regenerates them through `avbtool`

pub mod codec;
pub mod format;

pub use codec::{AvbCodec, AvbToolConfig, FooterOverrides};
pub use format::{extract, AvbAlgorithm, AvbFooter, AvbImageInfo, Descriptor, VbmetaHeader};
