//! # ltbox-image - Partition Descriptors and Firmware Image Patching
//!
//! Everything that reads or rewrites image files: the partition map built from
//! `rawprogram*.xml`, verified-boot footer extraction and rebuilding, the
//! anti-rollback patcher and the region transforms.
//!
//! ## Public API
//!
//! - [`PartitionMap`], [`PartitionRecord`] - Label to LUN/sector lookup
//! - [`AvbCodec`], [`AvbImageInfo`] - AVB extraction and regeneration
//! - [`KeySelection`] - Signing key per public-key digest
//! - [`compare`], [`RollbackPatcher`] - Anti-rollback handling
//! - [`region`] - ROW to PRC and country-code transforms
//! - [`ScratchDir`] - Scoped working directory
//! - [`kernel_version`] - Kernel banner probe

pub mod avb;
pub mod kernel;
pub mod keys;
pub mod partition_map;
pub mod region;
pub mod rollback;
pub mod scratch;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

pub use avb::{AvbAlgorithm, AvbCodec, AvbImageInfo, AvbToolConfig, FooterOverrides};
pub use kernel::{kernel_version, kernel_version_of};
pub use keys::KeySelection;
pub use partition_map::{
    discover, select_flash_descriptors, FlashDescriptors, PartitionMap, PartitionRecord,
    PatchedPartitions,
};
pub use region::CountryCode;
pub use rollback::{compare, PatchedPair, RollbackComparison, RollbackPatcher, RollbackStatus};
pub use scratch::ScratchDir;
