//! Serializable outcomes of the operations

use std::path::PathBuf;

use serde::Serialize;

use ltbox_image::region::{CodeReplacement, PrcConversion};
use ltbox_image::{AvbAlgorithm, AvbImageInfo, PatchedPair};

/// The verified-boot fields worth showing for one image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSummary {
    pub path: PathBuf,
    pub partition_name: Option<String>,
    pub rollback_index: u64,
    pub algorithm: AvbAlgorithm,
    pub pubkey_sha1: Option<String>,
}

impl ImageSummary {
    /// Summary of `info` reported under `path`
    pub fn at(path: impl Into<PathBuf>, info: &AvbImageInfo) -> Self {
        Self {
            path: path.into(),
            partition_name: info.partition_name.clone(),
            rollback_index: info.rollback_index,
            algorithm: info.algorithm,
            pubkey_sha1: info.pubkey_sha1.clone(),
        }
    }
}

impl From<&AvbImageInfo> for ImageSummary {
    fn from(info: &AvbImageInfo) -> Self {
        Self::at(&info.path, info)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchedPairSummary {
    pub boot: ImageSummary,
    pub vbmeta: ImageSummary,
}

impl From<&PatchedPair> for PatchedPairSummary {
    fn from(pair: &PatchedPair) -> Self {
        Self {
            boot: ImageSummary::from(&pair.boot),
            vbmeta: ImageSummary::from(&pair.vbmeta),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpedPartition {
    pub label: String,
    pub lun: u32,
    pub start_sector: u64,
    pub num_sectors: u64,
    pub path: PathBuf,
}

/// A requested partition that was not read
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPartition {
    pub label: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadReport {
    pub read: Vec<DumpedPartition>,
    /// Labels with no descriptor entry
    pub skipped: Vec<SkippedPartition>,
    /// Labels whose read failed on the device
    pub failed: Vec<SkippedPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WrittenPartition {
    /// Label as found in the descriptors, slot suffix included
    pub label: String,
    pub lun: u32,
    pub start_sector: u64,
    pub image: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashReport {
    /// Files copied from the output folders into the image folder
    pub copied_files: usize,
    pub raw: Vec<PathBuf>,
    pub patch: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionConversion {
    pub conversion: PrcConversion,
    pub vendor_boot: ImageSummary,
    pub vbmeta: ImageSummary,
}

/// Outcome for one devinfo or persist image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionCodePatch {
    pub image: PathBuf,
    /// Country code found in the image
    pub detected: Option<String>,
    pub outcome: Option<CodeReplacement>,
    /// Patched or copied image; absent when no code was detected
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionCodeReport {
    /// Timestamped copy of the inputs
    pub backup_dir: PathBuf,
    pub patches: Vec<RegionCodePatch>,
}
