//! Anti-rollback index comparison and patching
//!
//! The device refuses images whose rollback index is below what it has
//! committed, so a new ROM's boot and vbmeta images are rewritten to carry the
//! indices currently on the device.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use ltbox_core::prelude::*;
use ltbox_device::ToolRunner;

use crate::avb::{AvbCodec, AvbImageInfo, FooterOverrides};

/// Outcome of comparing device and ROM rollback indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackStatus {
    Match,
    NeedsPatch,
    MissingNew,
    Error,
}

impl fmt::Display for RollbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RollbackStatus::Match => "MATCH",
            RollbackStatus::NeedsPatch => "NEEDS_PATCH",
            RollbackStatus::MissingNew => "MISSING_NEW",
            RollbackStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Result of one [`compare`] call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackComparison {
    pub status: RollbackStatus,
    pub current_boot_index: u64,
    pub current_vbmeta_index: u64,
    pub new_boot_index: Option<u64>,
    pub new_vbmeta_index: Option<u64>,
    /// Why the comparison ended in `Error` or `MissingNew`
    pub detail: Option<String>,
}

impl RollbackComparison {
    pub fn from_indices(current_boot: u64, current_vbmeta: u64, new_boot: u64, new_vbmeta: u64) -> Self {
        let status = if new_boot == current_boot && new_vbmeta == current_vbmeta {
            RollbackStatus::Match
        } else {
            RollbackStatus::NeedsPatch
        };
        Self {
            status,
            current_boot_index: current_boot,
            current_vbmeta_index: current_vbmeta,
            new_boot_index: Some(new_boot),
            new_vbmeta_index: Some(new_vbmeta),
            detail: None,
        }
    }

    fn failed(status: RollbackStatus, current: Option<(u64, u64)>, detail: String) -> Self {
        let (current_boot_index, current_vbmeta_index) = current.unwrap_or_default();
        Self {
            status,
            current_boot_index,
            current_vbmeta_index,
            new_boot_index: None,
            new_vbmeta_index: None,
            detail: Some(detail),
        }
    }

    pub fn needs_patch(&self) -> bool {
        self.status == RollbackStatus::NeedsPatch
    }
}

/// Compare the dumped device images against the new ROM images
///
/// Equal indices on both images is `Match`; any difference, up or down, is
/// `NeedsPatch`.
pub fn compare(
    dumped_boot: &Path,
    dumped_vbmeta: &Path,
    new_boot: &Path,
    new_vbmeta: &Path,
) -> RollbackComparison {
    let current = match (crate::avb::extract(dumped_boot), crate::avb::extract(dumped_vbmeta)) {
        (Ok(boot), Ok(vbmeta)) => (boot.rollback_index, vbmeta.rollback_index),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to read rollback index from dumped images: {}", e);
            return RollbackComparison::failed(RollbackStatus::Error, None, e.to_string());
        }
    };
    info!(
        "Device rollback indices: boot={}, vbmeta_system={}",
        current.0, current.1
    );

    if let Some(missing) = [new_boot, new_vbmeta].into_iter().find(|p| !p.is_file()) {
        warn!("New ROM image missing: {}", missing.display());
        return RollbackComparison::failed(
            RollbackStatus::MissingNew,
            Some(current),
            format!("{} not found", missing.display()),
        );
    }

    let new = match (crate::avb::extract(new_boot), crate::avb::extract(new_vbmeta)) {
        (Ok(boot), Ok(vbmeta)) => (boot.rollback_index, vbmeta.rollback_index),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to read rollback index from new ROM images: {}", e);
            return RollbackComparison::failed(RollbackStatus::Error, Some(current), e.to_string());
        }
    };
    info!("ROM rollback indices: boot={}, vbmeta_system={}", new.0, new.1);

    let comparison = RollbackComparison::from_indices(current.0, current.1, new.0, new.1);
    info!("Rollback comparison: {}", comparison.status);
    comparison
}

/// The rebuilt boot and vbmeta images
#[derive(Debug, Clone)]
pub struct PatchedPair {
    pub boot: AvbImageInfo,
    pub vbmeta: AvbImageInfo,
}

/// Rewrites a new ROM's rollback indices to the device's current ones
pub struct RollbackPatcher<'a, R> {
    codec: AvbCodec<'a, R>,
}

impl<'a, R: ToolRunner> RollbackPatcher<'a, R> {
    pub fn new(codec: AvbCodec<'a, R>) -> Self {
        Self { codec }
    }

    /// Write patched copies of `new_boot` and `new_vbmeta` into `output_dir`
    ///
    /// Only a `NeedsPatch` comparison is accepted. If anything fails after
    /// `output_dir` was recreated the directory is removed again, so a
    /// half-written pair never survives.
    pub async fn patch(
        &self,
        comparison: &RollbackComparison,
        new_boot: &Path,
        new_vbmeta: &Path,
        output_dir: &Path,
    ) -> Result<PatchedPair> {
        if !comparison.needs_patch() {
            error!(
                "Refusing rollback patch for a comparison with status {}",
                comparison.status
            );
            return Err(Error::InvalidComparison {
                status: comparison.status.to_string(),
            });
        }

        if output_dir.exists() {
            tokio::fs::remove_dir_all(output_dir)
                .await
                .map_err(|e| Error::file(output_dir, e))?;
        }
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| Error::file(output_dir, e))?;

        match self
            .patch_into(comparison, new_boot, new_vbmeta, output_dir)
            .await
        {
            Ok(pair) => Ok(pair),
            Err(e) => {
                error!("Rollback patch failed, removing {}: {}", output_dir.display(), e);
                if let Err(cleanup) = tokio::fs::remove_dir_all(output_dir).await {
                    warn!("Failed to remove {}: {}", output_dir.display(), cleanup);
                }
                Err(Error::integrity_abort(output_dir, e))
            }
        }
    }

    async fn patch_into(
        &self,
        comparison: &RollbackComparison,
        new_boot: &Path,
        new_vbmeta: &Path,
        output_dir: &Path,
    ) -> Result<PatchedPair> {
        let boot_info = self.codec.extract(new_boot)?;
        let boot_out = output_dir.join(file_name_or(new_boot, "boot.img"));
        info!(
            "Patching boot rollback index {} -> {}",
            boot_info.rollback_index, comparison.current_boot_index
        );
        let boot = self
            .codec
            .rebuild_hash_footer(
                new_boot,
                &boot_out,
                &boot_info,
                &FooterOverrides::rollback_index(comparison.current_boot_index),
            )
            .await?;

        let vbmeta_info = self.codec.extract(new_vbmeta)?;
        let chained = chained_images(&vbmeta_info, new_vbmeta, &boot, &boot_out);
        let vbmeta_out = output_dir.join(file_name_or(new_vbmeta, "vbmeta_system.img"));
        info!(
            "Patching vbmeta rollback index {} -> {}",
            vbmeta_info.rollback_index, comparison.current_vbmeta_index
        );
        let vbmeta = self
            .codec
            .rebuild_vbmeta_image(
                &vbmeta_out,
                &vbmeta_info,
                &chained,
                &FooterOverrides::rollback_index(comparison.current_vbmeta_index),
            )
            .await?;

        Ok(PatchedPair { boot, vbmeta })
    }
}

/// Images whose descriptors the rebuilt vbmeta must carry
///
/// The vbmeta image itself comes first, then the patched boot if vbmeta
/// covers it, then `<partition>.img` next to the vbmeta image for every
/// other hash descriptor.
fn chained_images(
    vbmeta: &AvbImageInfo,
    vbmeta_path: &Path,
    patched_boot: &AvbImageInfo,
    patched_boot_path: &Path,
) -> Vec<PathBuf> {
    let sibling_dir = vbmeta_path.parent().unwrap_or_else(|| Path::new("."));
    let boot_partition = patched_boot.partition_name.as_deref();

    let mut chained = vec![vbmeta_path.to_path_buf()];
    for partition in vbmeta.hash_partitions() {
        if Some(partition) == boot_partition {
            chained.push(patched_boot_path.to_path_buf());
        } else {
            chained.push(sibling_dir.join(format!("{}.img", partition)));
        }
    }
    debug!("vbmeta chain: {:?}", chained);
    chained
}

fn file_name_or(path: &Path, fallback: &str) -> PathBuf {
    path.file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(fallback))
}
