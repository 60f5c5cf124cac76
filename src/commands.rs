//! Subcommand dispatch
//!
//! Maps each [`Command`] onto one [`Operations`] call, filling in the
//! defaults from the configured folders.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ltbox_app::{
    LtboxConfig, Operations, PathSettings, PatchedPairSummary, WrittenPartition,
    DEFAULT_DUMP_TARGETS, ROLLBACK_BOOT_IMAGE, ROLLBACK_VBMETA_IMAGE,
};
use ltbox_core::prelude::*;
use ltbox_core::SlotSuffix;
use ltbox_device::{ProcessRunner, ToolRunner};
use ltbox_image::{kernel_version_of, RollbackComparison, RollbackStatus};

use crate::cli::{Args, Command};
use crate::output::Output;

/// Load the configuration, apply the global flags and run the command
pub async fn run(args: Args) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let mut config = LtboxConfig::load(args.config.as_deref(), &cwd)?;
    apply_flags(&mut config, &args);

    info!("Image folder: {}", config.paths.image_dir.display());
    if args.skip_adb {
        info!("adb disabled for this run");
    }

    let ops = Operations::new(config, ProcessRunner, !args.skip_adb);
    dispatch(&ops, args.command, Output::new(args.json)).await
}

/// Global and per-command flags that override `ltbox.toml`
pub fn apply_flags(config: &mut LtboxConfig, args: &Args) {
    if args.no_reboot {
        config.behavior.reboot_after = false;
    }
    if let Command::FlashAll { skip_dp: true, .. } = args.command {
        config.behavior.skip_dp = true;
    }
}

pub async fn dispatch<R: ToolRunner>(ops: &Operations<R>, command: Command, out: Output) -> Result<()> {
    let paths = ops.config().paths.clone();

    match command {
        Command::DetectSlot => {
            let slot = ops.detect_slot().await?;
            out.emit(&slot, |slot| match slot {
                Some(SlotSuffix::None) => "Device is not A/B".to_string(),
                Some(slot) => format!("Active slot: {}", slot),
                None => "Active slot could not be determined".to_string(),
            })
        }

        Command::Read { labels, output } => {
            let labels = if labels.is_empty() {
                DEFAULT_DUMP_TARGETS.iter().map(|s| s.to_string()).collect()
            } else {
                labels
            };
            let output = output.unwrap_or_else(|| paths.backup_dir.clone());
            let report = ops.read_partitions(&labels, &output).await?;
            out.emit(&report, |r| {
                let mut lines: Vec<String> = r
                    .read
                    .iter()
                    .map(|p| format!("read    {} -> {}", p.label, p.path.display()))
                    .collect();
                lines.extend(r.skipped.iter().map(|s| format!("skipped {}: {}", s.label, s.reason)));
                lines.extend(r.failed.iter().map(|s| format!("failed  {}: {}", s.label, s.reason)));
                lines.join("\n")
            })
        }

        Command::Write { images } => {
            let images: BTreeMap<String, PathBuf> = images.into_iter().collect();
            let written = ops.write_partitions(&images).await?;
            out.emit(&written, |w| {
                w.iter()
                    .map(|p| format!("wrote {} -> {} (LUN {})", p.image.display(), p.label, p.lun))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }

        Command::WriteAntiRollback => {
            let images = anti_rollback_images(&paths);
            let written = ops.write_partitions(&images).await?;
            out.emit(&written, |w| {
                w.iter()
                    .map(|p| format!("wrote {} -> {}", p.image.display(), p.label))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }

        Command::DumpBoot => {
            let dumped = ops.dump_boot().await?;
            out.emit(&dumped, |d| format!("Stock {} saved to {}", d.label, d.path.display()))
        }

        Command::FlashBoot { image } => {
            let written = ops.flash_boot(&image).await?;
            out.emit(&written, describe_boot_write)
        }

        Command::Unroot => {
            let written = ops.restore_boot().await?;
            out.emit(&written, describe_boot_write)
        }

        Command::CompareRollback {
            boot,
            vbmeta,
            from_device,
        } => {
            let (boot, vbmeta) = if from_device {
                dump_rollback_images(ops, &paths).await?
            } else {
                dumped_images(&paths, boot, vbmeta)
            };
            let comparison = ops.compare_rollback(&boot, &vbmeta);
            out.emit(&comparison, describe_comparison)
        }

        Command::PatchRollback {
            boot,
            vbmeta,
            output,
        } => {
            let (boot, vbmeta) = dumped_images(&paths, boot, vbmeta);
            let comparison = ops.compare_rollback(&boot, &vbmeta);
            info!("{}", describe_comparison(&comparison));
            if comparison.status != RollbackStatus::NeedsPatch {
                return out.emit(&comparison, describe_comparison);
            }

            let output = output.unwrap_or_else(|| paths.output_anti_rollback_dir.clone());
            let pair = ops
                .patch_rollback(
                    &comparison,
                    &paths.image_dir.join(ROLLBACK_BOOT_IMAGE),
                    &paths.image_dir.join(ROLLBACK_VBMETA_IMAGE),
                    &output,
                )
                .await?;
            out.emit(&PatchedPairSummary::from(&pair), |p| {
                format!(
                    "boot: {} (index {})\nvbmeta_system: {} (index {})",
                    p.boot.path.display(),
                    p.boot.rollback_index,
                    p.vbmeta.path.display(),
                    p.vbmeta.rollback_index
                )
            })
        }

        Command::FlashAll {
            image_dir, loader, ..
        } => {
            let image_dir = image_dir.unwrap_or_else(|| paths.image_dir.clone());
            let loader = loader.unwrap_or_else(|| paths.loader.clone());
            let report = ops.flash_all(&image_dir, &loader).await?;
            out.emit(&report, |r| {
                format!(
                    "Flashed {} raw program and {} patch descriptor(s), {} file(s) copied from output folders",
                    r.raw.len(),
                    r.patch.len(),
                    r.copied_files
                )
            })
        }

        Command::ConvertRegion {
            vendor_boot,
            vbmeta,
            output,
            model,
        } => {
            let vendor_boot = vendor_boot.unwrap_or_else(|| paths.image_dir.join("vendor_boot.img"));
            let vbmeta = vbmeta.unwrap_or_else(|| paths.image_dir.join("vbmeta.img"));
            let output = output.unwrap_or_else(|| paths.output_dir.clone());
            let result = ops
                .convert_region(&vendor_boot, &vbmeta, &output, model.as_deref())
                .await?;
            out.emit(&result, |r| {
                format!(
                    "{:?}\nvendor_boot: {}\nvbmeta: {}",
                    r.conversion,
                    r.vendor_boot.path.display(),
                    r.vbmeta.path.display()
                )
            })
        }

        Command::PatchRegionCodes {
            code,
            images,
            output,
        } => {
            let images = if images.is_empty() {
                DEFAULT_DUMP_TARGETS
                    .iter()
                    .map(|label| paths.backup_dir.join(format!("{}.img", label)))
                    .collect()
            } else {
                images
            };
            let output = output.unwrap_or_else(|| paths.output_dp_dir.clone());
            let report = ops.patch_region_codes(&images, &code, &output).await?;
            out.emit(&report, |r| {
                let mut lines = vec![format!("Backup: {}", r.backup_dir.display())];
                for patch in &r.patches {
                    lines.push(match (&patch.detected, &patch.output) {
                        (Some(code), Some(path)) => {
                            format!("{}: {} -> {}", patch.image.display(), code, path.display())
                        }
                        _ => format!("{}: no country code found", patch.image.display()),
                    });
                }
                lines.join("\n")
            })
        }

        Command::WriteFastboot { images } => {
            let images = if images.is_empty() {
                dp_images(&paths)
            } else {
                images.into_iter().collect()
            };
            let flashed = ops.write_fastboot(&images).await?;
            out.emit(&flashed, |f| format!("Flashed: {}", f.join(", ")))
        }

        Command::DisableOta => {
            let disabled = ops.disable_ota().await?;
            out.emit(&disabled, |d| {
                if *d {
                    "OTA updater disabled".to_string()
                } else {
                    "OTA updater state not confirmed".to_string()
                }
            })
        }

        Command::KernelVersion { image } => {
            let image = image.unwrap_or_else(|| paths.image_dir.join(ROLLBACK_BOOT_IMAGE));
            let version = kernel_version_of(&image)?;
            out.emit(&version, |v| match v {
                Some(v) => v.clone(),
                None => format!("No kernel version banner in {}", image.display()),
            })
        }
    }
}

/// Dumped device images, defaulting to the backup folder
fn dumped_images(paths: &PathSettings, boot: Option<PathBuf>, vbmeta: Option<PathBuf>) -> (PathBuf, PathBuf) {
    (
        boot.unwrap_or_else(|| paths.backup_dir.join(ROLLBACK_BOOT_IMAGE)),
        vbmeta.unwrap_or_else(|| paths.backup_dir.join(ROLLBACK_VBMETA_IMAGE)),
    )
}

/// Read boot and vbmeta_system of the active slot into the backup folder
async fn dump_rollback_images<R: ToolRunner>(
    ops: &Operations<R>,
    paths: &PathSettings,
) -> Result<(PathBuf, PathBuf)> {
    let slot = ops.detect_slot().await?.unwrap_or_default();
    let labels = vec![slot.apply("boot"), slot.apply("vbmeta_system")];
    let report = ops.read_partitions(&labels, &paths.backup_dir).await?;

    let dumped = |label: &str| -> Result<PathBuf> {
        report
            .read
            .iter()
            .find(|p| p.label == label)
            .map(|p| p.path.clone())
            .ok_or_else(|| Error::missing_image(paths.backup_dir.join(format!("{}.img", label))))
    };
    Ok((dumped(&labels[0])?, dumped(&labels[1])?))
}

/// Rollback-patched images written by `write-anti-rollback`
pub fn anti_rollback_images(paths: &PathSettings) -> BTreeMap<String, PathBuf> {
    BTreeMap::from([
        (
            "boot".to_string(),
            paths.output_anti_rollback_dir.join(ROLLBACK_BOOT_IMAGE),
        ),
        (
            "vbmeta_system".to_string(),
            paths.output_anti_rollback_dir.join(ROLLBACK_VBMETA_IMAGE),
        ),
    ])
}

/// Patched devinfo and persist written by `write-fastboot`
pub fn dp_images(paths: &PathSettings) -> BTreeMap<String, PathBuf> {
    DEFAULT_DUMP_TARGETS
        .iter()
        .map(|label| (label.to_string(), paths.output_dp_dir.join(format!("{}.img", label))))
        .collect()
}

fn describe_boot_write(w: &WrittenPartition) -> String {
    format!("Flashed {} to {} (LUN {})", w.image.display(), w.label, w.lun)
}

fn describe_comparison(c: &RollbackComparison) -> String {
    let mut text = format!(
        "{}: boot {} -> {}, vbmeta_system {} -> {}",
        c.status,
        c.current_boot_index,
        index_or_dash(c.new_boot_index),
        c.current_vbmeta_index,
        index_or_dash(c.new_vbmeta_index)
    );
    if let Some(detail) = &c.detail {
        text.push_str(&format!(" ({})", detail));
    }
    text
}

fn index_or_dash(index: Option<u64>) -> String {
    index.map_or_else(|| "-".to_string(), |i| i.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::path::Path;

    #[test]
    fn test_no_reboot_and_skip_dp_flags() {
        let args = Args::parse_from(["ltbox", "--no-reboot", "flash-all", "--skip-dp"]);
        let mut config = LtboxConfig::default();
        apply_flags(&mut config, &args);
        assert!(!config.behavior.reboot_after);
        assert!(config.behavior.skip_dp);

        let args = Args::parse_from(["ltbox", "read"]);
        let mut config = LtboxConfig::default();
        apply_flags(&mut config, &args);
        assert!(config.behavior.reboot_after);
        assert!(!config.behavior.skip_dp);
    }

    #[test]
    fn test_default_image_sets() {
        let config = LtboxConfig::default().rooted_at(Path::new("/work"));
        let arb = anti_rollback_images(&config.paths);
        assert_eq!(arb["boot"], Path::new("/work/output_anti_rollback/boot.img"));
        assert_eq!(
            arb["vbmeta_system"],
            Path::new("/work/output_anti_rollback/vbmeta_system.img")
        );

        let dp = dp_images(&config.paths);
        assert_eq!(dp.len(), 2);
        assert_eq!(dp["persist"], Path::new("/work/output_dp/persist.img"));
    }

    #[test]
    fn test_describe_comparison() {
        let c = RollbackComparison::from_indices(3, 3, 5, 4);
        let text = describe_comparison(&c);
        assert!(text.contains("boot 3 -> 5"));
        assert!(text.contains("vbmeta_system 3 -> 4"));
    }
}
