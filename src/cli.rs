//! Command-line arguments

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// LTBox - Flashing, region conversion and anti-rollback patching for Lenovo tablets
#[derive(Parser, Debug)]
#[command(name = "ltbox")]
#[command(about = "Flashing, region conversion and anti-rollback patching for Lenovo tablets", long_about = None)]
#[command(version)]
pub struct Args {
    /// Path to ltbox.toml (defaults to LTBOX_CONFIG, then ./ltbox.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Never use adb; the device is assumed to be in system mode when unknown
    #[arg(long, global = true)]
    pub skip_adb: bool,

    /// Leave the device in its last mode instead of rebooting to system
    #[arg(long, global = true)]
    pub no_reboot: bool,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the active A/B slot
    DetectSlot,

    /// Dump partitions over EDL
    Read {
        /// Partition labels (defaults to devinfo and persist)
        labels: Vec<String>,

        /// Destination folder (defaults to the backup folder)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Write images to partitions over EDL
    Write {
        /// `label=image` pairs, e.g. `devinfo=output_dp/devinfo.img`
        #[arg(required = true, value_parser = parse_image_arg)]
        images: Vec<(String, PathBuf)>,
    },

    /// Write the rollback-patched boot and vbmeta_system to the active slot
    WriteAntiRollback,

    /// Compare the device's rollback indices against the new ROM
    CompareRollback {
        /// Dumped boot image (defaults to the backup folder)
        #[arg(long)]
        boot: Option<PathBuf>,

        /// Dumped vbmeta_system image (defaults to the backup folder)
        #[arg(long)]
        vbmeta: Option<PathBuf>,

        /// Dump boot and vbmeta_system of the active slot first
        #[arg(long)]
        from_device: bool,
    },

    /// Rewrite the new ROM's rollback indices to the device's current ones
    PatchRollback {
        #[arg(long)]
        boot: Option<PathBuf>,

        #[arg(long)]
        vbmeta: Option<PathBuf>,

        /// Destination folder (defaults to output_anti_rollback)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Back up the active slot's boot partition before root patching
    DumpBoot,

    /// Flash a patched boot image to the active slot over EDL
    FlashBoot {
        /// Patched boot image
        image: PathBuf,
    },

    /// Flash the stock boot backup back to the active slot
    Unroot,

    /// Flash a complete firmware folder
    FlashAll {
        /// Firmware folder (defaults to the configured image folder)
        #[arg(long)]
        image_dir: Option<PathBuf>,

        /// Firehose programmer (defaults to the configured loader)
        #[arg(long)]
        loader: Option<PathBuf>,

        /// Keep the device's devinfo and persist
        #[arg(long)]
        skip_dp: bool,
    },

    /// Convert a ROW vendor_boot to PRC and re-sign vbmeta
    ConvertRegion {
        #[arg(long)]
        vendor_boot: Option<PathBuf>,

        #[arg(long)]
        vbmeta: Option<PathBuf>,

        /// Destination folder (defaults to the output folder)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Refuse firmware whose fingerprint does not mention this model
        #[arg(long)]
        model: Option<String>,
    },

    /// Replace the country code in devinfo and persist
    PatchRegionCodes {
        /// Two-character replacement code; `00` asks on first boot
        #[arg(long)]
        code: String,

        /// Images to patch (defaults to devinfo and persist in the backup folder)
        images: Vec<PathBuf>,

        /// Destination folder (defaults to output_dp)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Flash devinfo and persist from bootloader mode
    WriteFastboot {
        /// `label=image` pairs (defaults to devinfo and persist in output_dp)
        #[arg(value_parser = parse_image_arg)]
        images: Vec<(String, PathBuf)>,
    },

    /// Disable the vendor OTA updater over adb
    DisableOta,

    /// Print the kernel version embedded in a boot image
    KernelVersion {
        /// Image to scan (defaults to boot.img in the image folder)
        image: Option<PathBuf>,
    },
}

/// Parse `label=path`
pub fn parse_image_arg(s: &str) -> Result<(String, PathBuf), String> {
    let (label, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected label=image, got '{}'", s))?;
    let label = label.trim();
    if label.is_empty() || path.is_empty() {
        return Err(format!("expected label=image, got '{}'", s));
    }
    Ok((label.to_string(), PathBuf::from(path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_arg() {
        assert_eq!(
            parse_image_arg("devinfo=output_dp/devinfo.img").unwrap(),
            ("devinfo".to_string(), PathBuf::from("output_dp/devinfo.img"))
        );
        assert!(parse_image_arg("devinfo").is_err());
        assert!(parse_image_arg("=x.img").is_err());
        assert!(parse_image_arg("boot=").is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::parse_from(["ltbox", "read", "frp", "--skip-adb", "--json"]);
        assert!(args.skip_adb);
        assert!(args.json);
        assert_eq!(
            args.command,
            Command::Read {
                labels: vec!["frp".to_string()],
                output: None
            }
        );
    }

    #[test]
    fn test_write_requires_images() {
        assert!(Args::try_parse_from(["ltbox", "write"]).is_err());
        let args = Args::try_parse_from(["ltbox", "write", "boot=boot.img"]).unwrap();
        assert!(matches!(args.command, Command::Write { ref images } if images.len() == 1));
    }

    #[test]
    fn test_boot_commands() {
        assert_eq!(Args::parse_from(["ltbox", "dump-boot"]).command, Command::DumpBoot);
        assert_eq!(Args::parse_from(["ltbox", "unroot"]).command, Command::Unroot);
        assert!(Args::try_parse_from(["ltbox", "flash-boot"]).is_err());
        assert_eq!(
            Args::parse_from(["ltbox", "flash-boot", "output_root/boot.img"]).command,
            Command::FlashBoot {
                image: PathBuf::from("output_root/boot.img")
            }
        );
    }

    #[test]
    fn test_flash_all_options() {
        let args = Args::parse_from(["ltbox", "--no-reboot", "flash-all", "--skip-dp"]);
        assert!(args.no_reboot);
        assert_eq!(
            args.command,
            Command::FlashAll {
                image_dir: None,
                loader: None,
                skip_dp: true
            }
        );
    }
}
