//! Configuration file parsing for LTBox
//!
//! Everything tunable lives in one `ltbox.toml`:
//!
//! ```toml
//! storage = "ufs"
//!
//! [paths]
//! image_dir = "image"
//! loader = "image/xbl_s_devprg_ns.melf"
//!
//! [timings]
//! read_settle_secs = 5
//!
//! [keys]
//! 2597c218aae470a130f61162feaae70afd97f011 = "key/testkey_rsa4096.pem"
//!
//! [behavior]
//! reboot_after = true
//! skip_dp = false
//! ```
//!
//! Relative paths resolve against the directory holding the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ltbox_core::prelude::*;
use ltbox_core::StorageType;
use ltbox_device::{Timings, ToolOverrides};
use ltbox_image::region::default_country_codes;
use ltbox_image::{AvbToolConfig, CountryCode, KeySelection};

pub const CONFIG_FILENAME: &str = "ltbox.toml";

/// Overrides the config file location when `--config` is not given
pub const CONFIG_ENV: &str = "LTBOX_CONFIG";

/// Application settings (`ltbox.toml`)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LtboxConfig {
    #[serde(default)]
    pub storage: StorageType,

    #[serde(default)]
    pub paths: PathSettings,

    #[serde(default)]
    pub tools: ToolOverrides,

    #[serde(default)]
    pub timings: Timings,

    #[serde(default)]
    pub avb: AvbToolConfig,

    /// Replaces the built-in test keys entirely when present
    #[serde(default)]
    pub keys: KeySelection,

    /// Codes searched for in devinfo and persist, in detection order
    #[serde(default = "default_country_codes")]
    pub countries: Vec<CountryCode>,

    #[serde(default)]
    pub behavior: BehaviorSettings,
}

impl Default for LtboxConfig {
    fn default() -> Self {
        Self {
            storage: StorageType::default(),
            paths: PathSettings::default(),
            tools: ToolOverrides::default(),
            timings: Timings::default(),
            avb: AvbToolConfig::default(),
            keys: KeySelection::default(),
            countries: default_country_codes(),
            behavior: BehaviorSettings::default(),
        }
    }
}

/// Working directories and the EDL programmer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PathSettings {
    /// Firmware folder holding images and `rawprogram*.xml`
    pub image_dir: PathBuf,
    /// Converted vendor_boot and vbmeta
    pub output_dir: PathBuf,
    /// Patched devinfo and persist
    pub output_dp_dir: PathBuf,
    /// Rollback-patched boot and vbmeta_system
    pub output_anti_rollback_dir: PathBuf,
    /// Modified partition descriptors
    pub output_xml_dir: PathBuf,
    /// Partition dumps read from the device
    pub backup_dir: PathBuf,
    /// Stock boot image kept for unrooting
    pub boot_backup_dir: PathBuf,
    pub key_dir: PathBuf,
    /// Bundled `adb`, `fastboot`, `QSaharaServer`, `fh_loader` and `avbtool.py`
    pub tools_dir: PathBuf,
    /// Parent of the scoped scratch directories
    pub work_dir: PathBuf,
    /// Firehose programmer uploaded on every EDL session
    pub loader: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("image"),
            output_dir: PathBuf::from("output"),
            output_dp_dir: PathBuf::from("output_dp"),
            output_anti_rollback_dir: PathBuf::from("output_anti_rollback"),
            output_xml_dir: PathBuf::from("output_xml"),
            backup_dir: PathBuf::from("backup"),
            boot_backup_dir: PathBuf::from("backup_boot"),
            key_dir: PathBuf::from("key"),
            tools_dir: PathBuf::from("tools"),
            work_dir: PathBuf::from("tmp"),
            loader: PathBuf::from("image/xbl_s_devprg_ns.melf"),
        }
    }
}

impl PathSettings {
    fn rooted_at(self, base: &Path) -> Self {
        Self {
            image_dir: base.join(self.image_dir),
            output_dir: base.join(self.output_dir),
            output_dp_dir: base.join(self.output_dp_dir),
            output_anti_rollback_dir: base.join(self.output_anti_rollback_dir),
            output_xml_dir: base.join(self.output_xml_dir),
            backup_dir: base.join(self.backup_dir),
            boot_backup_dir: base.join(self.boot_backup_dir),
            key_dir: base.join(self.key_dir),
            tools_dir: base.join(self.tools_dir),
            work_dir: base.join(self.work_dir),
            loader: base.join(self.loader),
        }
    }
}

/// Behavior settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BehaviorSettings {
    /// Return the device to system after EDL and fastboot operations
    #[serde(default = "default_true")]
    pub reboot_after: bool,

    /// Leave devinfo and persist alone during a full flash
    #[serde(default)]
    pub skip_dp: bool,
}

impl Default for BehaviorSettings {
    fn default() -> Self {
        Self {
            reboot_after: true,
            skip_dp: false,
        }
    }
}

fn default_true() -> bool {
    true
}

impl LtboxConfig {
    /// Load the configuration
    ///
    /// `explicit` (from `--config`) must exist. Otherwise `LTBOX_CONFIG` is
    /// consulted, then `ltbox.toml` in `cwd`; a missing default file yields
    /// the defaults rooted at `cwd`.
    pub fn load(explicit: Option<&Path>, cwd: &Path) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => {
                let path = if path.is_absolute() { path } else { cwd.join(path) };
                if !path.is_file() {
                    return Err(Error::config(format!(
                        "config file {} not found",
                        path.display()
                    )));
                }
                Self::from_file(&path)
            }
            None => {
                let path = cwd.join(CONFIG_FILENAME);
                if path.is_file() {
                    Self::from_file(&path)
                } else {
                    debug!("No config file at {:?}, using defaults", path);
                    Ok(Self::default().rooted_at(cwd))
                }
            }
        }
    }

    /// Parse one file, rooting relative paths at its directory
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::file(path, e))?;
        let config: Self = toml::from_str(&content).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded settings from {:?}", path);

        let base = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(config.rooted_at(&base))
    }

    /// Make every relative path absolute under `base`
    ///
    /// A relative `avb.script` resolves against the tools directory, and the
    /// built-in key table follows `paths.key_dir`.
    pub fn rooted_at(mut self, base: &Path) -> Self {
        self.paths = self.paths.rooted_at(base);
        self.keys = if self.keys == KeySelection::default() {
            KeySelection::standard(&self.paths.key_dir)
        } else {
            self.keys.resolve_relative(base)
        };
        if self.avb.script.is_relative() {
            self.avb.script = self.paths.tools_dir.join(&self.avb.script);
        }
        self
    }
}
