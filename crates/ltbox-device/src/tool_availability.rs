//! Location of the external executables the device layer drives
//!
//! Each tool is looked up in order: an explicit configured path, the bundled
//! tools directory, then `PATH`. Tools that cannot be located keep their bare
//! name so the runner reports [`Error::ToolNotFound`] when first used.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ltbox_core::prelude::*;

/// Configured overrides, usually from the `[tools]` section of `ltbox.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolOverrides {
    pub adb: Option<PathBuf>,
    pub fastboot: Option<PathBuf>,
    pub sahara_server: Option<PathBuf>,
    pub fh_loader: Option<PathBuf>,
    /// Command used for EDL port queries on Windows
    pub powershell: Option<PathBuf>,
}

/// Resolved executable paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub adb: PathBuf,
    pub fastboot: PathBuf,
    pub sahara_server: PathBuf,
    pub fh_loader: PathBuf,
    pub powershell: PathBuf,
}

impl Default for ToolPaths {
    /// Bare tool names, resolved by the OS at spawn time
    fn default() -> Self {
        Self {
            adb: PathBuf::from("adb"),
            fastboot: PathBuf::from("fastboot"),
            sahara_server: PathBuf::from("QSaharaServer"),
            fh_loader: PathBuf::from("fh_loader"),
            powershell: PathBuf::from("powershell"),
        }
    }
}

impl ToolPaths {
    /// Resolve every tool (run once at startup)
    pub fn resolve(overrides: &ToolOverrides, tools_dir: Option<&Path>) -> Self {
        Self {
            adb: locate("adb", overrides.adb.as_deref(), tools_dir),
            fastboot: locate("fastboot", overrides.fastboot.as_deref(), tools_dir),
            sahara_server: locate("QSaharaServer", overrides.sahara_server.as_deref(), tools_dir),
            fh_loader: locate("fh_loader", overrides.fh_loader.as_deref(), tools_dir),
            powershell: locate("powershell", overrides.powershell.as_deref(), None),
        }
    }

    /// Names of the device tools that could not be located
    pub fn missing(&self) -> Vec<&'static str> {
        [
            ("adb", &self.adb),
            ("fastboot", &self.fastboot),
            ("QSaharaServer", &self.sahara_server),
            ("fh_loader", &self.fh_loader),
        ]
        .into_iter()
        .filter(|(_, path)| !is_available(path))
        .map(|(name, _)| name)
        .collect()
    }
}

/// Locate one tool by name
fn locate(name: &str, configured: Option<&Path>, tools_dir: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        return dunce::canonicalize(path).unwrap_or_else(|e| {
            warn!("Configured path for {} is not usable ({}): {}", name, e, path.display());
            path.to_path_buf()
        });
    }

    if let Some(dir) = tools_dir {
        let candidate = dir.join(executable_name(name));
        if candidate.is_file() {
            debug!("Using bundled {}: {}", name, candidate.display());
            return dunce::simplified(&candidate).to_path_buf();
        }
    }

    match which::which(name) {
        Ok(path) => {
            debug!("Using {} from PATH: {}", name, path.display());
            path
        }
        Err(_) => {
            debug!("{} not found, deferring to spawn-time lookup", name);
            PathBuf::from(name)
        }
    }
}

fn is_available(path: &Path) -> bool {
    if path.components().count() > 1 || path.is_absolute() {
        path.is_file()
    } else {
        which::which(path).is_ok()
    }
}

/// Platform executable file name
fn executable_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}
