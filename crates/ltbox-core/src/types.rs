//! Shared device domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The interface the device currently exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    /// Not probed yet, or no probe answered
    #[default]
    Unknown,
    /// Booted Android with the debug bridge reachable
    System,
    /// Fastboot
    Bootloader,
    /// Emergency download (Qualcomm QDLoader 9008)
    Edl,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceMode::Unknown => "unknown",
            DeviceMode::System => "system",
            DeviceMode::Bootloader => "bootloader",
            DeviceMode::Edl => "EDL",
        };
        f.write_str(name)
    }
}

/// A/B slot suffix as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SlotSuffix {
    /// Non-A/B device, or the slot could not be learned
    #[default]
    None,
    A,
    B,
}

impl SlotSuffix {
    /// Suffix string appended to partition labels
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotSuffix::None => "",
            SlotSuffix::A => "_a",
            SlotSuffix::B => "_b",
        }
    }

    /// Parse device output such as `_a`, `a`, or ``
    ///
    /// Returns `None` for anything that is not a recognised slot.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().trim_start_matches('_') {
            "" => Some(SlotSuffix::None),
            "a" | "A" => Some(SlotSuffix::A),
            "b" | "B" => Some(SlotSuffix::B),
            _ => None,
        }
    }

    /// Apply the suffix to a partition label
    pub fn apply(&self, label: &str) -> String {
        format!("{}{}", label, self.as_str())
    }
}

impl fmt::Display for SlotSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backing storage of the device, selects `--memoryname` and sector size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Ufs,
    Emmc,
}

impl StorageType {
    pub fn sector_size(&self) -> u64 {
        match self {
            StorageType::Ufs => 4096,
            StorageType::Emmc => 512,
        }
    }

    /// Value passed to the loader as `--memoryname=`
    pub fn memory_name(&self) -> &'static str {
        match self {
            StorageType::Ufs => "UFS",
            StorageType::Emmc => "eMMC",
        }
    }
}

/// Serial endpoint the device exposes in EDL mode
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EdlPort {
    /// Windows COM port, e.g. `COM7`
    Com(String),
    /// Unix device node, e.g. `/dev/ttyUSB0`
    Device(PathBuf),
}

impl EdlPort {
    /// Form the loaders accept in `--port=` and `-p`
    pub fn loader_arg(&self) -> String {
        match self {
            EdlPort::Com(name) => format!("\\\\.\\{}", name),
            EdlPort::Device(path) => path.display().to_string(),
        }
    }

    /// Filesystem-safe name used for the port lock file
    pub fn lock_name(&self) -> String {
        let raw = match self {
            EdlPort::Com(name) => name.clone(),
            EdlPort::Device(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "edl".to_string()),
        };
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for EdlPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdlPort::Com(name) => f.write_str(name),
            EdlPort::Device(path) => write!(f, "{}", path.display()),
        }
    }
}
