//! Emergency download mode: port discovery and exclusive port leases

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use fs2::FileExt;
use regex::Regex;

use ltbox_core::prelude::*;
use ltbox_core::{DeviceMode, EdlPort};

use crate::env::DeviceEnv;
use crate::process::{Invocation, ToolRunner};

/// Matches the COM port in a PnP friendly name, e.g.
/// `Qualcomm HS-USB QDLoader 9008 (COM7)`
static COM_PORT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((COM\d+)\)").expect("Invalid COM port regex"));

const PNP_QUERY: &str = "Get-PnpDevice -PresentOnly | \
    Where-Object { $_.FriendlyName -match 'QDLoader 9008' } | \
    Select-Object -ExpandProperty FriendlyName";

/// First QDLoader COM port named in PowerShell PnP output
pub fn parse_pnp_ports(stdout: &str) -> Option<EdlPort> {
    stdout
        .lines()
        .filter(|line| line.contains("9008"))
        .find_map(|line| COM_PORT_PATTERN.captures(line))
        .map(|caps| EdlPort::Com(caps[1].to_string()))
}

/// Look for a device in EDL mode
///
/// Windows hosts query PnP through PowerShell; other hosts scan the
/// serial-by-id directory for Qualcomm download-mode interfaces.
pub async fn probe<R: ToolRunner>(env: &DeviceEnv<R>) -> Result<Option<EdlPort>> {
    if cfg!(windows) {
        probe_pnp(env).await
    } else {
        scan_serial_dir(&env.serial_by_id_dir)
    }
}

async fn probe_pnp<R: ToolRunner>(env: &DeviceEnv<R>) -> Result<Option<EdlPort>> {
    let inv = Invocation::new(&env.tools.powershell).args(["-NoProfile", "-Command", PNP_QUERY]);
    let out = env
        .run(inv)
        .await
        .map_err(|e| Error::connection(DeviceMode::Edl, format!("cannot query PnP devices: {}", e)))?;
    if !out.success() {
        return Ok(None);
    }
    Ok(parse_pnp_ports(&out.stdout))
}

/// Scan a `/dev/serial/by-id` style directory for a QDLoader interface
pub fn scan_serial_dir(dir: &Path) -> Result<Option<EdlPort>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::connection(
                DeviceMode::Edl,
                format!("cannot scan {}: {}", dir.display(), e),
            ))
        }
    };

    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .is_some_and(|name| name.contains("qdloader") || name.contains("qualcomm"))
        })
        .collect();
    candidates.sort();

    Ok(candidates
        .into_iter()
        .next()
        .map(|path| EdlPort::Device(dunce::canonicalize(&path).unwrap_or(path))))
}

/// Exclusive advisory lock on one EDL port
///
/// Held for as long as a session owns the EDL transport; released on drop.
#[derive(Debug)]
pub struct PortLease {
    file: File,
    path: PathBuf,
}

impl PortLease {
    pub fn acquire(lock_dir: &Path, port: &EdlPort) -> Result<Self> {
        std::fs::create_dir_all(lock_dir).map_err(|e| Error::file(lock_dir, e))?;
        let path = lock_dir.join(format!("{}.lock", port.lock_name()));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::file(&path, e))?;

        file.try_lock_exclusive().map_err(|_| {
            Error::connection(
                DeviceMode::Edl,
                format!("port {} is already held by another session", port),
            )
        })?;
        debug!("Acquired EDL port lease {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release EDL port lease {}: {}", self.path.display(), e);
        }
    }
}

/// Exclusive handle on a device in EDL mode
#[derive(Debug)]
pub struct EdlLink {
    port: EdlPort,
    programmer_loaded: bool,
    _lease: PortLease,
}

impl EdlLink {
    /// Lease the port and open a link with no programmer loaded
    pub fn open(port: EdlPort, lock_dir: &Path) -> Result<Self> {
        let lease = PortLease::acquire(lock_dir, &port)?;
        Ok(Self {
            port,
            programmer_loaded: false,
            _lease: lease,
        })
    }

    pub fn port(&self) -> &EdlPort {
        &self.port
    }

    pub fn programmer_loaded(&self) -> bool {
        self.programmer_loaded
    }

    pub(crate) fn set_programmer_loaded(&mut self, loaded: bool) {
        self.programmer_loaded = loaded;
    }
}
