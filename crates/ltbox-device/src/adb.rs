//! System-mode bridge (`adb`)

use ltbox_core::prelude::*;
use ltbox_core::{DeviceMode, SlotSuffix};

use crate::env::DeviceEnv;
use crate::process::{Invocation, ToolRunner};

/// Package disabled by [`disable_ota`]
pub const OTA_PACKAGE: &str = "com.lenovo.ota";

/// Why a system-mode slot query did not produce a slot
///
/// Every variant falls back to the bootloader-mode query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotQueryFailure {
    /// `adb` could not be started
    AdbUnavailable,
    /// `adb` ran but exited non-zero for another reason
    ToolFailed { code: Option<i32> },
    /// The query did not finish within the configured bound
    Timeout,
    /// No authorised device answered
    DeviceAbsent,
    /// `ro.boot.slot_suffix` is empty or unrecognised
    EmptyProperty,
}

/// Outcome of `adb shell getprop ro.boot.slot_suffix`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotQuery {
    Found(SlotSuffix),
    Fallback(SlotQueryFailure),
}

/// Serials in the `device` state from `adb devices` output
///
/// `unauthorized`, `offline` and `recovery` entries are ignored.
pub fn parse_devices(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Serial of the first device reachable over adb
///
/// A tool that cannot be started is a [`Error::Connection`]; a non-zero exit
/// counts as "no device".
pub async fn probe<R: ToolRunner>(env: &DeviceEnv<R>) -> Result<Option<String>> {
    let out = env
        .run(Invocation::new(&env.tools.adb).arg("devices"))
        .await
        .map_err(|e| Error::connection(DeviceMode::System, format!("cannot run adb: {}", e)))?;

    if !out.success() {
        debug!("adb devices exited with {:?}", out.code);
        return Ok(None);
    }
    Ok(parse_devices(&out.stdout).into_iter().next())
}

/// `adb reboot [target]`
pub async fn reboot<R: ToolRunner>(env: &DeviceEnv<R>, target: Option<&str>) -> Result<()> {
    let mut inv = Invocation::new(&env.tools.adb).arg("reboot");
    if let Some(target) = target {
        inv = inv.arg(target);
    }
    env.run(inv).await?.into_checked("adb")?;
    Ok(())
}

/// Ask the running system for its active slot
pub async fn query_slot<R: ToolRunner>(env: &DeviceEnv<R>) -> SlotQuery {
    let inv = Invocation::new(&env.tools.adb).args(["shell", "getprop", "ro.boot.slot_suffix"]);

    let out = match tokio::time::timeout(env.timings.adb_query_timeout(), env.run(inv)).await {
        Err(_) => return SlotQuery::Fallback(SlotQueryFailure::Timeout),
        Ok(Err(e)) => {
            debug!("adb slot query could not run: {}", e);
            return SlotQuery::Fallback(SlotQueryFailure::AdbUnavailable);
        }
        Ok(Ok(out)) => out,
    };

    if !out.success() {
        let stderr = out.stderr.to_lowercase();
        let absent = ["no devices", "device offline", "not found", "unauthorized"]
            .iter()
            .any(|needle| stderr.contains(needle));
        return SlotQuery::Fallback(if absent {
            SlotQueryFailure::DeviceAbsent
        } else {
            SlotQueryFailure::ToolFailed { code: out.code }
        });
    }

    match SlotSuffix::parse(&out.stdout) {
        Some(SlotSuffix::None) => SlotQuery::Fallback(SlotQueryFailure::EmptyProperty),
        Some(slot) => SlotQuery::Found(slot),
        None => {
            warn!("Unrecognised slot suffix from adb: {:?}", out.stdout.trim());
            SlotQuery::Fallback(SlotQueryFailure::EmptyProperty)
        }
    }
}

/// `adb shell pm disable-user --user 0 <package>`
///
/// Returns whether the package manager reported the package as disabled.
pub async fn disable_package<R: ToolRunner>(env: &DeviceEnv<R>, package: &str) -> Result<bool> {
    let inv = Invocation::new(&env.tools.adb).args([
        "shell",
        "pm",
        "disable-user",
        "--user",
        "0",
        package,
    ]);
    let out = env.run(inv).await?.into_checked("adb")?;
    Ok(out.stdout.contains("disabled"))
}
