//! Bootloader mode (`fastboot`)

use std::path::Path;

use ltbox_core::prelude::*;
use ltbox_core::DeviceMode;

use crate::env::DeviceEnv;
use crate::process::{Invocation, ToolRunner};

/// Serials from `fastboot devices` output (`SERIAL\tfastboot`)
pub fn parse_devices(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some("fastboot")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Value of `var` from `fastboot getvar` output, e.g. `current-slot: a`
pub fn parse_getvar(output: &str, var: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let value = line.trim().strip_prefix(var)?.strip_prefix(':')?.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Serial of the first device in bootloader mode
pub async fn probe<R: ToolRunner>(env: &DeviceEnv<R>) -> Result<Option<String>> {
    let out = env
        .run(Invocation::new(&env.tools.fastboot).arg("devices"))
        .await
        .map_err(|e| {
            Error::connection(DeviceMode::Bootloader, format!("cannot run fastboot: {}", e))
        })?;

    if !out.success() {
        debug!("fastboot devices exited with {:?}", out.code);
        return Ok(None);
    }
    Ok(parse_devices(&out.stdout).into_iter().next())
}

/// `fastboot getvar <var>`
pub async fn getvar<R: ToolRunner>(env: &DeviceEnv<R>, var: &str) -> Result<Option<String>> {
    let out = env
        .run(Invocation::new(&env.tools.fastboot).args(["getvar", var]))
        .await?
        .into_checked("fastboot")?;
    Ok(parse_getvar(&out.combined(), var))
}

/// `fastboot reboot`
pub async fn reboot<R: ToolRunner>(env: &DeviceEnv<R>) -> Result<()> {
    env.run(Invocation::new(&env.tools.fastboot).arg("reboot"))
        .await?
        .into_checked("fastboot")?;
    Ok(())
}

/// `fastboot oem edl`
pub async fn reboot_edl<R: ToolRunner>(env: &DeviceEnv<R>) -> Result<()> {
    env.run(Invocation::new(&env.tools.fastboot).args(["oem", "edl"]))
        .await?
        .into_checked("fastboot")?;
    Ok(())
}

/// `fastboot flash <label> <image>`
pub async fn flash<R: ToolRunner>(env: &DeviceEnv<R>, label: &str, image: &Path) -> Result<()> {
    if !image.is_file() {
        return Err(Error::missing_image(image));
    }
    info!("Flashing {} with {}", label, image.display());
    env.run(
        Invocation::new(&env.tools.fastboot)
            .args(["flash", label])
            .arg(image.display().to_string()),
    )
    .await?
    .into_checked("fastboot")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{exit, ok, ok_stderr, test_env, FakeRunner};
    use tempfile::tempdir;

    #[test]
    fn test_parse_devices() {
        let out = "HA1B2C3D\tfastboot\n\nZY22\trecovery\n";
        assert_eq!(parse_devices(out), vec!["HA1B2C3D".to_string()]);
    }

    #[test]
    fn test_parse_getvar() {
        let out = "current-slot: a\nFinished. Total time: 0.001s\n";
        assert_eq!(parse_getvar(out, "current-slot").as_deref(), Some("a"));
        assert_eq!(parse_getvar("current-slot:\n", "current-slot"), None);
        assert_eq!(parse_getvar(out, "product"), None);
    }

    #[tokio::test]
    async fn test_getvar_reads_stderr() {
        let dir = tempdir().unwrap();
        let env = test_env(FakeRunner::new(|_| ok_stderr("current-slot: b\nFinished.\n")), dir.path());
        assert_eq!(getvar(&env, "current-slot").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_probe_nonzero_is_absent() {
        let dir = tempdir().unwrap();
        let env = test_env(FakeRunner::new(|_| exit(1, "")), dir.path());
        assert_eq!(probe(&env).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_flash_missing_image() {
        let dir = tempdir().unwrap();
        let env = test_env(FakeRunner::succeeding(), dir.path());
        let err = flash(&env, "devinfo", &dir.path().join("devinfo.img")).await.unwrap_err();
        assert!(matches!(err, Error::MissingImage { .. }));
        assert!(env.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_flash_arguments() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("persist.img");
        std::fs::write(&image, b"data").unwrap();
        let env = test_env(FakeRunner::new(|_| ok("")), dir.path());

        flash(&env, "persist", &image).await.unwrap();
        let call = &env.runner.calls()[0];
        assert_eq!(call.args[0], "flash");
        assert_eq!(call.args[1], "persist");
        assert_eq!(call.args[2], image.display().to_string());
    }
}
