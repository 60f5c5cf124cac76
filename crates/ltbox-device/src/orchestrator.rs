//! Drives the device between system, bootloader and EDL modes
//!
//! Each transition issues the reboot instruction on the current mode's
//! control channel, discards that channel, then polls the target mode's
//! enumeration until the device shows up.
//!
//! | From        | To          | Instruction                     |
//! |-------------|-------------|---------------------------------|
//! | System      | Bootloader  | `adb reboot bootloader`         |
//! | System      | Edl         | `adb reboot edl`                |
//! | Bootloader  | System      | `fastboot reboot`               |
//! | Bootloader  | Edl         | `fastboot oem edl`              |
//! | Edl         | System      | Firehose reset                  |
//! | Edl         | Bootloader  | via System                      |
//! | Unknown     | any         | none, operator acts manually    |

use tokio::time::Instant;

use ltbox_core::prelude::*;
use ltbox_core::{DeviceMode, SlotSuffix};

use crate::adb::{self, SlotQuery, SlotQueryFailure, OTA_PACKAGE};
use crate::edl::{self, EdlLink};
use crate::env::DeviceEnv;
use crate::fastboot;
use crate::firehose::FirehoseChannel;
use crate::process::ToolRunner;
use crate::session::{DeviceSession, Transport};

/// Probe order used to learn the mode of an unknown device
const PROBE_ORDER: [DeviceMode; 3] = [DeviceMode::System, DeviceMode::Bootloader, DeviceMode::Edl];

pub struct ModeOrchestrator<'a, R> {
    env: &'a DeviceEnv<R>,
}

impl<'a, R: ToolRunner> ModeOrchestrator<'a, R> {
    pub fn new(env: &'a DeviceEnv<R>) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &'a DeviceEnv<R> {
        self.env
    }

    /// Probe adb, fastboot and EDL in that order and record what answered
    ///
    /// Probe tools that cannot run are skipped here; only the final result
    /// matters when the mode is merely being learned.
    pub async fn detect_mode(&self, session: &mut DeviceSession) -> Result<DeviceMode> {
        for mode in PROBE_ORDER {
            match self.probe(session, mode).await {
                Ok(Some(transport)) => {
                    info!("Device found in {} mode", mode);
                    session.attach(mode, Some(transport));
                    return Ok(mode);
                }
                Ok(None) => {}
                Err(e) => debug!("{} probe unavailable: {}", mode, e),
            }
        }
        session.attach(DeviceMode::Unknown, None);
        Ok(DeviceMode::Unknown)
    }

    /// Bring the device into `target`, blocking until it enumerates there
    pub async fn ensure_mode(&self, session: &mut DeviceSession, target: DeviceMode) -> Result<()> {
        if target == DeviceMode::Unknown {
            return Err(Error::connection(target, "cannot wait for an unknown mode"));
        }
        if self.is_in(session, target) {
            return Ok(());
        }
        if session.current_mode() == DeviceMode::Unknown {
            self.detect_mode(session).await?;
            if self.is_in(session, target) {
                return Ok(());
            }
        }

        for hop in route(session.current_mode(), target) {
            self.step(session, hop).await?;
        }
        Ok(())
    }

    /// Learn the active A/B slot
    ///
    /// The system-mode query is tried first when adb is enabled. Every
    /// [`SlotQueryFailure`] falls back to `fastboot getvar current-slot`,
    /// after which an adb-enabled session is returned to system mode.
    pub async fn detect_slot(&self, session: &mut DeviceSession) -> Result<Option<SlotSuffix>> {
        let failure = if !session.adb_enabled() {
            SlotQueryFailure::AdbUnavailable
        } else if matches!(
            session.current_mode(),
            DeviceMode::Bootloader | DeviceMode::Edl
        ) {
            SlotQueryFailure::DeviceAbsent
        } else {
            match adb::query_slot(self.env).await {
                SlotQuery::Found(slot) => {
                    info!("Active slot from system: {}", slot);
                    session.set_active_slot(slot);
                    return Ok(Some(slot));
                }
                SlotQuery::Fallback(failure) => failure,
            }
        };

        info!(
            "System slot query unavailable ({:?}), falling back to bootloader",
            failure
        );
        self.ensure_mode(session, DeviceMode::Bootloader).await?;
        let reported = fastboot::getvar(self.env, "current-slot").await?;

        if session.adb_enabled() {
            self.ensure_mode(session, DeviceMode::System).await?;
        }

        match reported.as_deref().and_then(SlotSuffix::parse) {
            Some(SlotSuffix::None) | None => {
                warn!("Bootloader reported no usable slot ({:?})", reported);
                Ok(None)
            }
            Some(slot) => {
                info!("Active slot from bootloader: {}", slot);
                session.set_active_slot(slot);
                Ok(Some(slot))
            }
        }
    }

    /// Disable the vendor OTA updater package
    ///
    /// Returns whether the package manager confirmed the change.
    pub async fn disable_ota(&self, session: &mut DeviceSession) -> Result<bool> {
        if !session.adb_enabled() {
            return Err(Error::connection(
                DeviceMode::System,
                "adb is disabled for this session",
            ));
        }
        self.ensure_mode(session, DeviceMode::System).await?;

        let disabled = adb::disable_package(self.env, OTA_PACKAGE).await?;
        if disabled {
            info!("{} disabled", OTA_PACKAGE);
        } else {
            warn!("Package manager did not confirm {} as disabled", OTA_PACKAGE);
        }
        Ok(disabled)
    }

    fn is_in(&self, session: &DeviceSession, target: DeviceMode) -> bool {
        session.current_mode() == target
            && (session.transport().is_some() || (target == DeviceMode::System && !session.adb_enabled()))
    }

    /// One direct transition
    async fn step(&self, session: &mut DeviceSession, target: DeviceMode) -> Result<()> {
        let from = session.current_mode();
        if self.is_in(session, target) {
            return Ok(());
        }
        info!("Moving device from {} to {} mode", from, target);
        self.issue_instruction(session, from, target).await;

        if target == DeviceMode::System && !session.adb_enabled() {
            info!("adb disabled, assuming the device is booting to system");
            session.attach(DeviceMode::System, None);
            return Ok(());
        }
        self.wait_for(session, target).await
    }

    /// Send the reboot instruction and drop the current channel
    ///
    /// Failures are logged; the device may already be on its way.
    async fn issue_instruction(&self, session: &mut DeviceSession, from: DeviceMode, target: DeviceMode) {
        let transport = session.detach();

        let result = match (from, target) {
            (DeviceMode::System, DeviceMode::Bootloader | DeviceMode::Edl) if session.adb_enabled() => {
                let arg = if target == DeviceMode::Edl { "edl" } else { "bootloader" };
                adb::reboot(self.env, Some(arg)).await
            }
            (DeviceMode::Bootloader, DeviceMode::System) => fastboot::reboot(self.env).await,
            (DeviceMode::Bootloader, DeviceMode::Edl) => fastboot::reboot_edl(self.env).await,
            (DeviceMode::Edl, DeviceMode::System) => {
                match transport {
                    Some(Transport::Edl(mut link)) => {
                        FirehoseChannel::new(self.env).reset(&mut link).await;
                    }
                    _ => warn!("No EDL link held; reset the device manually"),
                }
                Ok(())
            }
            _ => {
                warn!(
                    "Cannot switch from {} to {} automatically. Please put the device into {} mode manually.",
                    from, target, target
                );
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Reboot instruction toward {} failed ({}), waiting anyway", target, e);
        }
    }

    /// Poll the target's enumeration until the device appears
    async fn wait_for(&self, session: &mut DeviceSession, target: DeviceMode) -> Result<()> {
        let timeout = self.env.timings.mode_wait_timeout();
        let deadline = timeout.map(|t| Instant::now() + t);
        info!("Waiting for device in {} mode...", target);

        loop {
            if let Some(transport) = self.probe(session, target).await? {
                info!("Device connected in {} mode", target);
                session.attach(target, Some(transport));
                return Ok(());
            }
            if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
                if Instant::now() >= deadline {
                    return Err(Error::connection(
                        target,
                        format!("device did not appear within {:?}", timeout),
                    ));
                }
            }
            tokio::time::sleep(self.env.timings.poll_interval()).await;
        }
    }

    async fn probe(&self, session: &DeviceSession, mode: DeviceMode) -> Result<Option<Transport>> {
        match mode {
            DeviceMode::System if session.adb_enabled() => Ok(adb::probe(self.env)
                .await?
                .map(|serial| Transport::Adb { serial })),
            DeviceMode::System | DeviceMode::Unknown => Ok(None),
            DeviceMode::Bootloader => Ok(fastboot::probe(self.env)
                .await?
                .map(|serial| Transport::Fastboot { serial })),
            DeviceMode::Edl => match edl::probe(self.env).await? {
                Some(port) => {
                    debug!("QDLoader port {} present", port);
                    Ok(Some(Transport::Edl(EdlLink::open(port, &self.env.lock_dir)?)))
                }
                None => Ok(None),
            },
        }
    }
}

/// Hops needed to reach `target`; EDL only reaches the bootloader by way of system
fn route(from: DeviceMode, target: DeviceMode) -> Vec<DeviceMode> {
    match (from, target) {
        (DeviceMode::Edl, DeviceMode::Bootloader) => vec![DeviceMode::System, DeviceMode::Bootloader],
        _ => vec![target],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_env, FakeRunner, SimulatedDevice};
    use crate::timings::Timings;
    use tempfile::tempdir;

    fn simulated(initial: DeviceMode, root: &std::path::Path) -> (SimulatedDevice, DeviceEnv<FakeRunner>) {
        let device = SimulatedDevice::new(initial, root.join("serial-by-id"));
        let env = test_env(device.runner(), root);
        (device, env)
    }

    #[test]
    fn test_route_composes_edl_to_bootloader() {
        assert_eq!(
            route(DeviceMode::Edl, DeviceMode::Bootloader),
            vec![DeviceMode::System, DeviceMode::Bootloader]
        );
        assert_eq!(route(DeviceMode::System, DeviceMode::Edl), vec![DeviceMode::Edl]);
    }

    #[tokio::test]
    async fn test_detect_mode_probe_order() {
        let dir = tempdir().unwrap();
        let (_device, env) = simulated(DeviceMode::Bootloader, dir.path());
        let orchestrator = ModeOrchestrator::new(&env);
        let mut session = DeviceSession::new(true);

        assert_eq!(orchestrator.detect_mode(&mut session).await.unwrap(), DeviceMode::Bootloader);
        let tools: Vec<String> = env.runner.calls().iter().map(|c| c.tool_name()).collect();
        assert_eq!(tools, vec!["adb", "fastboot"]);
    }

    #[tokio::test]
    async fn test_system_to_edl() {
        let dir = tempdir().unwrap();
        let (device, env) = simulated(DeviceMode::System, dir.path());
        let orchestrator = ModeOrchestrator::new(&env);
        let mut session = DeviceSession::new(true);

        orchestrator.ensure_mode(&mut session, DeviceMode::Edl).await.unwrap();
        assert_eq!(session.current_mode(), DeviceMode::Edl);
        assert!(session.edl_link().is_ok());
        assert_eq!(device.mode(), DeviceMode::Edl);
        assert_eq!(env.runner.calls_with("adb", "edl").len(), 1);
    }

    #[tokio::test]
    async fn test_bootloader_transitions() {
        let dir = tempdir().unwrap();
        let (_device, env) = simulated(DeviceMode::Bootloader, dir.path());
        let orchestrator = ModeOrchestrator::new(&env);
        let mut session = DeviceSession::new(true);

        orchestrator.ensure_mode(&mut session, DeviceMode::Edl).await.unwrap();
        assert_eq!(env.runner.calls_with("fastboot", "oem").len(), 1);

        orchestrator.ensure_mode(&mut session, DeviceMode::System).await.unwrap();
        assert_eq!(env.runner.calls_with("fh_loader", "--reset").len(), 1);
        assert_eq!(session.current_mode(), DeviceMode::System);
    }

    #[tokio::test]
    async fn test_edl_to_bootloader_goes_through_system() {
        let dir = tempdir().unwrap();
        let (device, env) = simulated(DeviceMode::Edl, dir.path());
        let orchestrator = ModeOrchestrator::new(&env);
        let mut session = DeviceSession::new(true);

        orchestrator.ensure_mode(&mut session, DeviceMode::Bootloader).await.unwrap();
        assert_eq!(device.mode(), DeviceMode::Bootloader);
        assert_eq!(env.runner.calls_with("fh_loader", "--reset").len(), 1);
        assert_eq!(env.runner.calls_with("adb", "bootloader").len(), 1);
    }

    #[tokio::test]
    async fn test_already_in_target_issues_nothing() {
        let dir = tempdir().unwrap();
        let (_device, env) = simulated(DeviceMode::System, dir.path());
        let orchestrator = ModeOrchestrator::new(&env);
        let mut session = DeviceSession::new(true);

        orchestrator.ensure_mode(&mut session, DeviceMode::System).await.unwrap();
        orchestrator.ensure_mode(&mut session, DeviceMode::System).await.unwrap();
        assert!(env.runner.calls_with("adb", "reboot").is_empty());
        assert_eq!(env.runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_adb_disabled_never_issues_adb() {
        let dir = tempdir().unwrap();
        let (device, env) = simulated(DeviceMode::Edl, dir.path());
        let orchestrator = ModeOrchestrator::new(&env);
        let mut session = DeviceSession::new(false);

        orchestrator.ensure_mode(&mut session, DeviceMode::System).await.unwrap();
        assert_eq!(session.current_mode(), DeviceMode::System);
        assert_eq!(device.mode(), DeviceMode::System);
        assert!(env.runner.calls_to("adb").is_empty());
    }

    #[tokio::test]
    async fn test_failed_instruction_still_polls() {
        let dir = tempdir().unwrap();
        let (device, env) = simulated(DeviceMode::Bootloader, dir.path());
        device.fail_next_reboot();
        let orchestrator = ModeOrchestrator::new(&env);
        let mut session = DeviceSession::new(true);
        orchestrator.detect_mode(&mut session).await.unwrap();

        // The device reboots on its own after a few polls.
        device.switch_after_polls(3, DeviceMode::System);
        orchestrator.ensure_mode(&mut session, DeviceMode::System).await.unwrap();
        assert_eq!(session.current_mode(), DeviceMode::System);
    }

    #[tokio::test]
    async fn test_unrunnable_probe_is_connection_error() {
        let dir = tempdir().unwrap();
        let env = test_env(
            FakeRunner::new(|inv| {
                if inv.tool_name() == "fastboot" {
                    Err(Error::tool_not_found("fastboot"))
                } else {
                    crate::test_utils::ok("List of devices attached\nX\tdevice\n")
                }
            }),
            dir.path(),
        );
        let orchestrator = ModeOrchestrator::new(&env);
        let mut session = DeviceSession::new(true);

        let err = orchestrator
            .ensure_mode(&mut session, DeviceMode::Bootloader)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection { mode: DeviceMode::Bootloader, .. }));
    }

    #[tokio::test]
    async fn test_optional_wait_timeout() {
        let dir = tempdir().unwrap();
        let (device, env) = simulated(DeviceMode::System, dir.path());
        device.ignore_reboots();
        let env = env.with_timings(Timings {
            mode_wait_timeout_secs: Some(0),
            ..Timings::immediate()
        });
        let orchestrator = ModeOrchestrator::new(&env);
        let mut session = DeviceSession::new(true);

        let err = orchestrator
            .ensure_mode(&mut session, DeviceMode::Bootloader)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection { mode: DeviceMode::Bootloader, .. }));
    }

    #[tokio::test]
    async fn test_detect_slot_from_system() {
        let dir = tempdir().unwrap();
        let (device, env) = simulated(DeviceMode::System, dir.path());
        device.set_slot(SlotSuffix::B);
        let orchestrator = ModeOrchestrator::new(&env);
        let mut session = DeviceSession::new(true);

        let slot = orchestrator.detect_slot(&mut session).await.unwrap();
        assert_eq!(slot, Some(SlotSuffix::B));
        assert_eq!(session.active_slot(), SlotSuffix::B);
        assert!(env.runner.calls_to("fastboot").is_empty());
    }

    #[tokio::test]
    async fn test_detect_slot_empty_property_falls_back_and_returns_to_system() {
        let dir = tempdir().unwrap();
        let (device, env) = simulated(DeviceMode::System, dir.path());
        device.set_slot(SlotSuffix::A);
        device.hide_slot_property();
        let orchestrator = ModeOrchestrator::new(&env);
        let mut session = DeviceSession::new(true);

        let slot = orchestrator.detect_slot(&mut session).await.unwrap();
        assert_eq!(slot, Some(SlotSuffix::A));
        assert_eq!(env.runner.calls_with("fastboot", "current-slot").len(), 1);
        assert_eq!(env.runner.calls_with("fastboot", "reboot").len(), 1);
        assert_eq!(session.current_mode(), DeviceMode::System);
    }

    #[tokio::test]
    async fn test_detect_slot_adb_disabled_stays_in_bootloader() {
        let dir = tempdir().unwrap();
        let (device, env) = simulated(DeviceMode::Bootloader, dir.path());
        device.set_slot(SlotSuffix::B);
        let orchestrator = ModeOrchestrator::new(&env);
        let mut session = DeviceSession::new(false);

        let slot = orchestrator.detect_slot(&mut session).await.unwrap();
        assert_eq!(slot, Some(SlotSuffix::B));
        assert_eq!(session.current_mode(), DeviceMode::Bootloader);
        assert!(env.runner.calls_to("adb").is_empty());
    }

    #[tokio::test]
    async fn test_disable_ota() {
        let dir = tempdir().unwrap();
        let (_device, env) = simulated(DeviceMode::System, dir.path());
        let orchestrator = ModeOrchestrator::new(&env);

        let mut session = DeviceSession::new(true);
        assert!(orchestrator.disable_ota(&mut session).await.unwrap());

        let mut session = DeviceSession::new(false);
        assert!(orchestrator.disable_ota(&mut session).await.is_err());
    }
}
