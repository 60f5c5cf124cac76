//! Test utilities for the device layer
//!
//! Provides a scripted [`FakeRunner`], a [`SimulatedDevice`] that answers
//! `adb`, `fastboot`, `QSaharaServer` and `fh_loader` like a tablet moving
//! between modes, and helpers for building a [`DeviceEnv`] that never sleeps.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ltbox_core::prelude::*;
use ltbox_core::{DeviceMode, SlotSuffix};

use crate::env::DeviceEnv;
use crate::process::{Invocation, ToolOutput, ToolRunner};
use crate::timings::Timings;
use crate::tool_availability::ToolPaths;

type Responder = Box<dyn Fn(&Invocation) -> Result<ToolOutput> + Send + Sync>;

/// Records every invocation and answers with a scripted responder
pub struct FakeRunner {
    calls: Mutex<Vec<Invocation>>,
    responder: Responder,
}

impl FakeRunner {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&Invocation) -> Result<ToolOutput> + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    /// Every tool exits 0 with empty output
    pub fn succeeding() -> Self {
        Self::new(|_| ok(""))
    }

    /// All recorded invocations in order
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocations whose program stem equals `tool`
    pub fn calls_to(&self, tool: &str) -> Vec<Invocation> {
        self.calls()
            .into_iter()
            .filter(|inv| inv.tool_name() == tool)
            .collect()
    }

    /// Invocations of `tool` whose arguments contain `needle`
    pub fn calls_with(&self, tool: &str, needle: &str) -> Vec<Invocation> {
        self.calls_to(tool)
            .into_iter()
            .filter(|inv| inv.args.iter().any(|a| a.contains(needle)))
            .collect()
    }
}

impl ToolRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push(invocation.clone());
        (self.responder)(invocation)
    }
}

/// Exit 0 with the given stdout
pub fn ok(stdout: &str) -> Result<ToolOutput> {
    Ok(ToolOutput {
        code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    })
}

/// Exit 0 with the given stderr (fastboot style)
pub fn ok_stderr(stderr: &str) -> Result<ToolOutput> {
    Ok(ToolOutput {
        code: Some(0),
        stdout: String::new(),
        stderr: stderr.to_string(),
    })
}

/// Non-zero exit with the given stderr
pub fn exit(code: i32, stderr: &str) -> Result<ToolOutput> {
    Ok(ToolOutput {
        code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    })
}

/// Environment with bare tool names, zero delays and locks under `root`
///
/// The EDL serial scan looks at `root/serial-by-id`.
pub fn test_env<R: ToolRunner>(runner: R, root: &Path) -> DeviceEnv<R> {
    DeviceEnv::new(runner, ToolPaths::default())
        .with_timings(Timings::immediate())
        .with_lock_dir(root.join("locks"))
        .with_serial_by_id_dir(root.join("serial-by-id"))
}

// ─────────────────────────────────────────────────────────────────
// Simulated device
// ─────────────────────────────────────────────────────────────────

const SIM_SERIAL: &str = "HA1SIM01";
const SIM_SECTOR: usize = 4096;
const QDLOADER_NODE: &str = "usb-Qualcomm_CDMA_Technologies_MSM_QHSUSB__BULK-if00-port0";

#[derive(Default)]
struct SimState {
    mode: DeviceMode,
    slot: SlotSuffix,
    hide_slot: bool,
    fail_next_reboot: bool,
    ignore_reboots: bool,
    pending_switch: Option<(usize, DeviceMode)>,
    fail_sendxml: Option<String>,
    partitions: HashMap<(u32, u64), Vec<u8>>,
    written: Vec<(u32, u64, Vec<u8>)>,
    flashed: Vec<(String, Vec<u8>)>,
    sent_xmls: Vec<String>,
}

/// A tablet answering the device tools according to its current mode
///
/// Cloning shares state, so a test can keep a handle while the runner owns
/// another.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
    serial_dir: PathBuf,
}

impl SimulatedDevice {
    pub fn new(initial: DeviceMode, serial_dir: impl Into<PathBuf>) -> Self {
        let device = Self {
            state: Arc::new(Mutex::new(SimState {
                mode: initial,
                slot: SlotSuffix::A,
                ..Default::default()
            })),
            serial_dir: serial_dir.into(),
        };
        device.sync_port(initial);
        device
    }

    /// A runner answering only for this device; other tools exit 127
    pub fn runner(&self) -> FakeRunner {
        let device = self.clone();
        FakeRunner::new(move |inv| {
            device
                .respond(inv)
                .unwrap_or_else(|| exit(127, "unknown tool"))
        })
    }

    pub fn mode(&self) -> DeviceMode {
        self.state.lock().unwrap().mode
    }

    pub fn set_slot(&self, slot: SlotSuffix) {
        self.state.lock().unwrap().slot = slot;
    }

    /// `ro.boot.slot_suffix` reads back empty
    pub fn hide_slot_property(&self) {
        self.state.lock().unwrap().hide_slot = true;
    }

    /// The next reboot instruction fails and leaves the mode unchanged
    pub fn fail_next_reboot(&self) {
        self.state.lock().unwrap().fail_next_reboot = true;
    }

    /// Reboot instructions succeed but the device stays where it is
    pub fn ignore_reboots(&self) {
        self.state.lock().unwrap().ignore_reboots = true;
    }

    /// Change mode on its own after `polls` enumeration calls
    pub fn switch_after_polls(&self, polls: usize, mode: DeviceMode) {
        self.state.lock().unwrap().pending_switch = Some((polls, mode));
    }

    /// `--sendxml=<name>` exits non-zero
    pub fn fail_sendxml(&self, name: &str) {
        self.state.lock().unwrap().fail_sendxml = Some(name.to_string());
    }

    /// Contents returned when reading `lun` at `start_sector`
    pub fn add_partition(&self, lun: u32, start_sector: u64, data: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .partitions
            .insert((lun, start_sector), data);
    }

    /// `(lun, start_sector, bytes)` of every Firehose write
    pub fn written(&self) -> Vec<(u32, u64, Vec<u8>)> {
        self.state.lock().unwrap().written.clone()
    }

    /// `(label, bytes)` of every fastboot flash
    pub fn flashed(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().unwrap().flashed.clone()
    }

    /// Descriptor names sent with `--sendxml`, in order
    pub fn sent_xmls(&self) -> Vec<String> {
        self.state.lock().unwrap().sent_xmls.clone()
    }

    /// Answer `inv` if it targets one of the device tools
    pub fn respond(&self, inv: &Invocation) -> Option<Result<ToolOutput>> {
        let tool = inv.tool_name();
        let reply = match tool.as_str() {
            "adb" => self.adb(inv),
            "fastboot" => self.fastboot(inv),
            "QSaharaServer" => self.sahara(),
            "fh_loader" => self.fh_loader(inv),
            _ => return None,
        };
        Some(reply)
    }

    fn set_mode(&self, state: &mut SimState, mode: DeviceMode) {
        state.mode = mode;
        self.sync_port(mode);
    }

    fn sync_port(&self, mode: DeviceMode) {
        let node = self.serial_dir.join(QDLOADER_NODE);
        if mode == DeviceMode::Edl {
            std::fs::create_dir_all(&self.serial_dir).unwrap();
            std::fs::write(node, b"").unwrap();
        } else {
            let _ = std::fs::remove_file(node);
        }
    }

    /// Apply a pending self-initiated switch, counting one enumeration
    fn tick(&self, state: &mut SimState) {
        if let Some((remaining, mode)) = state.pending_switch {
            if remaining <= 1 {
                state.pending_switch = None;
                self.set_mode(state, mode);
            } else {
                state.pending_switch = Some((remaining - 1, mode));
            }
        }
    }

    fn reboot(&self, state: &mut SimState, target: DeviceMode) -> Result<ToolOutput> {
        if state.fail_next_reboot {
            state.fail_next_reboot = false;
            return exit(1, "FAILED (remote: 'unknown command')");
        }
        if !state.ignore_reboots {
            self.set_mode(state, target);
        }
        ok("")
    }

    fn adb(&self, inv: &Invocation) -> Result<ToolOutput> {
        let mut state = self.state.lock().unwrap();
        let args: Vec<&str> = inv.args.iter().map(String::as_str).collect();

        if args.first() == Some(&"devices") {
            self.tick(&mut state);
            return if state.mode == DeviceMode::System {
                ok(&format!("List of devices attached\n{}\tdevice\n", SIM_SERIAL))
            } else {
                ok("List of devices attached\n\n")
            };
        }
        if state.mode != DeviceMode::System {
            return exit(1, "adb: no devices/emulators found");
        }
        match args.as_slice() {
            ["reboot", "bootloader"] => self.reboot(&mut state, DeviceMode::Bootloader),
            ["reboot", "edl"] => self.reboot(&mut state, DeviceMode::Edl),
            ["shell", "getprop", "ro.boot.slot_suffix"] => {
                if state.hide_slot {
                    ok("\n")
                } else {
                    ok(&format!("{}\n", state.slot))
                }
            }
            ["shell", "pm", "disable-user", "--user", "0", package] => {
                ok(&format!("Package {} new state: disabled-user\n", package))
            }
            _ => exit(1, "unsupported adb command"),
        }
    }

    fn fastboot(&self, inv: &Invocation) -> Result<ToolOutput> {
        let mut state = self.state.lock().unwrap();
        let args: Vec<&str> = inv.args.iter().map(String::as_str).collect();

        if args.first() == Some(&"devices") {
            self.tick(&mut state);
            return if state.mode == DeviceMode::Bootloader {
                ok(&format!("{}\tfastboot\n", SIM_SERIAL))
            } else {
                ok("")
            };
        }
        if state.mode != DeviceMode::Bootloader {
            return exit(1, "< waiting for any device >");
        }
        match args.as_slice() {
            ["reboot"] => self.reboot(&mut state, DeviceMode::System),
            ["oem", "edl"] => self.reboot(&mut state, DeviceMode::Edl),
            ["getvar", "current-slot"] => {
                let slot = state.slot.as_str().trim_start_matches('_').to_string();
                ok_stderr(&format!("current-slot: {}\nFinished. Total time: 0.001s\n", slot))
            }
            ["flash", label, image] => match std::fs::read(image) {
                Ok(bytes) => {
                    state.flashed.push((label.to_string(), bytes));
                    ok("")
                }
                Err(_) => exit(1, "cannot load image"),
            },
            _ => exit(1, "unsupported fastboot command"),
        }
    }

    fn sahara(&self) -> Result<ToolOutput> {
        if self.state.lock().unwrap().mode == DeviceMode::Edl {
            ok("Sahara protocol completed")
        } else {
            exit(1, "ERROR: could not open port")
        }
    }

    fn fh_loader(&self, inv: &Invocation) -> Result<ToolOutput> {
        let mut state = self.state.lock().unwrap();
        if state.mode != DeviceMode::Edl {
            return exit(1, "ERROR: could not open port");
        }

        if inv.has_flag("--reset") {
            self.set_mode(&mut state, DeviceMode::System);
            return ok("");
        }

        if let Some(xml) = inv.flag_value("--sendxml") {
            state.sent_xmls.push(xml.to_string());
            if state.fail_sendxml.as_deref() == Some(xml) {
                return exit(1, "ERROR: program failed");
            }
            return ok("");
        }

        let lun: u32 = inv.flag_value("--lun").and_then(|v| v.parse().ok()).unwrap_or(0);
        let start: u64 = inv
            .flag_value("--start_sector")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let Some(image) = inv.flag_value("--sendimage") else {
            return exit(1, "nothing to do");
        };

        if inv.has_flag("--convertprogram2read") {
            let num: usize = inv
                .flag_value("--num_sectors")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let data = state
                .partitions
                .get(&(lun, start))
                .cloned()
                .unwrap_or_else(|| vec![0u8; num * SIM_SECTOR]);
            std::fs::write(image, data).unwrap();
            ok("")
        } else {
            match std::fs::read(image) {
                Ok(bytes) => {
                    state.written.push((lun, start, bytes));
                    ok("")
                }
                Err(_) => exit(1, "ERROR: could not open image"),
            }
        }
    }
}
