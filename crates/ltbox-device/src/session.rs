//! Per-operation device state

use ltbox_core::prelude::*;
use ltbox_core::{DeviceMode, SlotSuffix};

use crate::edl::EdlLink;

/// Control channel currently held for the device
#[derive(Debug)]
pub enum Transport {
    Adb { serial: String },
    Fastboot { serial: String },
    Edl(EdlLink),
}

impl Transport {
    pub fn mode(&self) -> DeviceMode {
        match self {
            Transport::Adb { .. } => DeviceMode::System,
            Transport::Fastboot { .. } => DeviceMode::Bootloader,
            Transport::Edl(_) => DeviceMode::Edl,
        }
    }
}

/// Mutable record of one top-level operation against one device
///
/// Created when the operation starts and dropped when it ends. Dropping the
/// session releases any EDL port lease it holds.
#[derive(Debug)]
pub struct DeviceSession {
    current_mode: DeviceMode,
    transport: Option<Transport>,
    active_slot: SlotSuffix,
    adb_enabled: bool,
}

impl DeviceSession {
    pub fn new(adb_enabled: bool) -> Self {
        Self {
            current_mode: DeviceMode::Unknown,
            transport: None,
            active_slot: SlotSuffix::None,
            adb_enabled,
        }
    }

    pub fn current_mode(&self) -> DeviceMode {
        self.current_mode
    }

    pub fn active_slot(&self) -> SlotSuffix {
        self.active_slot
    }

    pub fn adb_enabled(&self) -> bool {
        self.adb_enabled
    }

    pub fn transport(&self) -> Option<&Transport> {
        self.transport.as_ref()
    }

    /// The EDL link, required by every Firehose operation
    pub fn edl_link(&mut self) -> Result<&mut EdlLink> {
        match self.transport.as_mut() {
            Some(Transport::Edl(link)) => Ok(link),
            _ => Err(Error::connection(
                DeviceMode::Edl,
                format!("session holds no EDL transport (mode: {})", self.current_mode),
            )),
        }
    }

    pub(crate) fn attach(&mut self, mode: DeviceMode, transport: Option<Transport>) {
        debug!("Session now in {} mode", mode);
        self.current_mode = mode;
        self.transport = transport;
    }

    /// Drop the current channel; the device is in transit
    pub(crate) fn detach(&mut self) -> Option<Transport> {
        self.current_mode = DeviceMode::Unknown;
        self.transport.take()
    }

    pub(crate) fn set_active_slot(&mut self, slot: SlotSuffix) {
        self.active_slot = slot;
    }
}
