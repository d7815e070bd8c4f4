use std::{fmt, rc::Rc, time::Duration};

use crate::{computer::Bus, event::Event, guest::GuestApi, mount::Mount};

/// What a device asks of the machine after each callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceUpdateResult {
    #[default]
    Continue,
    Shutdown,
    Reboot,
}

impl fmt::Display for DeviceUpdateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceUpdateResult::Continue => write!(f, "continue"),
            DeviceUpdateResult::Shutdown => write!(f, "shutdown"),
            DeviceUpdateResult::Reboot => write!(f, "reboot"),
        }
    }
}

/// A pluggable piece of hardware. Devices are constructed detached and are
/// bound to a computer by [`Device::attach`].
pub trait Device {
    fn device_type(&self) -> &str;
    fn description(&self) -> &str;

    fn attach(&mut self, bus: &Bus, name: &str);
    /// Releases everything the device tracked against the computer.
    fn detach(&mut self);

    fn update(&mut self, _dt: Duration) -> DeviceUpdateResult {
        DeviceUpdateResult::Continue
    }

    fn boot(&mut self) -> DeviceUpdateResult {
        DeviceUpdateResult::Continue
    }

    fn handle_event(&mut self, _event: &Event) -> DeviceUpdateResult {
        DeviceUpdateResult::Continue
    }

    fn free_unused_memory(&mut self) {}

    /// Called when the whole machine is switched off.
    fn power_off(&mut self) {}

    /// Host functions a CPU publishes for this device, keyed by device name.
    fn guest_api(&self) -> Option<Rc<dyn GuestApi>> {
        None
    }

    /// Storage a CPU can boot from or mount.
    fn mount(&self) -> Option<Rc<dyn Mount>> {
        None
    }

    /// Whether the device can carry storage, even if none is present now.
    fn has_storage(&self) -> bool {
        self.mount().is_some()
    }
}
