use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::{Rc, Weak},
    time::Duration,
};

use derivative::Derivative;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::ComputerConfig,
    device::{Device, DeviceUpdateResult},
    event::{Event, EventQueue},
    guest::GuestApi,
    memory::MemoryTracker,
    mount::Mount,
    value::Value,
};

pub type SharedDevice = Rc<RefCell<dyn Device>>;

type DeviceMap = Vec<(String, SharedDevice)>;

/// Device name to device type, recorded on attach so that a busy device can
/// still be described.
type DeviceKinds = Rc<RefCell<HashMap<String, String>>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComputerError {
    #[error("a device named '{0}' is already attached")]
    DuplicateDevice(String),
    #[error("no device named '{0}'")]
    NoSuchDevice(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Off,
    On,
}

/// Line sink for guest errors, shown on the in-game console.
#[derive(Debug, Clone, Default)]
pub struct ErrorOutput {
    lines: Rc<RefCell<Vec<String>>>,
}

impl ErrorOutput {
    pub fn write_line(&self, line: impl Into<String>) {
        self.lines.borrow_mut().push(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.borrow_mut())
    }
}

/// The view of a computer handed to devices on attach.
///
/// Lookups skip any device that is currently borrowed, which is always the
/// device doing the lookup.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct Bus {
    memory: Rc<MemoryTracker>,
    #[derivative(Debug = "ignore")]
    events: Rc<RefCell<EventQueue>>,
    errors: ErrorOutput,
    #[derivative(Debug = "ignore")]
    devices: Weak<RefCell<DeviceMap>>,
    kinds: DeviceKinds,
    uptime: Rc<Cell<Duration>>,
}

impl Bus {
    pub fn memory(&self) -> &Rc<MemoryTracker> {
        &self.memory
    }

    pub fn error_output(&self) -> &ErrorOutput {
        &self.errors
    }

    pub fn uptime(&self) -> Duration {
        self.uptime.get()
    }

    pub fn queue_event(&self, name: &str, arguments: Vec<Value>) -> bool {
        self.events.borrow_mut().queue(name, arguments)
    }

    fn with_devices<T>(&self, f: impl FnOnce(&DeviceMap) -> T) -> Option<T> {
        let devices = self.devices.upgrade()?;
        let devices = devices.try_borrow().ok()?;
        Some(f(&devices))
    }

    pub fn device_names(&self) -> Vec<String> {
        self.with_devices(|devices| devices.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default()
    }

    fn find<T>(&self, name: &str, f: impl FnOnce(&dyn Device) -> T) -> Option<T> {
        self.with_devices(|devices| {
            let (_, device) = devices.iter().find(|(n, _)| n == name)?;
            let device = device.try_borrow().ok()?;
            Some(f(&*device))
        })
        .flatten()
    }

    pub fn device_type(&self, name: &str) -> Option<String> {
        self.kinds.borrow().get(name).cloned()
    }

    pub fn device_mount(&self, name: &str) -> Option<Rc<dyn Mount>> {
        self.find(name, |d| d.mount()).flatten()
    }

    /// Names of the other devices that can carry storage.
    pub fn storage_devices(&self) -> Vec<String> {
        self.with_devices(|devices| {
            devices
                .iter()
                .filter(|(_, d)| d.try_borrow().is_ok_and(|d| d.has_storage()))
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default()
    }

    /// Every peripheral's guest API, keyed by device name, in registration
    /// order.
    pub fn device_apis(&self) -> Vec<(String, Rc<dyn GuestApi>)> {
        self.with_devices(|devices| {
            devices
                .iter()
                .filter_map(|(name, device)| {
                    let api = device.try_borrow().ok()?.guest_api()?;
                    Some((name.clone(), api))
                })
                .collect()
        })
        .unwrap_or_default()
    }
}

/// A named collection of devices sharing one memory budget and one event
/// queue, advanced one tick per frame.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Computer {
    #[derivative(Debug = "ignore")]
    devices: Rc<RefCell<DeviceMap>>,
    kinds: DeviceKinds,
    memory: Rc<MemoryTracker>,
    #[derivative(Debug = "ignore")]
    events: Rc<RefCell<EventQueue>>,
    errors: ErrorOutput,
    uptime: Rc<Cell<Duration>>,
    power: PowerState,
}

impl Computer {
    pub fn new(config: &ComputerConfig) -> Self {
        info!(
            "[BUS] new computer, {} bytes of memory",
            config.memory_budget
        );
        Self {
            devices: Rc::new(RefCell::new(Vec::new())),
            kinds: DeviceKinds::default(),
            memory: Rc::new(MemoryTracker::new(config.memory_budget)),
            events: Rc::new(RefCell::new(EventQueue::new(config.event_queue_capacity))),
            errors: ErrorOutput::default(),
            uptime: Rc::new(Cell::new(Duration::ZERO)),
            power: PowerState::Off,
        }
    }

    pub fn bus(&self) -> Bus {
        Bus {
            memory: self.memory.clone(),
            events: self.events.clone(),
            errors: self.errors.clone(),
            devices: Rc::downgrade(&self.devices),
            kinds: self.kinds.clone(),
            uptime: self.uptime.clone(),
        }
    }

    pub fn memory(&self) -> &Rc<MemoryTracker> {
        &self.memory
    }

    pub fn error_output(&self) -> &ErrorOutput {
        &self.errors
    }

    pub fn power(&self) -> PowerState {
        self.power
    }

    pub fn is_on(&self) -> bool {
        self.power == PowerState::On
    }

    pub fn uptime(&self) -> Duration {
        self.uptime.get()
    }

    pub fn queue_event(&self, name: &str, arguments: Vec<Value>) -> bool {
        self.events.borrow_mut().queue(name, arguments)
    }

    pub fn pending_events(&self) -> usize {
        self.events.borrow().len()
    }

    /// Attaches `device` under `name` and hands back a typed handle to it.
    pub fn attach_device<D: Device + 'static>(
        &mut self,
        name: &str,
        device: D,
    ) -> Result<Rc<RefCell<D>>, ComputerError> {
        let device = Rc::new(RefCell::new(device));
        self.attach_shared(name, device.clone())?;
        Ok(device)
    }

    pub fn attach_shared(&mut self, name: &str, device: SharedDevice) -> Result<(), ComputerError> {
        if self.device(name).is_some() {
            return Err(ComputerError::DuplicateDevice(name.to_string()));
        }
        {
            let mut d = device.borrow_mut();
            info!(
                "[BUS] attach {} ({}: {})",
                name,
                d.device_type(),
                d.description()
            );
            d.attach(&self.bus(), name);
            self.kinds
                .borrow_mut()
                .insert(name.to_string(), d.device_type().to_string());
        }
        self.devices
            .borrow_mut()
            .push((name.to_string(), device));
        Ok(())
    }

    pub fn detach_device(&mut self, name: &str) -> Result<SharedDevice, ComputerError> {
        let index = self
            .devices
            .borrow()
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| ComputerError::NoSuchDevice(name.to_string()))?;
        let (_, device) = self.devices.borrow_mut().remove(index);
        self.kinds.borrow_mut().remove(name);
        info!("[BUS] detach {}", name);
        device.borrow_mut().detach();
        Ok(device)
    }

    /// Exact, case-sensitive lookup.
    pub fn device(&self, name: &str) -> Option<SharedDevice> {
        self.devices
            .borrow()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.clone())
    }

    /// Inverse of [`Computer::device`].
    pub fn get_name(&self, device: &SharedDevice) -> Option<String> {
        self.devices
            .borrow()
            .iter()
            .find(|(_, d)| Rc::ptr_eq(d, device))
            .map(|(n, _)| n.clone())
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.borrow().iter().map(|(n, _)| n.clone()).collect()
    }

    fn snapshot(&self) -> DeviceMap {
        self.devices.borrow().clone()
    }

    /// Boots every device in registration order.
    pub fn power_on(&mut self) -> PowerState {
        if self.is_on() {
            return self.power;
        }
        info!("[BUS] power on");
        self.power = PowerState::On;
        self.uptime.set(Duration::ZERO);
        for (name, device) in self.snapshot() {
            let result = device.borrow_mut().boot();
            self.apply(&name, &device, result);
            if !self.is_on() {
                break;
            }
        }
        self.power
    }

    pub fn power_off(&mut self) {
        if !self.is_on() {
            return;
        }
        info!("[BUS] power off");
        self.power = PowerState::Off;
        for (_, device) in self.snapshot() {
            device.borrow_mut().power_off();
        }
        self.events.borrow_mut().clear();
    }

    /// One simulation tick: update every device, then deliver the events
    /// queued so far to every device.
    pub fn update(&mut self, dt: Duration) {
        if !self.is_on() {
            return;
        }
        self.uptime.set(self.uptime.get() + dt);

        let devices = self.snapshot();
        for (name, device) in &devices {
            let result = device.borrow_mut().update(dt);
            self.apply(name, device, result);
            if !self.is_on() {
                return;
            }
        }

        let events = self.events.borrow_mut().drain_pending();
        for event in &events {
            if !self.dispatch(&devices, event) {
                return;
            }
        }
    }

    fn dispatch(&mut self, devices: &DeviceMap, event: &Event) -> bool {
        for (name, device) in devices {
            let result = device.borrow_mut().handle_event(event);
            self.apply(name, device, result);
            if !self.is_on() {
                return false;
            }
        }
        true
    }

    fn apply(&mut self, name: &str, device: &SharedDevice, result: DeviceUpdateResult) {
        match result {
            DeviceUpdateResult::Continue => {}
            DeviceUpdateResult::Shutdown => {
                info!("[BUS] {} requested shutdown", name);
                self.power_off();
            }
            DeviceUpdateResult::Reboot => {
                info!("[BUS] {} requested reboot", name);
                let result = device.borrow_mut().boot();
                match result {
                    DeviceUpdateResult::Shutdown => self.power_off(),
                    DeviceUpdateResult::Reboot => {
                        warn!("[BUS] {} asked to reboot while booting, ignoring", name)
                    }
                    DeviceUpdateResult::Continue => {}
                }
            }
        }
    }

    pub fn free_unused_memory(&mut self) {
        let before = self.memory.used();
        for (_, device) in self.snapshot() {
            device.borrow_mut().free_unused_memory();
        }
        debug!(
            "[BUS] free unused memory: {} -> {} bytes",
            before,
            self.memory.used()
        );
    }
}

impl Drop for Computer {
    fn drop(&mut self) {
        let devices = std::mem::take(&mut *self.devices.borrow_mut());
        self.kinds.borrow_mut().clear();
        for (name, device) in devices {
            debug!("[BUS] teardown {}", name);
            if let Ok(mut device) = device.try_borrow_mut() {
                device.detach();
            }
        }
    }
}

#[derive(Default)]
pub struct ComputerBuilder {
    config: ComputerConfig,
    devices: Vec<(String, SharedDevice)>,
}

impl ComputerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&mut self, config: ComputerConfig) -> &mut Self {
        self.config = config;
        self
    }

    pub fn memory_budget(&mut self, bytes: usize) -> &mut Self {
        self.config.memory_budget = bytes;
        self
    }

    pub fn event_queue_capacity(&mut self, capacity: usize) -> &mut Self {
        self.config.event_queue_capacity = capacity;
        self
    }

    pub fn device(&mut self, name: &str, device: impl Device + 'static) -> &mut Self {
        self.devices
            .push((name.to_string(), Rc::new(RefCell::new(device))));
        self
    }

    pub fn shared_device(&mut self, name: &str, device: SharedDevice) -> &mut Self {
        self.devices.push((name.to_string(), device));
        self
    }

    pub fn build(&mut self) -> Result<Computer, ComputerError> {
        let mut computer = Computer::new(&self.config);
        for (name, device) in self.devices.drain(..) {
            computer.attach_shared(&name, device)?;
        }
        Ok(computer)
    }
}
