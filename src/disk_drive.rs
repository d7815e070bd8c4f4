use std::{cell::RefCell, rc::Rc};

use tracing::info;

use crate::{
    computer::Bus,
    device::Device,
    event::names,
    guest::{ApiResult, GuestApi, GuestError},
    mount::{Disk, Mount},
    value::Value,
};

struct DiskDriveApi {
    name: String,
    slot: Rc<RefCell<Option<Disk>>>,
}

impl GuestApi for DiskDriveApi {
    fn name(&self) -> &str {
        &self.name
    }

    fn functions(&self) -> &[&'static str] {
        &["hasDisk", "getLabel"]
    }

    fn call(&self, function: &str, _args: &[Value]) -> Result<ApiResult, GuestError> {
        let slot = self.slot.borrow();
        let disk = slot.as_ref().filter(|d| d.connected);
        match function {
            "hasDisk" => Ok(ApiResult::one(disk.is_some())),
            "getLabel" => Ok(match disk {
                Some(disk) => ApiResult::one(disk.label.as_str()),
                None => ApiResult::one(Value::Nil),
            }),
            _ => Err(GuestError::UnknownFunction(function.to_string())),
        }
    }
}

/// A removable-media drive. Inserting or ejecting a disk raises
/// `disk_changed` with the drive's name.
#[derive(Debug, Default)]
pub struct DiskDriveDevice {
    slot: Rc<RefCell<Option<Disk>>>,
    bus: Option<Bus>,
    name: String,
}

impl DiskDriveDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_disk(disk: Disk) -> Self {
        let drive = Self::new();
        *drive.slot.borrow_mut() = Some(Disk {
            connected: true,
            ..disk
        });
        drive
    }

    fn changed(&self) {
        if let Some(bus) = &self.bus {
            bus.queue_event(names::DISK_CHANGED, vec![Value::from(self.name.as_str())]);
        }
    }

    /// Inserts `disk`, returning whatever was in the drive before.
    pub fn insert(&mut self, disk: Disk) -> Option<Disk> {
        info!("[DSK] {}: inserted '{}'", self.name, disk.label);
        let previous = self.slot.borrow_mut().replace(Disk {
            connected: true,
            ..disk
        });
        self.changed();
        previous.map(|d| Disk {
            connected: false,
            ..d
        })
    }

    pub fn eject(&mut self) -> Option<Disk> {
        let disk = self.slot.borrow_mut().take()?;
        info!("[DSK] {}: ejected '{}'", self.name, disk.label);
        self.changed();
        Some(Disk {
            connected: false,
            ..disk
        })
    }

    pub fn has_disk(&self) -> bool {
        self.slot.borrow().as_ref().is_some_and(|d| d.connected)
    }

    pub fn label(&self) -> Option<String> {
        self.slot.borrow().as_ref().map(|d| d.label.clone())
    }
}

impl Device for DiskDriveDevice {
    fn device_type(&self) -> &str {
        "disk_drive"
    }

    fn description(&self) -> &str {
        "Removable disk drive"
    }

    fn attach(&mut self, bus: &Bus, name: &str) {
        self.bus = Some(bus.clone());
        self.name = name.to_string();
    }

    fn detach(&mut self) {
        self.bus = None;
    }

    fn guest_api(&self) -> Option<Rc<dyn GuestApi>> {
        Some(Rc::new(DiskDriveApi {
            name: self.name.clone(),
            slot: self.slot.clone(),
        }))
    }

    fn has_storage(&self) -> bool {
        true
    }

    fn mount(&self) -> Option<Rc<dyn Mount>> {
        self.slot
            .borrow()
            .as_ref()
            .filter(|d| d.connected)
            .map(|d| d.mount.clone())
    }
}
