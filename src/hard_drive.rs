use std::rc::Rc;

use tracing::info;

use crate::{
    computer::Bus,
    device::Device,
    guest::{ApiResult, GuestApi, GuestError},
    mount::Mount,
    value::Value,
};

struct HardDriveApi {
    name: String,
    mount: Rc<dyn Mount>,
}

impl GuestApi for HardDriveApi {
    fn name(&self) -> &str {
        &self.name
    }

    fn functions(&self) -> &[&'static str] {
        &["getCapacity"]
    }

    fn call(&self, function: &str, _args: &[Value]) -> Result<ApiResult, GuestError> {
        match function {
            "getCapacity" => Ok(match self.mount.capacity() {
                Some(bytes) => ApiResult::one(Value::Integer(bytes as i64)),
                None => ApiResult::one(Value::Nil),
            }),
            _ => Err(GuestError::UnknownFunction(function.to_string())),
        }
    }
}

/// A fixed, writable store that stays attached for the machine's lifetime.
pub struct HardDriveDevice {
    mount: Rc<dyn Mount>,
    name: String,
}

impl HardDriveDevice {
    pub fn new(mount: Rc<dyn Mount>) -> Self {
        Self {
            mount,
            name: String::new(),
        }
    }
}

impl std::fmt::Debug for HardDriveDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardDriveDevice")
            .field("name", &self.name)
            .field("capacity", &self.mount.capacity())
            .finish()
    }
}

impl Device for HardDriveDevice {
    fn device_type(&self) -> &str {
        "hard_drive"
    }

    fn description(&self) -> &str {
        "Fixed disk"
    }

    fn attach(&mut self, _bus: &Bus, name: &str) {
        info!(
            "[HDD] {} attached, capacity {:?}",
            name,
            self.mount.capacity()
        );
        self.name = name.to_string();
    }

    fn detach(&mut self) {}

    fn guest_api(&self) -> Option<Rc<dyn GuestApi>> {
        Some(Rc::new(HardDriveApi {
            name: self.name.clone(),
            mount: self.mount.clone(),
        }))
    }

    fn mount(&self) -> Option<Rc<dyn Mount>> {
        Some(self.mount.clone())
    }
}
