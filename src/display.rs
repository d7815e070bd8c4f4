use std::rc::Rc;

use crate::{
    computer::Bus,
    device::Device,
    guest::{ApiResult, GuestApi, GuestError},
    value::Value,
};

pub const DEFAULT_WIDTH: usize = 320;
pub const DEFAULT_HEIGHT: usize = 200;

struct DisplayApi {
    name: String,
    width: usize,
    height: usize,
}

impl GuestApi for DisplayApi {
    fn name(&self) -> &str {
        &self.name
    }

    fn functions(&self) -> &[&'static str] {
        &["getSize"]
    }

    fn call(&self, function: &str, _args: &[Value]) -> Result<ApiResult, GuestError> {
        match function {
            "getSize" => Ok(ApiResult::Return(vec![
                Value::from(self.width),
                Value::from(self.height),
            ])),
            _ => Err(GuestError::UnknownFunction(function.to_string())),
        }
    }
}

/// Fixed-resolution screen. Drawing goes through the GPU; the display only
/// reports its geometry.
#[derive(Debug)]
pub struct DisplayDevice {
    width: usize,
    height: usize,
    name: String,
}

impl Default for DisplayDevice {
    fn default() -> Self {
        Self::new(DEFAULT_WIDTH, DEFAULT_HEIGHT)
    }
}

impl DisplayDevice {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            name: String::new(),
        }
    }

    pub fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}

impl Device for DisplayDevice {
    fn device_type(&self) -> &str {
        "display"
    }

    fn description(&self) -> &str {
        "Raster display"
    }

    fn attach(&mut self, _bus: &Bus, name: &str) {
        self.name = name.to_string();
    }

    fn detach(&mut self) {}

    fn guest_api(&self) -> Option<Rc<dyn GuestApi>> {
        Some(Rc::new(DisplayApi {
            name: self.name.clone(),
            width: self.width,
            height: self.height,
        }))
    }
}
