use std::{cell::RefCell, rc::Rc};

use tracing::{debug, info};

use crate::{
    computer::Bus,
    device::Device,
    guest::{arg_usize, ApiResult, GuestApi, GuestError},
    host_api::{arg_handle, handle_value},
    resource::{ResourceArena, ResourceKind},
    value::Value,
};

fn byte(function: &str, args: &[Value], index: usize) -> Result<u8, GuestError> {
    let value = arg_usize(function, args, index)?;
    u8::try_from(value).map_err(|_| GuestError::BadArgument {
        function: function.to_string(),
        index: index + 1,
        message: "value between 0 and 255 expected".to_string(),
    })
}

struct GpuApi {
    name: String,
    arena: Rc<RefCell<Option<ResourceArena>>>,
}

impl GpuApi {
    const FUNCTIONS: &'static [&'static str] = &[
        "newImage",
        "newPalette",
        "getSize",
        "setPixel",
        "getPixel",
        "setColor",
        "getColor",
        "copy",
        "release",
    ];
}

impl GuestApi for GpuApi {
    fn name(&self) -> &str {
        &self.name
    }

    fn functions(&self) -> &[&'static str] {
        Self::FUNCTIONS
    }

    fn call(&self, function: &str, args: &[Value]) -> Result<ApiResult, GuestError> {
        let mut arena = self.arena.borrow_mut();
        let arena = arena
            .as_mut()
            .ok_or_else(|| GuestError::Runtime("gpu is not attached".to_string()))?;
        match function {
            "newImage" => {
                let width = arg_usize(function, args, 0)?;
                let height = arg_usize(function, args, 1)?;
                Ok(ApiResult::one(handle_value(arena.create_image(width, height)?)))
            }
            "newPalette" => {
                let colors = arg_usize(function, args, 0)?;
                Ok(ApiResult::one(handle_value(arena.create_palette(colors)?)))
            }
            "getSize" => match arena.kind(arg_handle(function, args, 0)?)? {
                ResourceKind::Image { width, height } => Ok(ApiResult::Return(vec![
                    Value::from(width),
                    Value::from(height),
                ])),
                ResourceKind::Palette { colors } => Ok(ApiResult::one(colors)),
                ResourceKind::Buffer => Err(GuestError::Runtime(
                    "expected image or palette, got buffer".to_string(),
                )),
            },
            "setPixel" => {
                let image = arg_handle(function, args, 0)?;
                let x = arg_usize(function, args, 1)?;
                let y = arg_usize(function, args, 2)?;
                arena.set_pixel(image, x, y, byte(function, args, 3)?)?;
                Ok(ApiResult::none())
            }
            "getPixel" => {
                let image = arg_handle(function, args, 0)?;
                let x = arg_usize(function, args, 1)?;
                let y = arg_usize(function, args, 2)?;
                Ok(ApiResult::one(arena.get_pixel(image, x, y)? as i64))
            }
            "setColor" => {
                let palette = arg_handle(function, args, 0)?;
                let index = arg_usize(function, args, 1)?;
                let rgb = [
                    byte(function, args, 2)?,
                    byte(function, args, 3)?,
                    byte(function, args, 4)?,
                ];
                arena.set_color(palette, index, rgb)?;
                Ok(ApiResult::none())
            }
            "getColor" => {
                let palette = arg_handle(function, args, 0)?;
                let index = arg_usize(function, args, 1)?;
                let [r, g, b] = arena.get_color(palette, index)?;
                Ok(ApiResult::Return(vec![
                    Value::Integer(r as i64),
                    Value::Integer(g as i64),
                    Value::Integer(b as i64),
                ]))
            }
            "copy" => {
                let handle = arg_handle(function, args, 0)?;
                Ok(ApiResult::one(handle_value(arena.copy(handle)?)))
            }
            "release" => {
                arena.release(arg_handle(function, args, 0)?)?;
                Ok(ApiResult::none())
            }
            _ => Err(GuestError::UnknownFunction(function.to_string())),
        }
    }
}

/// Owns every image and palette the guest creates. All of it is charged to
/// machine memory and handed back when the GPU is detached.
#[derive(Debug, Default)]
pub struct GpuDevice {
    arena: Rc<RefCell<Option<ResourceArena>>>,
    name: String,
}

impl GpuDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_resources(&self) -> usize {
        self.arena.borrow().as_ref().map_or(0, ResourceArena::live)
    }
}

impl Device for GpuDevice {
    fn device_type(&self) -> &str {
        "gpu"
    }

    fn description(&self) -> &str {
        "Indexed-colour graphics processor"
    }

    fn attach(&mut self, bus: &Bus, name: &str) {
        info!("[GPU] {} attached", name);
        self.name = name.to_string();
        *self.arena.borrow_mut() = Some(ResourceArena::new(bus.memory().clone()));
    }

    fn detach(&mut self) {
        if let Some(arena) = self.arena.borrow_mut().take() {
            debug!("[GPU] {} releasing {} resources", self.name, arena.live());
        }
    }

    fn free_unused_memory(&mut self) {
        if let Some(arena) = self.arena.borrow_mut().as_mut() {
            arena.compact();
        }
    }

    fn power_off(&mut self) {
        if let Some(arena) = self.arena.borrow_mut().as_mut() {
            arena.clear();
        }
    }

    fn guest_api(&self) -> Option<Rc<dyn GuestApi>> {
        Some(Rc::new(GpuApi {
            name: self.name.clone(),
            arena: self.arena.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{computer::Computer, config::ComputerConfig};

    fn handle(result: ApiResult) -> Value {
        match result {
            ApiResult::Return(mut values) => values.remove(0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_images_are_charged_and_freed_on_detach() {
        let config = ComputerConfig {
            memory_budget: 1024,
            ..Default::default()
        };
        let mut computer = Computer::new(&config);
        let gpu = computer.attach_device("gpu", GpuDevice::new()).unwrap();
        let api = gpu.borrow().guest_api().unwrap();

        let image = handle(
            api.call("newImage", &[Value::Integer(16), Value::Integer(16)])
                .unwrap(),
        );
        let palette = handle(api.call("newPalette", &[Value::Integer(16)]).unwrap());
        assert_eq!(computer.memory().used(), 256 + 48);

        api.call(
            "setPixel",
            &[image.clone(), Value::Integer(3), Value::Integer(4), Value::Integer(7)],
        )
        .unwrap();
        assert_eq!(
            api.call("getPixel", &[image.clone(), Value::Integer(3), Value::Integer(4)])
                .unwrap(),
            ApiResult::one(7i64)
        );
        assert!(api
            .call("getPixel", &[image, Value::Integer(16), Value::Integer(0)])
            .is_err());

        api.call(
            "setColor",
            &[
                palette.clone(),
                Value::Integer(1),
                Value::Integer(255),
                Value::Integer(128),
                Value::Integer(0),
            ],
        )
        .unwrap();
        assert_eq!(
            api.call("getColor", &[palette, Value::Integer(1)]).unwrap(),
            ApiResult::Return(vec![
                Value::Integer(255),
                Value::Integer(128),
                Value::Integer(0)
            ])
        );

        assert!(api
            .call("newImage", &[Value::Integer(64), Value::Integer(64)])
            .is_err());

        computer.detach_device("gpu").unwrap();
        assert_eq!(computer.memory().used(), 0);
        assert!(api.call("newPalette", &[Value::Integer(1)]).is_err());
    }

    #[test]
    fn test_extreme_arguments_are_guest_errors() {
        let mut computer = Computer::new(&ComputerConfig::default());
        let gpu = computer.attach_device("gpu", GpuDevice::new()).unwrap();
        let api = gpu.borrow().guest_api().unwrap();
        let huge = Value::Integer(i64::MAX);

        let image = handle(
            api.call("newImage", &[Value::Integer(4), Value::Integer(4)])
                .unwrap(),
        );
        let palette = handle(api.call("newPalette", &[Value::Integer(2)]).unwrap());

        assert!(api
            .call("getPixel", &[image.clone(), Value::Integer(0), huge.clone()])
            .is_err());
        assert!(api
            .call(
                "setPixel",
                &[image.clone(), huge.clone(), huge.clone(), Value::Integer(1)]
            )
            .is_err());
        assert!(api.call("getColor", &[palette.clone(), huge.clone()]).is_err());
        assert!(api
            .call(
                "setColor",
                &[
                    palette.clone(),
                    huge.clone(),
                    Value::Integer(1),
                    Value::Integer(2),
                    Value::Integer(3),
                ],
            )
            .is_err());
        assert!(api.call("getSize", &[huge]).is_err());
        assert!(api.call("getSize", &[Value::Integer(-1)]).is_err());

        // A released image stays dead after its slot is reused.
        api.call("release", &[image.clone()]).unwrap();
        let other = handle(
            api.call("newImage", &[Value::Integer(4), Value::Integer(4)])
                .unwrap(),
        );
        assert_ne!(image, other);
        assert_eq!(
            api.call(
                "setPixel",
                &[image.clone(), Value::Integer(0), Value::Integer(0), Value::Integer(9)]
            ),
            Err(GuestError::Runtime(
                "attempt to use a released resource".to_string()
            ))
        );
        assert_eq!(
            api.call("getPixel", &[other, Value::Integer(0), Value::Integer(0)])
                .unwrap(),
            ApiResult::one(0i64)
        );
        assert!(api.call("release", &[image]).is_err());
        assert_eq!(computer.memory().used(), 16 + 6);
    }
}
