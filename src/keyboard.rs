use std::{cell::RefCell, collections::HashSet, rc::Rc};

use tracing::trace;

use crate::{
    computer::Bus,
    device::Device,
    event::names,
    guest::{arg_str, ApiResult, GuestApi, GuestError},
    value::Value,
};

type Pressed = Rc<RefCell<HashSet<String>>>;

struct KeyboardApi {
    name: String,
    pressed: Pressed,
}

impl GuestApi for KeyboardApi {
    fn name(&self) -> &str {
        &self.name
    }

    fn functions(&self) -> &[&'static str] {
        &["isKeyDown"]
    }

    fn call(&self, function: &str, args: &[Value]) -> Result<ApiResult, GuestError> {
        match function {
            "isKeyDown" => {
                let key = arg_str(function, args, 0)?;
                Ok(ApiResult::one(self.pressed.borrow().contains(key)))
            }
            _ => Err(GuestError::UnknownFunction(function.to_string())),
        }
    }
}

/// Turns host key input into `key`, `key_up`, `char` and `text` events.
#[derive(Debug, Default)]
pub struct KeyboardDevice {
    pressed: Pressed,
    bus: Option<Bus>,
    name: String,
}

impl KeyboardDevice {
    pub fn new() -> Self {
        KeyboardDevice::default()
    }

    fn raise(&self, event: &str, arguments: Vec<Value>) {
        if let Some(bus) = &self.bus {
            bus.queue_event(event, arguments);
        }
    }

    pub fn key_down(&mut self, key: &str, repeat: bool) {
        trace!("[KBD] down {} (repeat: {})", key, repeat);
        self.pressed.borrow_mut().insert(key.to_string());
        self.raise(names::KEY, vec![Value::from(key), Value::from(repeat)]);
    }

    pub fn key_up(&mut self, key: &str) {
        trace!("[KBD] up {}", key);
        if self.pressed.borrow_mut().remove(key) {
            self.raise(names::KEY_UP, vec![Value::from(key)]);
        }
    }

    pub fn char_typed(&mut self, ch: char) {
        self.raise(names::CHAR, vec![Value::from(ch.to_string())]);
    }

    pub fn text_input(&mut self, text: &str) {
        if !text.is_empty() {
            self.raise(names::TEXT, vec![Value::from(text)]);
        }
    }

    pub fn is_key_down(&self, key: &str) -> bool {
        self.pressed.borrow().contains(key)
    }
}

impl Device for KeyboardDevice {
    fn device_type(&self) -> &str {
        "keyboard"
    }

    fn description(&self) -> &str {
        "Keyboard"
    }

    fn attach(&mut self, bus: &Bus, name: &str) {
        self.bus = Some(bus.clone());
        self.name = name.to_string();
    }

    fn detach(&mut self) {
        self.bus = None;
        self.pressed.borrow_mut().clear();
    }

    fn power_off(&mut self) {
        self.pressed.borrow_mut().clear();
    }

    fn guest_api(&self) -> Option<Rc<dyn GuestApi>> {
        Some(Rc::new(KeyboardApi {
            name: self.name.clone(),
            pressed: self.pressed.clone(),
        }))
    }
}
