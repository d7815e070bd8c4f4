use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    rc::Rc,
};

use tracing::trace;

use crate::{
    computer::Bus,
    device::Device,
    event::names,
    guest::{arg_str, ApiResult, GuestApi, GuestError},
    value::Value,
};

#[derive(Debug, Default)]
struct PadState {
    buttons: HashSet<String>,
    axes: HashMap<String, f64>,
}

struct GamepadApi {
    name: String,
    state: Rc<RefCell<PadState>>,
}

impl GuestApi for GamepadApi {
    fn name(&self) -> &str {
        &self.name
    }

    fn functions(&self) -> &[&'static str] {
        &["isButtonDown", "getAxis"]
    }

    fn call(&self, function: &str, args: &[Value]) -> Result<ApiResult, GuestError> {
        let state = self.state.borrow();
        match function {
            "isButtonDown" => {
                let button = arg_str(function, args, 0)?;
                Ok(ApiResult::one(state.buttons.contains(button)))
            }
            "getAxis" => {
                let axis = arg_str(function, args, 0)?;
                Ok(ApiResult::one(state.axes.get(axis).copied().unwrap_or(0.0)))
            }
            _ => Err(GuestError::UnknownFunction(function.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct GamepadDevice {
    state: Rc<RefCell<PadState>>,
    bus: Option<Bus>,
    name: String,
}

impl GamepadDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn raise(&self, event: &str, arguments: Vec<Value>) {
        if let Some(bus) = &self.bus {
            bus.queue_event(event, arguments);
        }
    }

    pub fn button_down(&mut self, button: &str) {
        if self.state.borrow_mut().buttons.insert(button.to_string()) {
            trace!("[PAD] down {}", button);
            self.raise(names::GAMEPAD_BUTTON, vec![Value::from(button)]);
        }
    }

    pub fn button_up(&mut self, button: &str) {
        if self.state.borrow_mut().buttons.remove(button) {
            trace!("[PAD] up {}", button);
            self.raise(names::GAMEPAD_UP, vec![Value::from(button)]);
        }
    }

    /// Records an axis position in [-1, 1]; an event is raised only when the
    /// value changes.
    pub fn axis(&mut self, axis: &str, value: f64) {
        let value = value.clamp(-1.0, 1.0);
        let previous = self
            .state
            .borrow_mut()
            .axes
            .insert(axis.to_string(), value);
        if previous != Some(value) {
            self.raise(
                names::GAMEPAD_AXIS,
                vec![Value::from(axis), Value::from(value)],
            );
        }
    }

    pub fn is_button_down(&self, button: &str) -> bool {
        self.state.borrow().buttons.contains(button)
    }
}

impl Device for GamepadDevice {
    fn device_type(&self) -> &str {
        "gamepad"
    }

    fn description(&self) -> &str {
        "Gamepad"
    }

    fn attach(&mut self, bus: &Bus, name: &str) {
        self.bus = Some(bus.clone());
        self.name = name.to_string();
    }

    fn detach(&mut self) {
        self.bus = None;
        let mut state = self.state.borrow_mut();
        state.buttons.clear();
        state.axes.clear();
    }

    fn guest_api(&self) -> Option<Rc<dyn GuestApi>> {
        Some(Rc::new(GamepadApi {
            name: self.name.clone(),
            state: self.state.clone(),
        }))
    }
}
