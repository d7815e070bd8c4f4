use std::{cell::RefCell, rc::Rc, time::Duration};

use tracing::{debug, trace};

use crate::{
    computer::Bus,
    device::{Device, DeviceUpdateResult},
    event::names,
    guest::{arg_f64, arg_i64, ApiResult, GuestApi, GuestError},
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScheduleKind {
    Timer,
    Alarm,
}

impl ScheduleKind {
    fn event(self) -> &'static str {
        match self {
            ScheduleKind::Timer => names::TIMER,
            ScheduleKind::Alarm => names::ALARM,
        }
    }
}

/// Scheduled event with timing information
#[derive(Debug)]
struct Scheduled {
    id: u32,
    kind: ScheduleKind,
    deadline: Duration,
}

#[derive(Debug, Default)]
struct Schedule {
    now: Duration,
    pending: Vec<Scheduled>,
    // Ids are never recycled. After 2^32 allocations a counter wraps and may
    // hand out an id that is still pending.
    next_timer: u32,
    next_alarm: u32,
}

impl Schedule {
    fn add(&mut self, kind: ScheduleKind, deadline: Duration) -> u32 {
        let counter = match kind {
            ScheduleKind::Timer => &mut self.next_timer,
            ScheduleKind::Alarm => &mut self.next_alarm,
        };
        *counter = counter.wrapping_add(1);
        let id = *counter;
        trace!("[CLK] {:?} {} due at {:?}", kind, id, deadline);
        self.pending.push(Scheduled { id, kind, deadline });
        id
    }

    fn cancel(&mut self, kind: ScheduleKind, id: u32) -> bool {
        let before = self.pending.len();
        self.pending.retain(|s| !(s.kind == kind && s.id == id));
        self.pending.len() != before
    }

    /// Removes everything due at `now`, earliest first.
    fn expire(&mut self, now: Duration) -> Vec<Scheduled> {
        self.now = now;
        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|s| s.deadline <= now);
        self.pending = pending;
        due.sort_by_key(|s| (s.deadline, s.id));
        due
    }
}

struct ClockApi {
    name: String,
    schedule: Rc<RefCell<Schedule>>,
}

impl ClockApi {
    fn seconds(function: &str, args: &[Value]) -> Result<Duration, GuestError> {
        let seconds = arg_f64(function, args, 0)?;
        Duration::try_from_secs_f64(seconds).map_err(|_| GuestError::BadArgument {
            function: function.to_string(),
            index: 1,
            message: "non-negative number of seconds expected".to_string(),
        })
    }

    fn id(function: &str, args: &[Value]) -> Result<u32, GuestError> {
        let id = arg_i64(function, args, 0)?;
        Ok(u32::try_from(id).unwrap_or(0))
    }
}

impl GuestApi for ClockApi {
    fn name(&self) -> &str {
        &self.name
    }

    fn functions(&self) -> &[&'static str] {
        &["getTime", "startTimer", "setAlarm", "cancelTimer", "cancelAlarm"]
    }

    fn call(&self, function: &str, args: &[Value]) -> Result<ApiResult, GuestError> {
        let mut schedule = self.schedule.borrow_mut();
        match function {
            "getTime" => Ok(ApiResult::one(schedule.now.as_secs_f64())),
            "startTimer" => {
                let deadline = schedule
                    .now
                    .checked_add(Self::seconds(function, args)?)
                    .ok_or_else(|| GuestError::BadArgument {
                        function: function.to_string(),
                        index: 1,
                        message: "timer would expire past the end of time".to_string(),
                    })?;
                Ok(ApiResult::one(schedule.add(ScheduleKind::Timer, deadline)))
            }
            "setAlarm" => {
                let at = Self::seconds(function, args)?;
                Ok(ApiResult::one(schedule.add(ScheduleKind::Alarm, at)))
            }
            "cancelTimer" => {
                let id = Self::id(function, args)?;
                Ok(ApiResult::one(schedule.cancel(ScheduleKind::Timer, id)))
            }
            "cancelAlarm" => {
                let id = Self::id(function, args)?;
                Ok(ApiResult::one(schedule.cancel(ScheduleKind::Alarm, id)))
            }
            _ => Err(GuestError::UnknownFunction(function.to_string())),
        }
    }
}

/// Machine clock. Timers count from when they are started; alarms fire at an
/// absolute machine uptime.
#[derive(Debug, Default)]
pub struct ClockDevice {
    schedule: Rc<RefCell<Schedule>>,
    bus: Option<Bus>,
    name: String,
}

impl ClockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.schedule.borrow().pending.len()
    }

    pub fn start_timer(&self, after: Duration) -> u32 {
        let mut schedule = self.schedule.borrow_mut();
        // Saturated deadlines never fire.
        let deadline = schedule.now.saturating_add(after);
        schedule.add(ScheduleKind::Timer, deadline)
    }

    pub fn set_alarm(&self, at: Duration) -> u32 {
        self.schedule.borrow_mut().add(ScheduleKind::Alarm, at)
    }
}

impl Device for ClockDevice {
    fn device_type(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Timers and alarms"
    }

    fn attach(&mut self, bus: &Bus, name: &str) {
        self.bus = Some(bus.clone());
        self.name = name.to_string();
        self.schedule.borrow_mut().now = bus.uptime();
    }

    fn detach(&mut self) {
        self.bus = None;
        self.schedule.borrow_mut().pending.clear();
    }

    fn update(&mut self, _dt: Duration) -> DeviceUpdateResult {
        let Some(bus) = &self.bus else {
            return DeviceUpdateResult::Continue;
        };
        let due = self.schedule.borrow_mut().expire(bus.uptime());
        for scheduled in due {
            bus.queue_event(scheduled.kind.event(), vec![Value::from(scheduled.id)]);
        }
        DeviceUpdateResult::Continue
    }

    fn boot(&mut self) -> DeviceUpdateResult {
        if let Some(bus) = &self.bus {
            self.schedule.borrow_mut().now = bus.uptime();
        }
        DeviceUpdateResult::Continue
    }

    fn power_off(&mut self) {
        let mut schedule = self.schedule.borrow_mut();
        debug!("[CLK] dropping {} pending timers", schedule.pending.len());
        schedule.pending.clear();
        schedule.now = Duration::ZERO;
    }

    fn guest_api(&self) -> Option<Rc<dyn GuestApi>> {
        self.bus.as_ref()?;
        Some(Rc::new(ClockApi {
            name: self.name.clone(),
            schedule: self.schedule.clone(),
        }))
    }
}
