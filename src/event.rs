use std::collections::{HashSet, VecDeque};

use tracing::{trace, warn};

use crate::value::Value;

pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

/// Names of the events raised by the stock peripherals.
pub mod names {
    pub const TIMER: &str = "timer";
    pub const ALARM: &str = "alarm";
    pub const DISK_CHANGED: &str = "disk_changed";
    pub const KEY: &str = "key";
    pub const KEY_UP: &str = "key_up";
    pub const CHAR: &str = "char";
    pub const TEXT: &str = "text";
    pub const GAMEPAD_BUTTON: &str = "gamepad_button";
    pub const GAMEPAD_UP: &str = "gamepad_up";
    pub const GAMEPAD_AXIS: &str = "gamepad_axis";
    pub const SOUND_COMPLETE: &str = "sound_complete";
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub arguments: Vec<Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// The values handed to a guest when it is resumed with this event.
    pub fn to_values(&self) -> Vec<Value> {
        let mut values = Vec::with_capacity(self.arguments.len() + 1);
        values.push(Value::String(self.name.clone()));
        values.extend(self.arguments.iter().cloned());
        values
    }
}

/// FIFO of pending events, bounded so a flood of input cannot grow it
/// without limit.
#[derive(Debug)]
pub struct EventQueue {
    events: VecDeque<Event>,
    capacity: usize,
    dropped: u64,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_QUEUE_CAPACITY)
    }
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    pub fn queue(&mut self, name: &str, arguments: Vec<Value>) -> bool {
        if self.events.len() >= self.capacity {
            self.dropped += 1;
            warn!(
                "[EVT] queue full ({}), dropping '{}' ({} dropped so far)",
                self.capacity, name, self.dropped
            );
            return false;
        }
        trace!("[EVT] queue {} {:?}", name, arguments);
        self.events.push_back(Event::new(name, arguments));
        true
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Takes everything queued so far. Events queued while these are being
    /// handled wait for the next tick.
    pub fn drain_pending(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// The set of event names a CPU is subscribed to. Empty means everything.
/// A `None` entry is the wildcard and matches unnamed events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    names: HashSet<Option<String>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Builds a filter from the values a guest yielded or returned. Nil
    /// values are skipped; other non-strings become the wildcard entry.
    pub fn from_values(values: &[Value]) -> Self {
        let names = values
            .iter()
            .filter(|v| !v.is_nil())
            .map(|v| v.as_str().map(str::to_string))
            .collect();
        Self { names }
    }

    pub fn is_all(&self) -> bool {
        self.names.is_empty()
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }

    pub fn admits(&self, event: &Event) -> bool {
        if self.names.is_empty() {
            return true;
        }
        let key = if event.name.is_empty() {
            None
        } else {
            Some(event.name.clone())
        };
        self.names.contains(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = EventQueue::default();
        queue.queue("a", vec![]);
        queue.queue("b", vec![Value::Integer(1)]);

        assert_eq!(queue.pop().unwrap().name, "a");
        assert_eq!(queue.pop().unwrap().arguments, vec![Value::Integer(1)]);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_capacity() {
        let mut queue = EventQueue::new(2);
        assert!(queue.queue("a", vec![]));
        assert!(queue.queue("b", vec![]));
        assert!(!queue.queue("c", vec![]));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_filter_subscribe_all() {
        let filter = EventFilter::from_values(&[]);
        assert!(filter.is_all());
        assert!(filter.admits(&Event::new("key_up", vec![])));
    }

    #[test]
    fn test_filter_named() {
        let filter = EventFilter::from_values(&[Value::from("key")]);
        assert!(filter.admits(&Event::new("key", vec![])));
        assert!(!filter.admits(&Event::new("key_up", vec![])));
    }

    #[test]
    fn test_filter_wildcard_entry() {
        let filter = EventFilter::from_values(&[Value::Nil, Value::Boolean(true)]);
        assert!(!filter.is_all());
        assert!(filter.admits(&Event::new("", vec![])));
        assert!(!filter.admits(&Event::new("timer", vec![])));
    }

    #[test]
    fn test_event_values() {
        let event = Event::new("timer", vec![Value::Integer(3)]);
        assert_eq!(
            event.to_values(),
            vec![Value::from("timer"), Value::Integer(3)]
        );
    }
}
