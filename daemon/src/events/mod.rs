//! Raw input records delivered by the device readers
//!
//! Every record keeps the timestamp the kernel stamped on it, so
//! durations between records do not depend on how quickly the event
//! loop got around to them.

mod keys;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use evdev::{InputEventKind, Key, RelativeAxisType};

use crate::devices::DeviceKey;

pub use keys::{key_from_code, parse_key, KeyValue};

/// Timestamp taken from the originating kernel record
///
/// Devices are switched to `CLOCK_MONOTONIC`, so this is time since
/// boot rather than wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct EventTime(Duration);

impl EventTime {
    #[cfg(test)]
    pub fn new(since_origin: Duration) -> Self {
        Self(since_origin)
    }

    #[cfg(test)]
    pub fn from_secs_f64(secs: f64) -> Self {
        Self(Duration::from_secs_f64(secs))
    }

    /// Convert the `SystemTime` evdev builds from the record's timeval
    pub fn from_system_time(time: SystemTime) -> Self {
        Self(time.duration_since(UNIX_EPOCH).unwrap_or_default())
    }

    /// Time from `earlier` to `self`, zero if the clock went backwards
    pub fn since(&self, earlier: EventTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

/// What a record says happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A key or button changed state
    Key { key: Key, value: KeyValue },
    /// Relative pointer activity (motion, wheel)
    Motion { axis: RelativeAxisType, delta: i32 },
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Key { key, value } => write!(f, "{:?} {}", key, value),
            EventKind::Motion { axis, delta } => write!(f, "{:?} {:+}", axis, delta),
        }
    }
}

/// One typed record tagged with its source device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub device: DeviceKey,
    pub kind: EventKind,
    pub time: EventTime,
}

impl RawEvent {
    pub fn key(device: DeviceKey, key: Key, value: KeyValue, time: EventTime) -> Self {
        Self {
            device,
            kind: EventKind::Key { key, value },
            time,
        }
    }

    pub fn motion(device: DeviceKey, axis: RelativeAxisType, delta: i32, time: EventTime) -> Self {
        Self {
            device,
            kind: EventKind::Motion { axis, delta },
            time,
        }
    }

    /// Translate an evdev record; sync, absolute and misc records yield `None`
    pub fn from_evdev(device: DeviceKey, event: &evdev::InputEvent) -> Option<Self> {
        let time = EventTime::from_system_time(event.timestamp());
        match event.kind() {
            InputEventKind::Key(key) => {
                let value = KeyValue::from_raw(event.value())?;
                Some(Self::key(device, key, value, time))
            }
            InputEventKind::RelAxis(axis) => Some(Self::motion(device, axis, event.value(), time)),
            _ => None,
        }
    }
}
