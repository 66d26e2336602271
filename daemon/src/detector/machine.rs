//! Tap detection state machine
//!
//! Tracks one trigger press at a time and decides, on release, whether
//! it was a lone tap. Any other key press or pointer activity while the
//! trigger is held turns the press into a modifier use.

use std::time::Duration;

use evdev::Key;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::devices::DeviceKey;
use crate::events::{EventKind, EventTime, KeyValue, RawEvent};

/// Where the detector is in the current press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Trigger not held
    Idle,
    /// Trigger held, nothing else happened yet
    Armed,
    /// Trigger held together with other input
    Suppressed,
}

impl Default for State {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Idle => write!(f, "Idle"),
            State::Armed => write!(f, "Armed"),
            State::Suppressed => write!(f, "Suppressed"),
        }
    }
}

/// What the event loop should do after a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Clean tap: emit the injection key
    Fire { elapsed: Duration },
    /// The trigger was released but the press was not a tap
    Ignore(IgnoreReason),
    /// Nothing to decide for this record
    Pass,
}

/// Why a trigger release did not fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Other input arrived while the trigger was held
    Combination { elapsed: Duration },
    /// Held longer than the tap timeout
    HeldTooLong { elapsed: Duration },
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IgnoreReason::Combination { elapsed } => {
                write!(f, "used as modifier ({} ms)", elapsed.as_millis())
            }
            IgnoreReason::HeldTooLong { elapsed } => {
                write!(f, "held too long ({} ms)", elapsed.as_millis())
            }
        }
    }
}

/// State of one physical trigger press
#[derive(Debug, Clone, Copy)]
struct Session {
    pressed_at: EventTime,
    source: DeviceKey,
    /// When the loop saw the press, for computing the wait deadline
    received_at: Instant,
    interrupted: bool,
    window_closed: bool,
}

/// Decides tap versus modifier use of the trigger key
pub struct TapDetector {
    trigger: Key,
    timeout: Duration,
    session: Option<Session>,
}

impl TapDetector {
    pub fn new(trigger: Key, timeout: Duration) -> Self {
        Self {
            trigger,
            timeout,
            session: None,
        }
    }

    pub fn state(&self) -> State {
        match self.session {
            None => State::Idle,
            Some(Session { interrupted: false, .. }) => State::Armed,
            Some(Session { interrupted: true, .. }) => State::Suppressed,
        }
    }

    pub fn trigger(&self) -> Key {
        self.trigger
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Feed one record; `received_at` is when the loop picked it up
    pub fn handle(&mut self, event: &RawEvent, received_at: Instant) -> Decision {
        let from = self.state();
        let decision = self.apply(event, received_at);
        let to = self.state();
        if from != to {
            debug!(%from, %to, "state transition");
        }
        decision
    }

    fn apply(&mut self, event: &RawEvent, received_at: Instant) -> Decision {
        match event.kind {
            EventKind::Key { key, value } if key == self.trigger => match value {
                KeyValue::Press => {
                    self.press(event, received_at);
                    Decision::Pass
                }
                KeyValue::Release => self.release(event.time),
                KeyValue::Repeat => Decision::Pass,
            },
            EventKind::Key {
                value: KeyValue::Press,
                ..
            } => {
                self.interrupt(&event.kind);
                Decision::Pass
            }
            EventKind::Key { .. } => Decision::Pass,
            EventKind::Motion { delta, .. } if delta != 0 => {
                self.interrupt(&event.kind);
                Decision::Pass
            }
            EventKind::Motion { .. } => Decision::Pass,
        }
    }

    fn press(&mut self, event: &RawEvent, received_at: Instant) {
        if let Some(previous) = self.session.take() {
            // No release was seen for the earlier press, so it cannot be a tap
            debug!(source = %previous.source, "trigger pressed again without release, restarting");
        }

        self.session = Some(Session {
            pressed_at: event.time,
            source: event.device,
            received_at,
            interrupted: false,
            window_closed: false,
        });
        debug!(key = ?self.trigger, source = %event.device, "trigger down, armed");
    }

    fn release(&mut self, released_at: EventTime) -> Decision {
        let Some(session) = self.session.take() else {
            return Decision::Pass;
        };

        let elapsed = released_at.since(session.pressed_at);
        let elapsed_ms = elapsed.as_millis() as u64;

        if session.interrupted {
            debug!(elapsed_ms, "trigger released after combination, ignored");
            Decision::Ignore(IgnoreReason::Combination { elapsed })
        } else if elapsed > self.timeout {
            debug!(elapsed_ms, "trigger held too long, ignored");
            Decision::Ignore(IgnoreReason::HeldTooLong { elapsed })
        } else {
            info!(elapsed_ms, "clean tap detected");
            Decision::Fire { elapsed }
        }
    }

    fn interrupt(&mut self, cause: &EventKind) {
        if let Some(session) = self.session.as_mut() {
            if !session.interrupted {
                session.interrupted = true;
                debug!(%cause, "other input while trigger held, suppressed");
            }
        }
    }

    /// When the event loop should wake up on its own
    ///
    /// Only an armed press whose tap window has not yet been observed to
    /// close has a deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.session
            .filter(|session| !session.interrupted && !session.window_closed)
            .map(|session| session.received_at + self.timeout)
    }

    /// The deadline passed with no release
    ///
    /// Nothing fires here; the release decision still uses the record
    /// timestamps. This only stops the loop from waking for it again.
    pub fn window_elapsed(&mut self) {
        if let Some(session) = self.session.as_mut() {
            if !session.window_closed {
                session.window_closed = true;
                debug!(timeout_ms = self.timeout.as_millis() as u64, "tap window closed, trigger still held");
            }
        }
    }

    /// A device went away; a press it started can never be released
    pub fn device_removed(&mut self, device: DeviceKey) {
        if self.session.map_or(false, |session| session.source == device) {
            let from = self.state();
            self.session = None;
            debug!(%device, %from, to = %self.state(), "trigger device removed mid-press, session dropped");
        }
    }
}
