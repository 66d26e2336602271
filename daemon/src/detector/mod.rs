//! Tap detector
//!
//! Explicit state machine with three states:
//! - Idle: trigger key not held
//! - Armed: trigger held alone, a release within the timeout fires
//! - Suppressed: trigger used as a modifier, release does nothing

mod machine;

pub use machine::{Decision, TapDetector};

#[cfg(test)]
pub use machine::State;
