//! Virtual keyboard used to synthesize the injection key
//!
//! Creates one uinput device advertising exactly one key. Events written
//! to it reach the compositor the same way a physical keyboard's would.

use std::io;

use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, EventType, InputEvent, Key};
use tracing::{debug, info, warn};

/// Name of the virtual device; devices with this name are never watched
pub const VIRTUAL_DEVICE_NAME: &str = "Super Tap Daemon";

/// Something that can emit one full tap of the injection key
pub trait Injector {
    /// Emit key-down then key-up, returning once both are written
    fn fire(&mut self) -> Result<(), InjectError>;
}

/// Errors from the injection device
#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error("failed to create virtual device - is /dev/uinput accessible? ({0})")]
    Create(#[source] io::Error),

    #[error("failed to write {key:?} to virtual device: {source}")]
    Write {
        key: Key,
        #[source]
        source: io::Error,
    },

    #[error("failed to release {key:?}, key may be stuck down: {source}")]
    StuckKey {
        key: Key,
        #[source]
        source: io::Error,
    },
}

/// The key-down and key-up records of one tap, in write order
pub fn tap_events(key: Key) -> [InputEvent; 2] {
    [
        InputEvent::new(EventType::KEY, key.code(), 1),
        InputEvent::new(EventType::KEY, key.code(), 0),
    ]
}

/// Write one tap through `write`
///
/// A failed key-up is retried once, since giving up leaves the key held
/// down on the virtual keyboard.
fn emit_tap<W>(key: Key, mut write: W) -> Result<(), InjectError>
where
    W: FnMut(InputEvent) -> io::Result<()>,
{
    let [down, up] = tap_events(key);
    write(down).map_err(|source| InjectError::Write { key, source })?;

    if let Err(e) = write(up) {
        warn!(?key, error = %e, "key-up write failed, retrying");
        write(up).map_err(|source| InjectError::StuckKey { key, source })?;
    }
    Ok(())
}

/// Injector backed by a uinput virtual keyboard
pub struct UinputInjector {
    device: VirtualDevice,
    key: Key,
}

impl UinputInjector {
    /// Create the virtual device
    ///
    /// Without it the daemon cannot do anything, so callers treat
    /// failure as fatal.
    pub fn new(key: Key) -> Result<Self, InjectError> {
        let mut keys = AttributeSet::<Key>::new();
        keys.insert(key);

        let device = VirtualDeviceBuilder::new()
            .and_then(|builder| builder.name(VIRTUAL_DEVICE_NAME).with_keys(&keys))
            .and_then(|builder| builder.build())
            .map_err(InjectError::Create)?;

        info!(?key, name = VIRTUAL_DEVICE_NAME, "virtual injection device created");
        Ok(Self { device, key })
    }
}

impl Injector for UinputInjector {
    fn fire(&mut self) -> Result<(), InjectError> {
        // emit() appends the SYN_REPORT after each record
        let device = &mut self.device;
        emit_tap(self.key, |event| device.emit(&[event]))?;
        debug!(key = ?self.key, "injected tap");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run one tap against a sink that fails the numbered attempts
    fn tap_with_failures(fail_on: &[usize]) -> (Result<(), InjectError>, Vec<i32>) {
        let mut attempt = 0;
        let mut written = Vec::new();
        let result = emit_tap(Key::KEY_LEFTCTRL, |event| {
            attempt += 1;
            if fail_on.contains(&attempt) {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            written.push(event.value());
            Ok(())
        });
        (result, written)
    }

    #[test]
    fn test_tap_events_are_down_then_up() {
        let [down, up] = tap_events(Key::KEY_LEFTCTRL);

        assert_eq!(down.event_type(), EventType::KEY);
        assert_eq!(down.code(), Key::KEY_LEFTCTRL.code());
        assert_eq!(down.value(), 1);

        assert_eq!(up.event_type(), EventType::KEY);
        assert_eq!(up.code(), Key::KEY_LEFTCTRL.code());
        assert_eq!(up.value(), 0);
    }

    #[test]
    fn test_clean_write() {
        let (result, written) = tap_with_failures(&[]);
        assert!(result.is_ok());
        assert_eq!(written, vec![1, 0]);
    }

    #[test]
    fn test_failed_down_writes_nothing_else() {
        let (result, written) = tap_with_failures(&[1]);
        assert!(matches!(result, Err(InjectError::Write { key, .. }) if key == Key::KEY_LEFTCTRL));
        assert!(written.is_empty());
    }

    #[test]
    fn test_failed_up_is_retried() {
        let (result, written) = tap_with_failures(&[2]);
        assert!(result.is_ok());
        assert_eq!(written, vec![1, 0]);
    }

    #[test]
    fn test_failed_retry_reports_stuck_key() {
        let (result, written) = tap_with_failures(&[2, 3]);
        assert_eq!(written, vec![1]);

        let err = result.unwrap_err();
        assert!(matches!(err, InjectError::StuckKey { key, .. } if key == Key::KEY_LEFTCTRL));
        assert!(err.to_string().contains("may be stuck"));
    }
}
