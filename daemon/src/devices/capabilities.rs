//! Device classification and filtering
//!
//! Decides which input devices are worth watching: anything that can
//! type or point, minus virtual devices and our own injector.

use evdev::{AttributeSetRef, Key};

use crate::config::Config;
use crate::injector::VIRTUAL_DEVICE_NAME;

/// `BUS_VIRTUAL` from linux/input.h
const BUS_VIRTUAL: u16 = 0x06;

/// What a device can report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Reports keyboard keys
    pub keyboard: bool,
    /// Reports relative motion or pointer buttons
    pub pointer: bool,
}

impl Capabilities {
    /// Classify from the device's advertised key set and relative axes
    pub fn classify(keys: Option<&AttributeSetRef<Key>>, has_relative: bool, trigger: Key) -> Self {
        let keyboard = keys.map_or(false, |keys| {
            (keys.contains(Key::KEY_A) && keys.contains(Key::KEY_SPACE)) || keys.contains(trigger)
        });
        let pointer = has_relative || keys.map_or(false, |keys| keys.contains(Key::BTN_LEFT));

        Self { keyboard, pointer }
    }

    /// Device can neither type nor point
    pub fn is_empty(&self) -> bool {
        !self.keyboard && !self.pointer
    }
}

impl std::fmt::Display for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.keyboard, self.pointer) {
            (true, true) => write!(f, "keyboard+pointer"),
            (true, false) => write!(f, "keyboard"),
            (false, true) => write!(f, "pointer"),
            (false, false) => write!(f, "none"),
        }
    }
}

/// Rules for which devices are never watched
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    pub trigger: Key,
    pub ignore_virtual: bool,
    pub ignored_names: Vec<String>,
}

impl DeviceFilter {
    pub fn from_config(config: &Config) -> Self {
        Self {
            trigger: config.trigger_key,
            ignore_virtual: config.ignore_virtual_devices,
            ignored_names: config.ignored_device_names.clone(),
        }
    }

    /// Check a device's identity before looking at its capabilities
    pub fn admits(&self, name: &str, bus_type: u16) -> bool {
        if name == VIRTUAL_DEVICE_NAME {
            return false;
        }
        if self
            .ignored_names
            .iter()
            .any(|ignored| !ignored.is_empty() && name.contains(ignored.as_str()))
        {
            return false;
        }
        !(self.ignore_virtual && bus_type == BUS_VIRTUAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdev::AttributeSet;

    fn keys(list: &[Key]) -> AttributeSet<Key> {
        let mut set = AttributeSet::<Key>::new();
        for key in list {
            set.insert(*key);
        }
        set
    }

    fn filter() -> DeviceFilter {
        DeviceFilter {
            trigger: Key::KEY_LEFTMETA,
            ignore_virtual: true,
            ignored_names: vec!["Tiling Shell Proxy Device".to_string()],
        }
    }

    #[test]
    fn test_full_keyboard() {
        let set = keys(&[Key::KEY_A, Key::KEY_SPACE, Key::KEY_LEFTMETA]);
        let caps = Capabilities::classify(Some(&*set), false, Key::KEY_LEFTMETA);
        assert!(caps.keyboard);
        assert!(!caps.pointer);
    }

    #[test]
    fn test_trigger_only_device_is_keyboard() {
        let set = keys(&[Key::KEY_LEFTMETA]);
        let caps = Capabilities::classify(Some(&*set), false, Key::KEY_LEFTMETA);
        assert!(caps.keyboard);
    }

    #[test]
    fn test_mouse_and_touchpad() {
        let mouse = Capabilities::classify(None, true, Key::KEY_LEFTMETA);
        assert_eq!(mouse, Capabilities { keyboard: false, pointer: true });

        let set = keys(&[Key::BTN_LEFT, Key::BTN_TOUCH]);
        let touchpad = Capabilities::classify(Some(&*set), false, Key::KEY_LEFTMETA);
        assert_eq!(touchpad, Capabilities { keyboard: false, pointer: true });
    }

    #[test]
    fn test_power_button_is_ignored() {
        let set = keys(&[Key::KEY_POWER]);
        let caps = Capabilities::classify(Some(&*set), false, Key::KEY_LEFTMETA);
        assert!(caps.is_empty());
        assert!(Capabilities::classify(None, false, Key::KEY_LEFTMETA).is_empty());
    }

    #[test]
    fn test_filter_rejects_own_and_proxy_devices() {
        let filter = filter();
        assert!(!filter.admits(VIRTUAL_DEVICE_NAME, 0x03));
        assert!(!filter.admits("Tiling Shell Proxy Device 1", 0x03));
        assert!(filter.admits("AT Translated Set 2 keyboard", 0x11));
    }

    #[test]
    fn test_filter_virtual_bus() {
        let mut filter = filter();
        assert!(!filter.admits("ydotoold virtual device", BUS_VIRTUAL));
        filter.ignore_virtual = false;
        assert!(filter.admits("ydotoold virtual device", BUS_VIRTUAL));
    }

    #[test]
    fn test_display() {
        let caps = Capabilities { keyboard: true, pointer: true };
        assert_eq!(caps.to_string(), "keyboard+pointer");
    }
}
