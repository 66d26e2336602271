//! Key name lookup and key record values
//!
//! Configuration refers to keys by their evdev names (`KEY_LEFTMETA`)
//! or by a bare decimal key code.

use evdev::Key;

/// Highest key code the kernel accepts (`KEY_MAX`)
const KEY_MAX: u16 = 0x2ff;

/// Key names accepted in the configuration file
const KEY_NAMES: &[(&str, Key)] = &[
    ("KEY_LEFTMETA", Key::KEY_LEFTMETA),
    ("KEY_RIGHTMETA", Key::KEY_RIGHTMETA),
    ("KEY_LEFTCTRL", Key::KEY_LEFTCTRL),
    ("KEY_RIGHTCTRL", Key::KEY_RIGHTCTRL),
    ("KEY_LEFTALT", Key::KEY_LEFTALT),
    ("KEY_RIGHTALT", Key::KEY_RIGHTALT),
    ("KEY_LEFTSHIFT", Key::KEY_LEFTSHIFT),
    ("KEY_RIGHTSHIFT", Key::KEY_RIGHTSHIFT),
    ("KEY_CAPSLOCK", Key::KEY_CAPSLOCK),
    ("KEY_COMPOSE", Key::KEY_COMPOSE),
    ("KEY_MENU", Key::KEY_MENU),
    ("KEY_ESC", Key::KEY_ESC),
    ("KEY_F13", Key::KEY_F13),
    ("KEY_F14", Key::KEY_F14),
    ("KEY_F15", Key::KEY_F15),
    ("KEY_F16", Key::KEY_F16),
    ("KEY_F17", Key::KEY_F17),
    ("KEY_F18", Key::KEY_F18),
    ("KEY_F19", Key::KEY_F19),
    ("KEY_F20", Key::KEY_F20),
];

/// Resolve a configured key identifier
///
/// Names are matched case-insensitively; a plain number is taken as
/// a raw key code. Returns `None` for anything else.
pub fn parse_key(name: &str) -> Option<Key> {
    let name = name.trim();

    if let Ok(code) = name.parse::<u16>() {
        return key_from_code(code);
    }

    let upper = name.to_ascii_uppercase();
    KEY_NAMES
        .iter()
        .find(|(known, _)| *known == upper)
        .map(|(_, key)| *key)
}

/// Accept a raw key code if the kernel could ever report it
pub fn key_from_code(code: u16) -> Option<Key> {
    (code > 0 && code <= KEY_MAX).then(|| Key::new(code))
}

/// Value carried by a key record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyValue {
    Release,
    Press,
    /// Autorepeat while held
    Repeat,
}

impl KeyValue {
    /// Map the raw record value; anything outside 0..=2 is not a key state
    pub fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Release),
            1 => Some(Self::Press),
            2 => Some(Self::Repeat),
            _ => None,
        }
    }
}

impl std::fmt::Display for KeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyValue::Release => write!(f, "up"),
            KeyValue::Press => write!(f, "down"),
            KeyValue::Repeat => write!(f, "repeat"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_names() {
        assert_eq!(parse_key("KEY_LEFTMETA"), Some(Key::KEY_LEFTMETA));
        assert_eq!(parse_key("key_rightctrl"), Some(Key::KEY_RIGHTCTRL));
        assert_eq!(parse_key("  KEY_CAPSLOCK "), Some(Key::KEY_CAPSLOCK));
    }

    #[test]
    fn test_parse_numeric_code() {
        assert_eq!(parse_key("125"), Some(Key::KEY_LEFTMETA));
        assert_eq!(parse_key("0"), None);
        assert_eq!(parse_key("4096"), None);
    }

    #[test]
    fn test_parse_unknown_name() {
        assert_eq!(parse_key("KEY_NOT_A_KEY"), None);
        assert_eq!(parse_key(""), None);
    }

    #[test]
    fn test_key_value_from_raw() {
        assert_eq!(KeyValue::from_raw(0), Some(KeyValue::Release));
        assert_eq!(KeyValue::from_raw(1), Some(KeyValue::Press));
        assert_eq!(KeyValue::from_raw(2), Some(KeyValue::Repeat));
        assert_eq!(KeyValue::from_raw(3), None);
        assert_eq!(KeyValue::from_raw(-1), None);
    }
}
