//! Input device discovery, reading and hotplug
//!
//! The registry owns every open keyboard and pointer device. Each device
//! gets a reader task that forwards its records into one channel, and
//! the hotplug watcher reports nodes appearing and disappearing under
//! `/dev/input`.

mod capabilities;
mod hotplug;
mod reader;
mod registry;

pub use capabilities::DeviceFilter;
pub use hotplug::{HotplugEvent, HotplugWatcher};
pub use reader::ReaderMessage;
pub use registry::{DeviceKey, DeviceRegistry};

#[cfg(test)]
pub use capabilities::Capabilities;
#[cfg(test)]
pub use registry::DeviceInfo;

/// Where the kernel exposes evdev nodes
pub const INPUT_DIR: &str = "/dev/input";
