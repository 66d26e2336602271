//! Table of open input devices
//!
//! Devices live in slots addressed by a generation-tagged [`DeviceKey`].
//! Removing a device empties its slot and bumps the generation, so any
//! record still queued from the old handle is recognised as stale and
//! dropped instead of being attributed to whatever reuses the slot.

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use evdev::Device;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::capabilities::{Capabilities, DeviceFilter};
use super::reader::{self, ReaderMessage};

nix::ioctl_write_ptr!(eviocsclockid, b'E', 0xa0, libc::c_int);

/// Identifies one open device handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    slot: usize,
    generation: u32,
}

impl DeviceKey {
    pub fn new(slot: usize, generation: u32) -> Self {
        Self { slot, generation }
    }
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

/// Descriptive facts about an open device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: PathBuf,
    pub name: String,
    pub capabilities: Capabilities,
}

/// Errors while opening a device
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to start event stream for {path}: {source}")]
    Stream {
        path: PathBuf,
        source: std::io::Error,
    },
}

struct DeviceEntry {
    info: DeviceInfo,
    reader: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<DeviceEntry>,
}

/// Owns every watched device and its reader task
pub struct DeviceRegistry {
    slots: Vec<Slot>,
    filter: DeviceFilter,
    records_tx: mpsc::Sender<ReaderMessage>,
    /// Directory of the last enumeration, revisited on rescan
    dir: Option<PathBuf>,
}

impl DeviceRegistry {
    pub fn new(filter: DeviceFilter, records_tx: mpsc::Sender<ReaderMessage>) -> Self {
        Self {
            slots: Vec::new(),
            filter,
            records_tx,
            dir: None,
        }
    }

    /// Open every matching event node currently present in `dir`
    ///
    /// Devices that cannot be opened are logged and skipped. Returns the
    /// number of devices being watched afterwards.
    pub fn enumerate(&mut self, dir: &Path) -> usize {
        self.dir = Some(dir.to_owned());
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot list input devices");
                return self.len();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| is_event_node(path))
            .collect();
        paths.sort();

        for path in paths {
            self.add(&path);
        }

        info!(count = self.len(), "input devices enumerated");
        self.len()
    }

    /// Catch up with the directory after hotplug notices were lost
    ///
    /// Watched devices whose node is gone are removed and their keys
    /// returned; nodes not yet watched are opened as on enumeration.
    /// Does nothing before the first enumeration.
    pub fn rescan(&mut self) -> Vec<DeviceKey> {
        let Some(dir) = self.dir.clone() else {
            return Vec::new();
        };

        let gone: Vec<DeviceKey> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.entry
                    .as_ref()
                    .filter(|entry| !entry.info.path.exists())
                    .map(|_| DeviceKey::new(index, slot.generation))
            })
            .collect();
        for key in &gone {
            self.remove(*key);
        }

        self.enumerate(&dir);
        gone
    }

    /// Open, classify and start reading one device
    ///
    /// Returns `None` when the path is already watched, filtered out,
    /// lacks useful capabilities or cannot be opened.
    pub fn add(&mut self, path: &Path) -> Option<DeviceKey> {
        if self.find(path).is_some() {
            debug!(path = %path.display(), "device already watched");
            return None;
        }

        let (device, info) = match self.open(path) {
            Ok(Some(opened)) => opened,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "skipping device");
                return None;
            }
        };

        let stream = match device.into_event_stream() {
            Ok(stream) => stream,
            Err(source) => {
                let e = DeviceError::Stream {
                    path: path.to_owned(),
                    source,
                };
                warn!(error = %e, "skipping device");
                return None;
            }
        };

        info!(
            path = %info.path.display(),
            name = %info.name,
            kind = %info.capabilities,
            "watching device"
        );
        let key = self.insert(info, None);
        let handle = tokio::spawn(reader::read_device(key, stream, self.records_tx.clone()));
        if let Some(entry) = self.entry_mut(key) {
            entry.reader = Some(handle);
        }
        Some(key)
    }

    fn open(&self, path: &Path) -> Result<Option<(Device, DeviceInfo)>, DeviceError> {
        let device = Device::open(path).map_err(|source| DeviceError::Open {
            path: path.to_owned(),
            source,
        })?;

        let name = device.name().unwrap_or("unknown").to_string();
        let bus_type = device.input_id().bus_type().0;
        if !self.filter.admits(&name, bus_type) {
            debug!(path = %path.display(), %name, "device filtered out");
            return Ok(None);
        }

        let capabilities = Capabilities::classify(
            device.supported_keys(),
            device.supported_relative_axes().is_some(),
            self.filter.trigger,
        );
        if capabilities.is_empty() {
            debug!(path = %path.display(), %name, "device neither types nor points");
            return Ok(None);
        }

        if let Err(e) = use_monotonic_clock(&device) {
            warn!(path = %path.display(), error = %e, "cannot switch device to monotonic timestamps");
        }

        let info = DeviceInfo {
            path: path.to_owned(),
            name,
            capabilities,
        };
        Ok(Some((device, info)))
    }

    /// Place a device in a free slot
    ///
    /// The reader handle is aborted when the device is removed.
    pub fn insert(&mut self, info: DeviceInfo, reader: Option<JoinHandle<()>>) -> DeviceKey {
        let slot = match self.slots.iter().position(|slot| slot.entry.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };

        let entry = &mut self.slots[slot];
        entry.entry = Some(DeviceEntry { info, reader });
        DeviceKey::new(slot, entry.generation)
    }

    /// Stop watching a device by key
    ///
    /// Stale or unknown keys are ignored.
    pub fn remove(&mut self, key: DeviceKey) -> Option<DeviceInfo> {
        let slot = self.slots.get_mut(key.slot)?;
        if slot.generation != key.generation {
            return None;
        }

        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);

        // The reader owns the handle; aborting it closes the descriptor
        if let Some(reader) = entry.reader {
            reader.abort();
        }

        info!(
            path = %entry.info.path.display(),
            name = %entry.info.name,
            %key,
            "device removed"
        );
        Some(entry.info)
    }

    /// Stop watching whatever device is open at `path`
    pub fn remove_path(&mut self, path: &Path) -> Option<DeviceKey> {
        let key = self.find(path)?;
        self.remove(key).map(|_| key)
    }

    /// Whether `key` still refers to an open device
    pub fn is_live(&self, key: DeviceKey) -> bool {
        self.entry(key).is_some()
    }

    pub fn info(&self, key: DeviceKey) -> Option<&DeviceInfo> {
        self.entry(key).map(|entry| &entry.info)
    }

    pub fn find(&self, path: &Path) -> Option<DeviceKey> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.entry
                .as_ref()
                .filter(|entry| entry.info.path == path)
                .map(|_| DeviceKey::new(index, slot.generation))
        })
    }

    /// Number of open devices
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, key: DeviceKey) -> Option<&DeviceEntry> {
        self.slots
            .get(key.slot)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn entry_mut(&mut self, key: DeviceKey) -> Option<&mut DeviceEntry> {
        self.slots
            .get_mut(key.slot)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.entry.as_mut())
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Some(reader) = slot.entry.take().and_then(|entry| entry.reader) {
                reader.abort();
            }
        }
    }
}

/// Only `eventN` nodes carry evdev records
pub fn is_event_node(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| name.starts_with("event"))
}

/// Ask the kernel to stamp this device's records with `CLOCK_MONOTONIC`
fn use_monotonic_clock(device: &Device) -> nix::Result<()> {
    let clock: libc::c_int = libc::CLOCK_MONOTONIC;
    // SAFETY: the descriptor is open for the lifetime of `device` and
    // EVIOCSCLOCKID only reads the int behind the pointer.
    unsafe { eviocsclockid(device.as_raw_fd(), &clock) }.map(drop)
}
