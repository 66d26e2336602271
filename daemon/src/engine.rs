//! The event loop
//!
//! One loop owns all mutable state: the device registry, the tap
//! detector and the injector. It waits on device records, hotplug
//! notices and the tap deadline at once, handles whichever is ready and
//! goes back to waiting. Nothing else touches that state, so there is
//! no locking.

use std::future::Future;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::detector::{Decision, TapDetector};
use crate::devices::{DeviceRegistry, HotplugEvent, ReaderMessage};
use crate::injector::Injector;

/// Ways the loop can stop other than a shutdown request
///
/// The record channel never closes while the loop runs: the registry
/// keeps a sender for spawning readers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("hotplug notification channel closed")]
    HotplugClosed,
}

/// Multiplexes every input source into the tap detector
pub struct Engine<I> {
    registry: DeviceRegistry,
    detector: TapDetector,
    injector: I,
    records: mpsc::Receiver<ReaderMessage>,
    hotplug: mpsc::UnboundedReceiver<HotplugEvent>,
    taps: u64,
}

impl<I: Injector> Engine<I> {
    pub fn new(
        registry: DeviceRegistry,
        detector: TapDetector,
        injector: I,
        records: mpsc::Receiver<ReaderMessage>,
        hotplug: mpsc::UnboundedReceiver<HotplugEvent>,
    ) -> Self {
        Self {
            registry,
            detector,
            injector,
            records,
            hotplug,
            taps: 0,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub fn detector(&self) -> &TapDetector {
        &self.detector
    }

    /// Number of taps injected so far
    pub fn taps(&self) -> u64 {
        self.taps
    }

    /// Run until `shutdown` resolves or a channel dies
    ///
    /// Hotplug notices are applied before device records so the wait set
    /// is current before anything is read from it. Queued records are
    /// drained before a pending shutdown is noticed.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), EngineError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(devices = self.registry.len(), "event loop started");

        loop {
            let deadline = self.detector.deadline();

            tokio::select! {
                biased;

                notice = self.hotplug.recv() => match notice {
                    Some(notice) => self.apply_hotplug(notice),
                    None => return Err(EngineError::HotplugClosed),
                },

                Some(message) = self.records.recv() => self.dispatch(message),

                _ = sleep_until(deadline) => self.detector.window_elapsed(),

                _ = &mut shutdown => {
                    info!(taps = self.taps, "event loop stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Update the device set for one hotplug notice
    pub fn apply_hotplug(&mut self, notice: HotplugEvent) {
        match notice {
            HotplugEvent::Added(path) => {
                if self.registry.add(&path).is_none() {
                    debug!(path = %path.display(), "hotplugged node not watched");
                }
            }
            HotplugEvent::Removed(path) => {
                if let Some(key) = self.registry.remove_path(&path) {
                    self.detector.device_removed(key);
                }
            }
            HotplugEvent::Rescan => {
                for key in self.registry.rescan() {
                    self.detector.device_removed(key);
                }
            }
        }
    }

    /// Handle one message from a reader task
    pub fn dispatch(&mut self, message: ReaderMessage) {
        match message {
            ReaderMessage::Record(event) => {
                if !self.registry.is_live(event.device) {
                    // Queued before its device was removed
                    return;
                }

                match self.detector.handle(&event, Instant::now()) {
                    Decision::Fire { elapsed } => self.fire(elapsed),
                    Decision::Ignore(reason) => debug!(%reason, "trigger release ignored"),
                    Decision::Pass => {}
                }
            }
            ReaderMessage::Failed { device, error } => {
                if let Some(info) = self.registry.info(device) {
                    warn!(path = %info.path.display(), %error, "device read failed, dropping");
                }
                if self.registry.remove(device).is_some() {
                    self.detector.device_removed(device);
                }
            }
        }
    }

    fn fire(&mut self, elapsed: std::time::Duration) {
        match self.injector.fire() {
            Ok(()) => {
                self.taps += 1;
                info!(elapsed_ms = elapsed.as_millis() as u64, "tap injected");
            }
            Err(e) => {
                error!(error = %e, "failed to inject tap");
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use evdev::{Key, RelativeAxisType};
    use tokio::sync::oneshot;

    use crate::detector::State;
    use crate::devices::{Capabilities, DeviceFilter, DeviceInfo, DeviceKey};
    use crate::events::{EventTime, KeyValue, RawEvent};
    use crate::injector::InjectError;

    /// Counts taps instead of writing to uinput
    #[derive(Clone, Default)]
    struct RecordingInjector {
        fired: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Injector for RecordingInjector {
        fn fire(&mut self) -> Result<(), InjectError> {
            if self.fail {
                return Err(InjectError::Write {
                    key: Key::KEY_LEFTCTRL,
                    source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
                });
            }
            self.fired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        engine: Engine<RecordingInjector>,
        fired: Arc<AtomicUsize>,
        records_tx: mpsc::Sender<ReaderMessage>,
        hotplug_tx: mpsc::UnboundedSender<HotplugEvent>,
        keyboard: DeviceKey,
        mouse: DeviceKey,
    }

    fn device(path: &str, keyboard: bool, pointer: bool) -> DeviceInfo {
        DeviceInfo {
            path: PathBuf::from(path),
            name: path.to_string(),
            capabilities: Capabilities { keyboard, pointer },
        }
    }

    fn harness_with(injector: RecordingInjector) -> Harness {
        let (records_tx, records_rx) = mpsc::channel(64);
        let (hotplug_tx, hotplug_rx) = mpsc::unbounded_channel();
        let filter = DeviceFilter {
            trigger: Key::KEY_LEFTMETA,
            ignore_virtual: true,
            ignored_names: Vec::new(),
        };

        let mut registry = DeviceRegistry::new(filter, records_tx.clone());
        let keyboard = registry.insert(device("/dev/input/event0", true, false), None);
        let mouse = registry.insert(device("/dev/input/event1", false, true), None);

        let fired = Arc::clone(&injector.fired);
        let detector = TapDetector::new(Key::KEY_LEFTMETA, Duration::from_millis(150));
        let engine = Engine::new(registry, detector, injector, records_rx, hotplug_rx);

        Harness {
            engine,
            fired,
            records_tx,
            hotplug_tx,
            keyboard,
            mouse,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingInjector::default())
    }

    fn key(device: DeviceKey, key: Key, value: KeyValue, at: f64) -> ReaderMessage {
        ReaderMessage::Record(RawEvent::key(device, key, value, EventTime::from_secs_f64(at)))
    }

    #[tokio::test]
    async fn test_run_fires_on_clean_tap() {
        let mut h = harness();
        h.records_tx.send(key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Press, 0.0)).await.unwrap();
        h.records_tx.send(key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Release, 0.1)).await.unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        stop_tx.send(()).unwrap();
        let result = h.engine.run(async { let _ = stop_rx.await; }).await;

        tokio_test::assert_ok!(result);
        assert_eq!(h.fired.load(Ordering::SeqCst), 1);
        assert_eq!(h.engine.taps(), 1);
    }

    #[tokio::test]
    async fn test_run_scenario_across_devices() {
        let mut h = harness();
        let events = [
            key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Press, 0.0),
            key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Release, 0.10),
            key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Press, 1.0),
            ReaderMessage::Record(RawEvent::motion(
                h.mouse,
                RelativeAxisType::REL_WHEEL,
                -1,
                EventTime::from_secs_f64(1.05),
            )),
            key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Release, 1.08),
            key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Press, 2.0),
            key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Release, 2.30),
        ];
        for event in events {
            h.records_tx.send(event).await.unwrap();
        }

        tokio_test::assert_ok!(h.engine.run(std::future::ready(())).await);
        assert_eq!(h.fired.load(Ordering::SeqCst), 1);
        assert_eq!(h.engine.detector().state(), State::Idle);
    }

    #[tokio::test]
    async fn test_run_stops_when_hotplug_closes() {
        let mut h = harness();
        drop(h.hotplug_tx);

        let result = h.engine.run(std::future::pending()).await;
        assert!(matches!(result, Err(EngineError::HotplugClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_wakes_loop_without_firing() {
        let mut h = harness();
        h.engine.dispatch(key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Press, 0.0));
        assert!(h.engine.detector().deadline().is_some());

        // Paused clock auto-advances past the deadline, then we stop
        let shutdown = tokio::time::sleep(Duration::from_secs(1));
        tokio_test::assert_ok!(h.engine.run(shutdown).await);

        assert!(h.engine.detector().deadline().is_none());
        assert_eq!(h.engine.detector().state(), State::Armed);
        assert_eq!(h.fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_records_from_removed_device_discarded() {
        let mut h = harness();
        let stale = key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Press, 0.0);

        h.engine.apply_hotplug(HotplugEvent::Removed(PathBuf::from("/dev/input/event0")));
        h.engine.dispatch(stale);

        assert_eq!(h.engine.detector().state(), State::Idle);
        assert!(!h.engine.registry().is_live(h.keyboard));
    }

    #[test]
    fn test_hotplug_remove_of_session_device_cancels_press() {
        let mut h = harness();
        h.engine.dispatch(key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Press, 0.0));
        assert_eq!(h.engine.detector().state(), State::Armed);

        h.engine.apply_hotplug(HotplugEvent::Removed(PathBuf::from("/dev/input/event0")));
        assert_eq!(h.engine.detector().state(), State::Idle);

        // Release from another keyboard carrying the same key does nothing
        let other = h.engine.registry.insert(device("/dev/input/event5", true, false), None);
        h.engine.dispatch(key(other, Key::KEY_LEFTMETA, KeyValue::Release, 0.05));
        assert_eq!(h.fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_removing_other_device_keeps_press() {
        let mut h = harness();
        h.engine.dispatch(key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Press, 0.0));
        h.engine.apply_hotplug(HotplugEvent::Removed(PathBuf::from("/dev/input/event1")));
        h.engine.dispatch(key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Release, 0.05));

        assert_eq!(h.fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_read_failure_drops_device() {
        let mut h = harness();
        h.engine.dispatch(key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Press, 0.0));
        h.engine.dispatch(ReaderMessage::Failed {
            device: h.keyboard,
            error: std::io::Error::from_raw_os_error(libc::ENODEV),
        });

        assert!(!h.engine.registry().is_live(h.keyboard));
        assert_eq!(h.engine.detector().state(), State::Idle);

        // A second failure report for the same handle is harmless
        h.engine.dispatch(ReaderMessage::Failed {
            device: h.keyboard,
            error: std::io::Error::from_raw_os_error(libc::ENODEV),
        });
        assert_eq!(h.engine.registry().len(), 1);
    }

    #[test]
    fn test_remove_unknown_path_is_noop() {
        let mut h = harness();
        h.engine.apply_hotplug(HotplugEvent::Removed(PathBuf::from("/dev/input/event42")));
        assert_eq!(h.engine.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_added_device_events_are_observed() {
        let mut h = harness();
        // Stands in for a device opened after a hotplug add
        let added = h.engine.registry.insert(device("/dev/input/event9", true, false), None);
        assert!(h.engine.registry().find(Path::new("/dev/input/event9")).is_some());

        h.engine.dispatch(key(added, Key::KEY_LEFTMETA, KeyValue::Press, 5.0));
        h.engine.dispatch(key(added, Key::KEY_LEFTMETA, KeyValue::Release, 5.05));
        assert_eq!(h.fired.load(Ordering::SeqCst), 1);

        // Adding a path that is already watched changes nothing
        h.engine.apply_hotplug(HotplugEvent::Added(PathBuf::from("/dev/input/event9")));
        assert_eq!(h.engine.registry().len(), 3);
    }

    #[tokio::test]
    async fn test_run_survives_all_readers_gone() {
        let mut h = harness();
        // Only the registry's own sender is left
        drop(h.records_tx);

        let shutdown = async { tokio::task::yield_now().await };
        tokio_test::assert_ok!(h.engine.run(shutdown).await);
    }

    #[test]
    fn test_rescan_before_enumeration_keeps_devices() {
        let mut h = harness();
        h.engine.dispatch(key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Press, 0.0));

        h.engine.apply_hotplug(HotplugEvent::Rescan);
        assert_eq!(h.engine.registry().len(), 2);
        assert_eq!(h.engine.detector().state(), State::Armed);
    }

    #[test]
    fn test_rescan_drops_missed_removal_mid_press() {
        let mut h = harness();
        h.engine.registry.enumerate(Path::new("/nonexistent/input"));
        let pad = h.engine.registry.insert(device("/nonexistent/input/event6", true, false), None);

        h.engine.dispatch(key(pad, Key::KEY_LEFTMETA, KeyValue::Press, 0.0));
        assert_eq!(h.engine.detector().state(), State::Armed);

        // The removal notice was lost in an overflow
        h.engine.apply_hotplug(HotplugEvent::Rescan);
        assert!(!h.engine.registry().is_live(pad));
        assert_eq!(h.engine.detector().state(), State::Idle);
    }

    #[test]
    fn test_injection_failure_is_not_fatal() {
        let injector = RecordingInjector {
            fail: true,
            ..Default::default()
        };
        let mut h = harness_with(injector);

        h.engine.dispatch(key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Press, 0.0));
        h.engine.dispatch(key(h.keyboard, Key::KEY_LEFTMETA, KeyValue::Release, 0.05));

        assert_eq!(h.engine.taps(), 0);
        assert_eq!(h.engine.detector().state(), State::Idle);
    }
}
