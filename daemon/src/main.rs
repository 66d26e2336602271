//! super-tap-daemon: turns a lone tap of a modifier key into another key
//!
//! Runs as a system service and provides:
//! - Watching of every keyboard and pointer under /dev/input, with hotplug
//! - Tap detection for one trigger key (default: left Super)
//! - Injection of a configured key through a uinput virtual keyboard
//!
//! Holding the trigger together with any other key, click, scroll or
//! pointer motion is left alone, so the trigger still works as a
//! modifier.

mod config;
mod detector;
mod devices;
mod engine;
mod events;
mod injector;
mod lifecycle;

use std::path::Path;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::detector::TapDetector;
use crate::devices::{DeviceFilter, DeviceRegistry, HotplugWatcher, INPUT_DIR};
use crate::engine::Engine;
use crate::injector::UinputInjector;
use crate::lifecycle::ShutdownSignal;

/// Records buffered between reader tasks and the event loop
const RECORD_CHANNEL_CAPACITY: usize = 256;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .with_writer(std::io::stderr)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "super-tap-daemon starting"
    );

    // Load configuration
    let config = Config::load();
    info!(
        source = ?config.source,
        trigger = ?config.trigger_key,
        injection = ?config.injection_key,
        tap_timeout_ms = config.tap_timeout.as_millis() as u64,
        "configuration loaded"
    );

    let mut shutdown = ShutdownSignal::new()
        .context("failed to register signal handlers")?;

    // Without an injection path there is nothing useful to do
    let injector = UinputInjector::new(config.injection_key)
        .context("failed to create virtual injection device")?;

    let input_dir = Path::new(INPUT_DIR);
    let (_hotplug, hotplug_rx) = HotplugWatcher::start(input_dir, config.hotplug_settle)
        .context("failed to open hotplug notification channel")?;

    // Reader tasks -> event loop
    let (records_tx, records_rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);

    let mut registry = DeviceRegistry::new(DeviceFilter::from_config(&config), records_tx);
    registry.enumerate(input_dir);
    if registry.is_empty() {
        warn!("no input devices found, waiting for devices to be connected");
    }

    let detector = TapDetector::new(config.trigger_key, config.tap_timeout);
    info!(
        trigger = ?detector.trigger(),
        timeout_ms = detector.timeout().as_millis() as u64,
        "listening for taps"
    );

    let mut engine = Engine::new(registry, detector, injector, records_rx, hotplug_rx);
    engine
        .run(shutdown.wait())
        .await
        .context("event loop failed")?;

    info!(taps = engine.taps(), "super-tap-daemon stopped");

    Ok(())
}
