//! Per-device reader tasks
//!
//! Each task owns one device's event stream and forwards its records,
//! in the order the kernel produced them, into the shared channel the
//! event loop waits on.

use evdev::EventStream;
use tokio::sync::mpsc;
use tracing::debug;

use super::registry::DeviceKey;
use crate::events::RawEvent;

/// What a reader task reports to the event loop
#[derive(Debug)]
pub enum ReaderMessage {
    /// A key or motion record
    Record(RawEvent),
    /// Reading failed; the device is gone or unusable
    Failed {
        device: DeviceKey,
        error: std::io::Error,
    },
}

/// Forward records from `stream` until it fails or the loop hangs up
pub async fn read_device(key: DeviceKey, mut stream: EventStream, tx: mpsc::Sender<ReaderMessage>) {
    loop {
        match stream.next_event().await {
            Ok(event) => {
                let Some(record) = RawEvent::from_evdev(key, &event) else {
                    continue;
                };
                if tx.send(ReaderMessage::Record(record)).await.is_err() {
                    debug!(%key, "event loop gone, reader exiting");
                    break;
                }
            }
            Err(error) => {
                let _ = tx.send(ReaderMessage::Failed { device: key, error }).await;
                break;
            }
        }
    }
}
