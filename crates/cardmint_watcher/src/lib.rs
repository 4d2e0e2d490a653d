//! Capture ingestion watcher.
//!
//! Bridges the camera drop directory and the kiosk HTTP callback into the
//! job queue. Polling-based change detection: inotify-style watchers fail on
//! the network shares kiosks mount, and a flat drop directory makes polling
//! cheap. The detection path never awaits downstream work.

pub mod events;
pub mod kiosk;
pub mod watcher;

pub use events::{CaptureEvent, WatcherEvent};
pub use kiosk::{kiosk_router, KioskState};
pub use watcher::{CaptureSink, Watcher, WatcherConfig};
