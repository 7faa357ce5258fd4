//! Cool-down between external API calls.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Pause after every market-data call.
pub const DEFAULT_COOL_DOWN: Duration = Duration::from_millis(1100);

/// The API allows one call per second; cool-downs must exceed this.
pub const MIN_COOL_DOWN: Duration = Duration::from_secs(1);

/// Blocks the caller for a duration.
pub trait Pacer: Send + Sync {
    fn pause(&self, duration: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Records requested pauses without sleeping.
#[derive(Debug, Default)]
pub struct RecordingPacer {
    pauses: Mutex<Vec<Duration>>,
}

impl RecordingPacer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pauses(&self) -> Vec<Duration> {
        self.pauses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Pacer for RecordingPacer {
    fn pause(&self, duration: Duration) {
        self.pauses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
    }
}

impl<P: Pacer + ?Sized> Pacer for Arc<P> {
    fn pause(&self, duration: Duration) {
        (**self).pause(duration)
    }
}

impl<P: Pacer + ?Sized> Pacer for &P {
    fn pause(&self, duration: Duration) {
        (**self).pause(duration)
    }
}
