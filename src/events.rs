//! Latched event bits with a wakeup.
//!
//! Raising the same event twice before it is consumed collapses to one
//! occurrence; consumption clears the bit. A sleeper that finds events
//! already pending returns immediately, so a notification can never be
//! lost between the check and the wait.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

pub const EVENT_WINDOW_OPENED: u32 = 1;
pub const EVENT_WINDOW_CLOSED: u32 = 2;
pub const EVENT_TRIGGERING_CRITERIA_MET: u32 = 4;
pub const EVENT_BACKOFF_EXPIRED: u32 = 8;
pub const EVENT_REPLICATE_NOW: u32 = 16;
pub const EVENT_PROTOCOL_SHUTDOWN: u32 = 32;
pub const EVENT_AGMT_CHANGED: u32 = 64;
pub const EVENT_RUN_DIRSYNC: u32 = 128;

/// Every event the driver understands.
pub const EVENT_ALPHABET: u32 = EVENT_WINDOW_OPENED
    | EVENT_WINDOW_CLOSED
    | EVENT_TRIGGERING_CRITERIA_MET
    | EVENT_BACKOFF_EXPIRED
    | EVENT_REPLICATE_NOW
    | EVENT_PROTOCOL_SHUTDOWN
    | EVENT_AGMT_CHANGED
    | EVENT_RUN_DIRSYNC;

pub fn event_name(event: u32) -> &'static str {
    match event {
        EVENT_WINDOW_OPENED => "window_opened",
        EVENT_WINDOW_CLOSED => "window_closed",
        EVENT_TRIGGERING_CRITERIA_MET => "data_received",
        EVENT_BACKOFF_EXPIRED => "backoff_timer_expired",
        EVENT_REPLICATE_NOW => "replicate_now",
        EVENT_PROTOCOL_SHUTDOWN => "protocol_shutdown",
        EVENT_AGMT_CHANGED => "agreement_changed",
        EVENT_RUN_DIRSYNC => "run_dirsync",
        _ => "invalid_event",
    }
}

#[derive(Default)]
pub struct EventSet {
    bits: Mutex<u32>,
    wakeup: Notify,
}

impl EventSet {
    pub fn new() -> EventSet {
        EventSet::default()
    }

    /// Raise an event and wake the sleeper.
    pub fn notify(&self, event: u32) {
        debug_assert_eq!(event & !EVENT_ALPHABET, 0);
        *self.bits.lock().expect("event bits lock") |= event;
        self.wakeup.notify_one();
    }

    /// Atomically test-and-clear one event bit.
    pub fn occurred(&self, event: u32) -> bool {
        let mut bits = self.bits.lock().expect("event bits lock");
        let hit = *bits & event != 0;
        *bits &= !event;
        hit
    }

    pub fn any_pending(&self) -> bool {
        *self.bits.lock().expect("event bits lock") != 0
    }

    pub fn reset(&self) {
        *self.bits.lock().expect("event bits lock") = 0;
    }

    /// Sleep until an event is raised or the timeout passes. Returns
    /// immediately if events are already pending.
    pub async fn sleep(&self, duration: Option<Duration>) {
        let notified = self.wakeup.notified();
        if self.any_pending() {
            return;
        }
        match duration {
            Some(d) => {
                let _ = tokio::time::timeout(d, notified).await;
            }
            None => notified.await,
        }
    }
}
