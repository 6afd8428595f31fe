//! Backoff timers for reconnect scheduling.
//!
//! Two strategies: a fixed interval for consumer-busy waits and an
//! exponential ramp for transient failures. The timer is a spawned sleep
//! that raises `EVENT_BACKOFF_EXPIRED`; dropping or resetting the timer
//! aborts the pending task.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;

use crate::events::{EventSet, EVENT_BACKOFF_EXPIRED};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

pub struct BackoffTimer {
    strategy: BackoffStrategy,
    initial: u64,
    max: u64,
    next_interval: u64,
    expected_fire: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

impl BackoffTimer {
    pub fn new(strategy: BackoffStrategy, initial_secs: u64, max_secs: u64) -> BackoffTimer {
        BackoffTimer {
            strategy,
            initial: initial_secs.max(1),
            max: max_secs.max(initial_secs.max(1)),
            next_interval: initial_secs.max(1),
            expected_fire: None,
            timer: None,
        }
    }

    fn schedule(&mut self, interval: u64, events: Arc<EventSet>) {
        self.cancel();
        self.expected_fire = Some(Instant::now() + Duration::from_secs(interval));
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(interval)).await;
            events.notify(EVENT_BACKOFF_EXPIRED);
        }));
    }

    /// Arm the timer for its first interval and return the delay in
    /// seconds. The exponential strategy spreads the first delay over
    /// [initial, 2*initial] so a herd of agreements does not reconnect in
    /// lockstep.
    pub fn reset(&mut self, events: Arc<EventSet>) -> u64 {
        let interval = match self.strategy {
            BackoffStrategy::Fixed => self.initial,
            BackoffStrategy::Exponential => {
                let jitter = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.subsec_nanos() as u64 % (self.initial + 1))
                    .unwrap_or(0);
                (self.initial + jitter).min(self.max)
            }
        };
        self.next_interval = match self.strategy {
            BackoffStrategy::Fixed => self.initial,
            BackoffStrategy::Exponential => (self.initial * 2).min(self.max),
        };
        self.schedule(interval, events);
        interval
    }

    /// Arm the timer for its next interval and return the delay.
    pub fn step(&mut self, events: Arc<EventSet>) -> u64 {
        let interval = self.next_interval;
        if self.strategy == BackoffStrategy::Exponential {
            self.next_interval = (self.next_interval * 2).min(self.max);
        }
        self.schedule(interval, events);
        interval
    }

    /// True when the last scheduled fire time passed more than
    /// `margin_secs` ago, or the timer was never armed. Used to detect a
    /// backoff whose expiry event got lost.
    pub fn expired_for(&self, margin_secs: u64) -> bool {
        match self.expected_fire {
            None => true,
            Some(fire) => match Instant::now().checked_duration_since(fire) {
                Some(elapsed) => elapsed.as_secs() >= margin_secs,
                None => false,
            },
        }
    }

    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for BackoffTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
