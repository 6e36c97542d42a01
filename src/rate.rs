//! Outbound rate limiting.
//!
//! A token-bucket pacer sits on the send path of every connection. The
//! byte budget is refilled continuously from a monotonic clock; when a
//! write would overdraw the budget the pacer sleeps just long enough for
//! the debt to drain. A speed of `0` disables pacing entirely.
//!
//! The speed cell is shared with the connection so an inbound
//! `DownloadSpeedAction` takes effect on the very next write.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// Largest single write the scheduler will issue regardless of pacing.
pub(crate) const MAX_WRITE_CHUNK: usize = 1 << 24;

/// Token-bucket write pacer.
pub(crate) struct Pacer {
    speed: Arc<AtomicU32>,
    start: Instant,
    debt: f64,
}

impl Pacer {
    pub fn new(speed: Arc<AtomicU32>) -> Self {
        Self {
            speed,
            start: Instant::now(),
            debt: 0.0,
        }
    }

    /// Current bytes-per-second ceiling; `0` means unlimited.
    pub fn speed(&self) -> u32 {
        self.speed.load(Ordering::Relaxed)
    }

    /// Largest chunk a single paced write should use.
    pub fn max_chunk(&self) -> usize {
        match self.speed() {
            0 => MAX_WRITE_CHUNK,
            speed => MAX_WRITE_CHUNK.min(speed as usize),
        }
    }

    /// Account for `len` outbound bytes, sleeping if the budget is spent.
    pub async fn throttle(&mut self, len: usize) {
        let speed = self.speed() as f64;
        if speed == 0.0 || len == 0 {
            return;
        }
        let now = Instant::now();
        if self.debt == 0.0 {
            self.start = now;
            self.debt = len as f64;
            return;
        }
        let elapsed = now.duration_since(self.start).as_secs_f64() + 0.01;
        self.start = now;
        self.debt = (len as f64 + self.debt - speed * elapsed).max(0.0);
        if self.debt > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(self.debt / speed)).await;
        }
    }
}
