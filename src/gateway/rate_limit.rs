// =============================================================================
// Request Pacer - keeps Kite Connect endpoints under their per-second caps
// =============================================================================
//
// Kite enforces per-endpoint request rates (historical data: 3/s, quotes:
// 1/s, orders: 10/s). Exceeding them returns HTTP 429. Each pacer hands out
// evenly spaced request slots; callers await their slot before sending.
//
// Slots are reserved under a short lock and the sleep happens outside it, so
// concurrent scan workers queue up without holding the lock while waiting.
// =============================================================================

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Evenly spaced request slots for one endpoint class.
pub struct RequestPacer {
    name: &'static str,
    min_gap: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    /// A pacer that allows at most `per_second` requests per second.
    pub fn per_second(name: &'static str, per_second: u32) -> Self {
        let per_second = per_second.max(1);
        Self {
            name,
            min_gap: Duration::from_secs(1) / per_second,
            next_slot: Mutex::new(None),
        }
    }

    /// Wait until this caller's slot comes up.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(t) if t > now => t,
                _ => now,
            };
            *next = Some(slot + self.min_gap);
            slot
        };

        if slot > Instant::now() {
            debug!(pacer = self.name, wait_ms = (slot - Instant::now()).as_millis() as u64, "request paced");
            sleep_until(slot).await;
        }
    }
}

impl std::fmt::Debug for RequestPacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPacer")
            .field("name", &self.name)
            .field("min_gap", &self.min_gap)
            .finish()
    }
}
