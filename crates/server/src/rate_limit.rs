use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Decaying per-client admission counter.
///
/// Every admission bumps the client's count and schedules its own decrement
/// one window later, independently of other admissions. Clients whose count
/// reaches zero are dropped from the map.
#[derive(Clone)]
pub(crate) struct RateLimiter {
    counters: Arc<DashMap<IpAddr, u32>>,
    window: Duration,
    threshold: u32,
}

impl RateLimiter {
    pub(crate) fn new(window: Duration, threshold: u32) -> Self {
        Self {
            counters: Arc::new(DashMap::new()),
            window,
            threshold,
        }
    }

    pub(crate) fn get(&self, client: IpAddr) -> u32 {
        self.counters.get(&client).map(|count| *count).unwrap_or(0)
    }

    /// Admits the client while it holds fewer than `threshold` live
    /// admissions and records the admission.
    ///
    /// Check and increment happen under the client's entry lock so concurrent
    /// requests from one client cannot both slip under the threshold. Must be
    /// called from within a tokio runtime; the decay runs as a task.
    pub(crate) fn admit(&self, client: IpAddr) -> bool {
        {
            let mut count = self.counters.entry(client).or_insert(0);
            if *count >= self.threshold {
                drop(count);
                self.prune(client);
                return false;
            }
            *count += 1;
        }
        self.schedule_release(client);
        true
    }

    fn schedule_release(&self, client: IpAddr) {
        let counters = Arc::clone(&self.counters);
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            release(&counters, client);
        });
    }

    // `admit` may have inserted a zero entry for a threshold of zero.
    fn prune(&self, client: IpAddr) {
        self.counters.remove_if(&client, |_, count| *count == 0);
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        self.counters.len()
    }
}

fn release(counters: &DashMap<IpAddr, u32>, client: IpAddr) {
    if let Entry::Occupied(mut entry) = counters.entry(client) {
        let count = entry.get_mut();
        *count = count.saturating_sub(1);
        if *count == 0 {
            entry.remove();
            tracing::debug!(event = "rate.released", client = %client);
        }
    }
}
