//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "UDP device transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep_until, Instant};

/// Minimum spacing between requests to the same destination address.
///
/// Each caller reserves the next free send slot under the lock and then sleeps
/// outside it, so concurrent callers to one address queue up in order while
/// other addresses are unaffected.
#[derive(Debug)]
pub struct DestinationPacer {
    min_interval: Duration,
    idle_ttl: Duration,
    slots: Mutex<HashMap<IpAddr, Instant>>,
}

impl DestinationPacer {
    pub fn new(min_interval: Duration, idle_ttl: Duration) -> Self {
        Self {
            min_interval,
            idle_ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until a request to `destination` may be sent.
    pub async fn wait_turn(&self, destination: IpAddr) {
        let slot = self.reserve(destination, Instant::now());
        sleep_until(slot).await;
    }

    fn reserve(&self, destination: IpAddr, now: Instant) -> Instant {
        let mut slots = self.slots.lock();
        let idle_ttl = self.idle_ttl;
        slots.retain(|_, last| now.saturating_duration_since(*last) < idle_ttl);
        let slot = match slots.get(&destination) {
            Some(last) => (*last + self.min_interval).max(now),
            None => now,
        };
        slots.insert(destination, slot);
        slot
    }

    /// Number of destinations currently tracked.
    pub fn tracked(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6));

    #[tokio::test(start_paused = true)]
    async fn same_destination_is_spaced() {
        let pacer = DestinationPacer::new(Duration::from_millis(300), Duration::from_secs(300));
        let start = Instant::now();
        pacer.wait_turn(A).await;
        pacer.wait_turn(A).await;
        pacer.wait_turn(A).await;
        assert!(start.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn different_destinations_do_not_wait() {
        let pacer = DestinationPacer::new(Duration::from_millis(300), Duration::from_secs(300));
        let start = Instant::now();
        pacer.wait_turn(A).await;
        pacer.wait_turn(B).await;
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_destinations_are_forgotten() {
        let pacer = DestinationPacer::new(Duration::from_millis(300), Duration::from_secs(1));
        pacer.wait_turn(A).await;
        assert_eq!(pacer.tracked(), 1);
        tokio::time::advance(Duration::from_secs(2)).await;
        pacer.wait_turn(B).await;
        assert_eq!(pacer.tracked(), 1);
    }
}
