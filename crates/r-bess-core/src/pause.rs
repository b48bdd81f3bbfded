//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device polling and verified control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Scoped suspension of polling.
use std::sync::Arc;

use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::debug;

/// Per-device pause state plus the channel lock every poll call takes.
#[derive(Debug)]
pub(crate) struct PauseState {
    count: watch::Sender<u32>,
    channel: Arc<Mutex<()>>,
}

impl PauseState {
    pub(crate) fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count,
            channel: Arc::new(Mutex::new(())),
        }
    }

    pub(crate) fn is_paused(&self) -> bool {
        *self.count.borrow() > 0
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u32> {
        self.count.subscribe()
    }

    /// Lock held around a single device exchange.
    pub(crate) async fn channel(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.channel.lock().await
    }

    /// Raise the pause count, then wait for the in-flight call to finish.
    ///
    /// The count is raised first so polling stops queueing new calls; the
    /// token undoes it if this future is dropped before the lock is taken.
    pub(crate) async fn acquire(self: &Arc<Self>, device: &str) -> PauseGuard {
        self.count.send_modify(|count| *count += 1);
        let token = PauseToken {
            state: self.clone(),
        };
        let channel = self.channel.clone().lock_owned().await;
        debug!(target: "r_bess::poller", device, "polling paused");
        PauseGuard {
            _channel: channel,
            _token: token,
            device: device.to_string(),
        }
    }
}

#[derive(Debug)]
struct PauseToken {
    state: Arc<PauseState>,
}

impl Drop for PauseToken {
    fn drop(&mut self) {
        self.state
            .count
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Polling stays suspended while this guard is alive, whatever happens to the
/// command that took it.
#[derive(Debug)]
#[must_use = "polling resumes as soon as the guard is dropped"]
pub struct PauseGuard {
    _channel: OwnedMutexGuard<()>,
    _token: PauseToken,
    device: String,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        debug!(target: "r_bess::poller", device = %self.device, "polling resumed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn guard_releases_on_drop() {
        let state = Arc::new(PauseState::new());
        let first = state.acquire("garage").await;
        assert!(state.is_paused());
        drop(first);
        assert!(!state.is_paused());
    }

    #[tokio::test]
    async fn abandoned_pause_does_not_leak() {
        let state = Arc::new(PauseState::new());
        let held = state.channel().await;
        let attempt = tokio::time::timeout(Duration::from_millis(20), state.acquire("garage")).await;
        assert!(attempt.is_err());
        drop(held);
        assert!(!state.is_paused());
    }

    #[tokio::test]
    async fn second_pause_waits_for_first() {
        let state = Arc::new(PauseState::new());
        let first = state.acquire("garage").await;
        let waiting = tokio::time::timeout(Duration::from_millis(20), state.acquire("garage")).await;
        assert!(waiting.is_err());
        assert!(state.is_paused());
        drop(first);
        let _second = state.acquire("garage").await;
        assert!(state.is_paused());
    }
}
