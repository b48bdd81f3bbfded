//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device polling and verified control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Tiered polling of one device.
//!
//! Each tier runs on its own timer. Calls inside a cycle are sequential with a
//! fixed gap, and every call takes the device's channel lock, so tiers never
//! interleave requests to the same device.
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use r_bess_common::{DeviceConfig, PollingConfig};
use r_bess_discovery::ScanRequester;
use r_bess_metrics::PollerMetrics;
use r_bess_proto::Method;
use r_bess_transport::{DeviceLink, RequestOptions};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::pause::{PauseGuard, PauseState};
use crate::snapshot::StateSnapshot;
use crate::tier::Tier;

const TARGET: &str = "r_bess::poller";

/// Where a device is reached and which index its scoped methods carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTarget {
    pub addr: SocketAddr,
    pub device_index: u8,
}

impl DeviceTarget {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            device_index: 0,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            addr: config.socket_addr(),
            device_index: config.device_index,
        }
    }

    pub(crate) fn params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("id".into(), json!(self.device_index));
        params
    }
}

/// Result of one fetch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Success,
    Failed { consecutive_failures: u32 },
    /// Stopped early by a pause before any call was judged.
    Interrupted,
    /// The tier has nothing to poll.
    Skipped,
}

struct Inner {
    name: String,
    link: Arc<dyn DeviceLink>,
    config: PollingConfig,
    target: RwLock<DeviceTarget>,
    pause: Arc<PauseState>,
    snapshot: watch::Sender<StateSnapshot>,
    refresh: [Notify; 3],
    scanner: Option<Arc<dyn ScanRequester>>,
    metrics: Option<PollerMetrics>,
}

struct Gathered {
    results: Vec<(Method, Map<String, Value>)>,
    errors: Vec<String>,
    interrupted: bool,
}

impl Inner {
    async fn run_cycle(&self, tier: Tier) -> CycleOutcome {
        let methods = tier.methods(&self.config);
        if methods.is_empty() {
            return CycleOutcome::Skipped;
        }
        let gathered = self.gather(methods).await;
        if gathered.interrupted && gathered.results.is_empty() && gathered.errors.is_empty() {
            debug!(target: TARGET, device = %self.name, tier = %tier, "cycle interrupted by pause");
            return CycleOutcome::Interrupted;
        }
        self.apply(tier, gathered)
    }

    async fn gather(&self, methods: &[Method]) -> Gathered {
        let mut gathered = Gathered {
            results: Vec::with_capacity(methods.len()),
            errors: Vec::new(),
            interrupted: false,
        };
        for (n, method) in methods.iter().enumerate() {
            if n > 0 && !self.config.request_delay.is_zero() {
                sleep(self.config.request_delay).await;
            }
            if self.pause.is_paused() {
                gathered.interrupted = true;
                break;
            }
            let _channel = self.pause.channel().await;
            if self.pause.is_paused() {
                gathered.interrupted = true;
                break;
            }
            let target = *self.target.read();
            let options = RequestOptions::with_timeout(self.config.request_timeout);
            match self
                .link
                .call(target.addr, *method, target.params(), options)
                .await
            {
                Ok(result) => gathered.results.push((*method, result)),
                Err(err) => {
                    debug!(
                        target: TARGET,
                        device = %self.name,
                        method = %method,
                        error = %err,
                        "poll call failed"
                    );
                    gathered.errors.push(format!("{method}: {err}"));
                }
            }
        }
        gathered
    }

    fn apply(&self, tier: Tier, gathered: Gathered) -> CycleOutcome {
        let threshold = self.config.failure_threshold;
        let mut sentinel = false;
        let mut became_stale = false;
        let mut recovered = false;
        let mut failures = 0;

        self.snapshot.send_modify(|snapshot| {
            let mut usable = 0usize;
            for (method, result) in &gathered.results {
                if snapshot.merge(*method, result) {
                    usable += 1;
                } else {
                    sentinel = true;
                    let mode = result.get("mode").cloned().unwrap_or_default();
                    warn!(
                        target: TARGET,
                        device = %self.name,
                        mode = %mode,
                        "device reported an unknown operating mode"
                    );
                }
            }

            if usable > 0 && !sentinel {
                recovered = snapshot.stale;
                snapshot.consecutive_failures = 0;
                snapshot.stale = false;
                snapshot.last_error = None;
                snapshot.updated_at = Some(Utc::now());
            } else {
                snapshot.consecutive_failures = snapshot.consecutive_failures.saturating_add(1);
                snapshot.last_error = Some(if sentinel {
                    "ES.GetMode: unknown mode".to_string()
                } else {
                    gathered.errors.join("; ")
                });
                if snapshot.consecutive_failures >= threshold && !snapshot.stale {
                    snapshot.stale = true;
                    became_stale = true;
                }
            }
            failures = snapshot.consecutive_failures;
        });

        let snapshot = self.snapshot.borrow().clone();
        if let Some(metrics) = &self.metrics {
            metrics.record_cycle(&self.name, tier.as_ref(), failures == 0);
            metrics.set_health(&self.name, snapshot.consecutive_failures, snapshot.stale);
        }

        if failures == 0 {
            if recovered {
                info!(target: TARGET, device = %self.name, "device data is fresh again");
            }
            debug!(target: TARGET, device = %self.name, tier = %tier, "cycle succeeded");
            return CycleOutcome::Success;
        }

        warn!(
            target: TARGET,
            device = %self.name,
            tier = %tier,
            consecutive_failures = failures,
            error = snapshot.last_error.as_deref().unwrap_or_default(),
            "cycle failed"
        );
        if became_stale {
            warn!(target: TARGET, device = %self.name, "device data marked stale");
        }
        if failures >= threshold {
            if let Some(scanner) = &self.scanner {
                let request = scanner.request_scan();
                debug!(target: TARGET, device = %self.name, ?request, "requested rediscovery");
            }
        }
        CycleOutcome::Failed {
            consecutive_failures: failures,
        }
    }
}

/// Builder for one device's polling tasks.
pub struct PollingCoordinator {
    name: String,
    link: Arc<dyn DeviceLink>,
    config: PollingConfig,
    target: DeviceTarget,
    scanner: Option<Arc<dyn ScanRequester>>,
    metrics: Option<PollerMetrics>,
}

impl PollingCoordinator {
    pub fn new(
        name: impl Into<String>,
        link: Arc<dyn DeviceLink>,
        config: PollingConfig,
        target: DeviceTarget,
    ) -> Self {
        Self {
            name: name.into(),
            link,
            config,
            target,
            scanner: None,
            metrics: None,
        }
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn ScanRequester>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_metrics(mut self, metrics: PollerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn into_inner(self) -> Arc<Inner> {
        let (snapshot, _) = watch::channel(StateSnapshot::new(&self.name, self.target.addr));
        Arc::new(Inner {
            name: self.name,
            link: self.link,
            config: self.config,
            target: RwLock::new(self.target),
            pause: Arc::new(PauseState::new()),
            snapshot,
            refresh: [Notify::new(), Notify::new(), Notify::new()],
            scanner: self.scanner,
            metrics: self.metrics,
        })
    }

    /// Handle without background tasks; cycles run only through
    /// [`CoordinatorHandle::fetch_tier`].
    pub fn manual(self) -> CoordinatorHandle {
        let (shutdown, _) = broadcast::channel(16);
        CoordinatorHandle {
            inner: self.into_inner(),
            shutdown,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Start one task per tier that has something to poll.
    pub fn spawn(self) -> CoordinatorHandle {
        let handle = self.manual();
        let mut tasks = Vec::new();
        for tier in Tier::ALL {
            if tier.methods(&handle.inner.config).is_empty() {
                continue;
            }
            tasks.push(tokio::spawn(run_tier(
                handle.inner.clone(),
                tier,
                handle.shutdown.subscribe(),
            )));
        }
        info!(target: TARGET, device = %handle.inner.name, tiers = tasks.len(), "polling started");
        *handle.tasks.lock() = tasks;
        handle
    }
}

async fn run_tier(inner: Arc<Inner>, tier: Tier, mut shutdown: broadcast::Receiver<()>) {
    let interval = tier.interval(&inner.config);
    let mut paused = inner.pause.subscribe();
    let mut next_due = Instant::now();

    loop {
        if *paused.borrow_and_update() > 0 {
            // Freeze the remaining wait and pick it up again on resume.
            let remaining = next_due.saturating_duration_since(Instant::now());
            tokio::select! {
                _ = shutdown.recv() => break,
                resumed = paused.wait_for(|count| *count == 0) => {
                    if resumed.is_err() {
                        break;
                    }
                }
            }
            next_due = Instant::now() + remaining;
            continue;
        }

        tokio::select! {
            _ = shutdown.recv() => break,
            _ = paused.changed() => continue,
            _ = inner.refresh[tier.index()].notified() => {}
            _ = sleep_until(next_due) => {}
        }

        next_due = match inner.run_cycle(tier).await {
            CycleOutcome::Interrupted => Instant::now(),
            _ => Instant::now() + interval,
        };
    }
    debug!(target: TARGET, device = %inner.name, tier = %tier, "tier loop stopped");
}

/// Handle to a device's polling; cheap to clone.
#[derive(Clone)]
pub struct CoordinatorHandle {
    inner: Arc<Inner>,
    shutdown: broadcast::Sender<()>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CoordinatorHandle {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn target(&self) -> DeviceTarget {
        *self.inner.target.read()
    }

    pub fn link(&self) -> Arc<dyn DeviceLink> {
        self.inner.link.clone()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.pause.is_paused()
    }

    /// Suspend every tier until the guard drops. Waits for an in-flight call
    /// to finish; timers resume with the time they had left.
    pub async fn pause(&self) -> PauseGuard {
        self.inner.pause.acquire(&self.inner.name).await
    }

    /// Point polling at a new address, e.g. after the scanner saw the device move.
    pub fn set_target(&self, addr: SocketAddr) {
        let old = {
            let mut target = self.inner.target.write();
            std::mem::replace(&mut target.addr, addr)
        };
        if old == addr {
            return;
        }
        self.inner.snapshot.send_modify(|snapshot| snapshot.target = addr);
        info!(target: TARGET, device = %self.inner.name, old = %old, new = %addr, "polling target updated");
        self.refresh_now(Tier::Fast);
    }

    /// Run a tier's cycle as soon as its task is free; its timer restarts afterwards.
    pub fn refresh_now(&self, tier: Tier) {
        self.inner.refresh[tier.index()].notify_one();
    }

    /// Run one cycle of `tier` on the caller's task.
    pub async fn fetch_tier(&self, tier: Tier) -> CycleOutcome {
        if self.inner.pause.is_paused() {
            return CycleOutcome::Interrupted;
        }
        self.inner.run_cycle(tier).await
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                error!(target: TARGET, device = %self.inner.name, error = %err, "polling task ended abnormally");
            }
        }
        info!(target: TARGET, device = %self.inner.name, "polling stopped");
    }
}
