//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device discovery and address tracking."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Periodic and on-demand rediscovery of known devices.
//!
//! The scanner reports what it sees and never touches configuration. Every scan,
//! periodic or requested, shares one cooldown so a failing device cannot drive a
//! broadcast storm.
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use r_bess_common::{DeviceConfig, ScannerConfig};
use r_bess_metrics::ScannerMetrics;
use r_bess_proto::{normalize_mac, StableId};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::discovery::{DeviceDescriptor, Discovery};

const TARGET: &str = "r_bess::scanner";
const EVENT_CAPACITY: usize = 64;

/// A device the scanner should recognise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownDevice {
    pub name: String,
    pub ip: IpAddr,
    pub ble_mac: Option<String>,
    pub wifi_mac: Option<String>,
}

impl KnownDevice {
    pub fn from_config(name: impl Into<String>, config: &DeviceConfig) -> Self {
        Self {
            name: name.into(),
            ip: config.host,
            ble_mac: config.ble_mac.as_deref().map(normalize_mac),
            wifi_mac: config.wifi_mac.as_deref().map(normalize_mac),
        }
    }

    fn has_mac(&self) -> bool {
        self.ble_mac.is_some() || self.wifi_mac.is_some()
    }

    /// MAC match on either radio; devices configured without a MAC match by address.
    fn matches(&self, device: &DeviceDescriptor) -> bool {
        if !self.has_mac() {
            return self.ip == device.ip;
        }
        let known = [self.ble_mac.as_deref(), self.wifi_mac.as_deref()];
        let seen = [device.ble_mac.as_deref(), device.wifi_mac.as_deref()];
        known
            .iter()
            .flatten()
            .any(|mac| seen.iter().flatten().any(|other| mac == other))
    }
}

/// What caused a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTrigger {
    Periodic,
    OnDemand,
}

impl ScanTrigger {
    pub fn as_label(self) -> &'static str {
        match self {
            ScanTrigger::Periodic => "periodic",
            ScanTrigger::OnDemand => "on_demand",
        }
    }
}

/// Answer to an on-demand scan request. Debounced requests are dropped, never queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRequest {
    Accepted,
    Debounced { retry_after: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScannerEvent {
    /// A known device answered from a different address.
    AddressChanged {
        name: String,
        stable_id: StableId,
        old: IpAddr,
        new: IpAddr,
        descriptor: DeviceDescriptor,
    },
    /// A device answered that matches nothing known.
    UnconfiguredDevice { descriptor: DeviceDescriptor },
}

/// Anything that can be asked for a rediscovery.
pub trait ScanRequester: Send + Sync {
    fn request_scan(&self) -> ScanRequest;
}

#[derive(Default)]
struct Gate {
    scanning: bool,
    last_started: Option<Instant>,
}

struct Shared {
    config: ScannerConfig,
    gate: Mutex<Gate>,
    known: Mutex<Vec<KnownDevice>>,
    unconfigured_seen: Mutex<HashMap<StableId, Instant>>,
    events: broadcast::Sender<ScannerEvent>,
    metrics: Option<ScannerMetrics>,
}

impl Shared {
    /// Reserve the next scan, or report how long the caller must wait.
    fn try_reserve(&self) -> ScanRequest {
        let mut gate = self.gate.lock();
        let now = Instant::now();
        if gate.scanning {
            return ScanRequest::Debounced {
                retry_after: self.config.min_interval,
            };
        }
        if let Some(last) = gate.last_started {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.config.min_interval {
                return ScanRequest::Debounced {
                    retry_after: self.config.min_interval - elapsed,
                };
            }
        }
        gate.scanning = true;
        gate.last_started = Some(now);
        ScanRequest::Accepted
    }

    fn release(&self) {
        self.gate.lock().scanning = false;
    }

    fn debounced(&self, request: ScanRequest) -> ScanRequest {
        if let ScanRequest::Debounced { retry_after } = request {
            debug!(target: TARGET, retry_after_ms = retry_after.as_millis() as u64, "scan request debounced");
            if let Some(metrics) = &self.metrics {
                metrics.record_debounced();
            }
        }
        request
    }

    fn emit(&self, event: ScannerEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Compare one scan's results against the known devices.
    fn reconcile(&self, devices: &[DeviceDescriptor]) {
        let now = Instant::now();
        for device in devices {
            let changed = {
                let mut known = self.known.lock();
                match known.iter_mut().find(|entry| entry.matches(device)) {
                    Some(entry) if entry.ip != device.ip => {
                        let old = entry.ip;
                        entry.ip = device.ip;
                        Some((entry.name.clone(), old))
                    }
                    Some(_) => {
                        self.unconfigured_seen.lock().remove(&device.stable_id);
                        continue;
                    }
                    None => None,
                }
            };

            match changed {
                Some((name, old)) => {
                    info!(
                        target: TARGET,
                        device = %name,
                        id = %device.stable_id,
                        old = %old,
                        new = %device.ip,
                        "device address changed"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_address_change();
                    }
                    self.emit(ScannerEvent::AddressChanged {
                        name,
                        stable_id: device.stable_id.clone(),
                        old,
                        new: device.ip,
                        descriptor: device.clone(),
                    });
                }
                None => self.note_unconfigured(device, now),
            }
        }
    }

    fn note_unconfigured(&self, device: &DeviceDescriptor, now: Instant) {
        let mut seen = self.unconfigured_seen.lock();
        if let Some(last) = seen.get(&device.stable_id) {
            if now.saturating_duration_since(*last) < self.config.unconfigured_debounce {
                return;
            }
        }
        seen.insert(device.stable_id.clone(), now);
        drop(seen);
        info!(target: TARGET, id = %device.stable_id, ip = %device.ip, "unconfigured device found");
        if let Some(metrics) = &self.metrics {
            metrics.record_unconfigured();
        }
        self.emit(ScannerEvent::UnconfiguredDevice {
            descriptor: device.clone(),
        });
    }

    /// Forget debounce state for devices that are now known.
    fn prune_unconfigured(&self) {
        let known = self.known.lock();
        self.unconfigured_seen.lock().retain(|id, _| {
            id.mac().map_or(true, |mac| {
                !known.iter().any(|entry| {
                    entry.ble_mac.as_deref() == Some(mac) || entry.wifi_mac.as_deref() == Some(mac)
                })
            })
        });
    }
}

/// Cheap, cloneable trigger for on-demand scans.
#[derive(Clone)]
pub struct ScanControl {
    shared: Arc<Shared>,
    triggers: mpsc::Sender<ScanTrigger>,
}

impl ScanRequester for ScanControl {
    fn request_scan(&self) -> ScanRequest {
        let request = self.shared.try_reserve();
        if request != ScanRequest::Accepted {
            return self.shared.debounced(request);
        }
        if self.triggers.try_send(ScanTrigger::OnDemand).is_err() {
            // Task is gone; give the reservation back.
            self.shared.release();
            warn!(target: TARGET, "scanner is not running; scan request dropped");
            return ScanRequest::Debounced {
                retry_after: self.shared.config.min_interval,
            };
        }
        debug!(target: TARGET, "on-demand scan accepted");
        ScanRequest::Accepted
    }
}

/// Builder for the background scanner task.
pub struct Scanner {
    discovery: Arc<Discovery>,
    config: ScannerConfig,
    known: Vec<KnownDevice>,
    metrics: Option<ScannerMetrics>,
}

impl Scanner {
    pub fn new(discovery: Arc<Discovery>, config: ScannerConfig) -> Self {
        Self {
            discovery,
            config,
            known: Vec::new(),
            metrics: None,
        }
    }

    pub fn with_known_devices(mut self, known: Vec<KnownDevice>) -> Self {
        self.known = known;
        self
    }

    pub fn with_metrics(mut self, metrics: ScannerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn spawn(self) -> ScannerHandle {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (trigger_tx, trigger_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            config: self.config,
            gate: Mutex::new(Gate::default()),
            known: Mutex::new(self.known),
            unconfigured_seen: Mutex::new(HashMap::new()),
            events,
            metrics: self.metrics,
        });

        let task = tokio::spawn(run_scanner(
            self.discovery,
            shared.clone(),
            trigger_rx,
            shutdown_rx,
        ));

        ScannerHandle {
            control: ScanControl {
                shared,
                triggers: trigger_tx,
            },
            shutdown: shutdown_tx,
            task,
        }
    }
}

async fn run_scanner(
    discovery: Arc<Discovery>,
    shared: Arc<Shared>,
    mut triggers: mpsc::Receiver<ScanTrigger>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let enabled = shared.config.enabled;
    let mut ticker = tokio::time::interval_at(
        Instant::now() + shared.config.interval,
        shared.config.interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(target: TARGET, "scanner shutting down");
                break;
            }
            trigger = triggers.recv() => match trigger {
                Some(trigger) => scan_once(&discovery, &shared, trigger).await,
                None => break,
            },
            _ = ticker.tick(), if enabled => {
                if shared.try_reserve() == ScanRequest::Accepted {
                    scan_once(&discovery, &shared, ScanTrigger::Periodic).await;
                } else {
                    debug!(target: TARGET, "periodic scan skipped inside cooldown");
                }
            }
        }
    }
}

/// Run one reserved scan and release the gate afterwards.
async fn scan_once(discovery: &Discovery, shared: &Shared, trigger: ScanTrigger) {
    info!(target: TARGET, trigger = trigger.as_label(), "scan started");
    if let Some(metrics) = &shared.metrics {
        metrics.record_scan(trigger.as_label());
    }
    match discovery.discover(discovery.config().timeout).await {
        Ok(devices) => shared.reconcile(&devices),
        Err(err) => warn!(target: TARGET, error = %err, "scan failed"),
    }
    shared.release();
}

/// Handle to the running scanner.
pub struct ScannerHandle {
    control: ScanControl,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ScannerHandle {
    /// Ask for a scan now. Requests inside the cooldown are rejected, not queued.
    pub fn request_scan(&self) -> ScanRequest {
        self.control.request_scan()
    }

    /// Cloneable trigger for components that only need to request scans.
    pub fn requester(&self) -> Arc<dyn ScanRequester> {
        Arc::new(self.control.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScannerEvent> {
        self.control.shared.events.subscribe()
    }

    pub fn known_devices(&self) -> Vec<KnownDevice> {
        self.control.shared.known.lock().clone()
    }

    pub fn set_known_devices(&self, devices: Vec<KnownDevice>) {
        *self.control.shared.known.lock() = devices;
        self.control.shared.prune_unconfigured();
    }

    /// Insert or replace a known device by name.
    pub fn upsert_known_device(&self, device: KnownDevice) {
        {
            let mut known = self.control.shared.known.lock();
            match known.iter_mut().find(|entry| entry.name == device.name) {
                Some(entry) => *entry = device,
                None => known.push(device),
            }
        }
        self.control.shared.prune_unconfigured();
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.task.await {
            error!(target: TARGET, error = %err, "scanner task ended abnormally");
        }
    }
}

impl ScanRequester for ScannerHandle {
    fn request_scan(&self) -> ScanRequest {
        ScannerHandle::request_scan(self)
    }
}
