//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device discovery and address tracking."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use r_bess_common::DiscoveryConfig;
use r_bess_proto::{normalize_mac, select_stable_id, DeviceInfo, Method, StableId};
use r_bess_transport::{DeviceLink, Reply, RequestOptions};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{DiscoveryError, Result};

const TARGET: &str = "r_bess::discovery";

/// Facts learned about a device when it answered discovery.
///
/// Identity is [`DeviceDescriptor::stable_id`]; the address may change between scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub stable_id: StableId,
    pub ip: IpAddr,
    pub port: u16,
    pub device_type: Option<String>,
    pub version: Option<i64>,
    pub ble_mac: Option<String>,
    pub wifi_mac: Option<String>,
    pub wifi_name: Option<String>,
    /// Self identification from the reply envelope.
    pub src: Option<String>,
}

impl DeviceDescriptor {
    /// Build from a `Marstek.GetDevice` result; `None` for results that identify nothing.
    ///
    /// The reported `ip` wins when it parses; otherwise the sender address is used.
    pub fn from_result(
        result: &Map<String, Value>,
        from: SocketAddr,
        src: Option<String>,
    ) -> Option<Self> {
        let info = DeviceInfo::from_result(result)?;
        let ip = info
            .ip
            .as_deref()
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .filter(|ip| !ip.is_unspecified())
            .unwrap_or(from.ip());
        let ble_mac = info.ble_mac.as_deref().map(normalize_mac);
        let wifi_mac = info.wifi_mac.as_deref().map(normalize_mac);
        Some(Self {
            stable_id: select_stable_id(ble_mac.as_deref(), wifi_mac.as_deref(), ip),
            ip,
            port: from.port(),
            device_type: info.device,
            version: info.version,
            ble_mac,
            wifi_mac,
            wifi_name: info.wifi_name,
            src,
        })
    }

    fn from_reply(reply: &Reply) -> Option<Self> {
        let result = reply.response.result()?;
        Self::from_result(result, reply.from, reply.response.src.clone())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

struct CachedScan {
    taken_at: Instant,
    devices: Vec<DeviceDescriptor>,
}

/// Broadcast and directed discovery over a [`DeviceLink`].
pub struct Discovery {
    link: Arc<dyn DeviceLink>,
    config: DiscoveryConfig,
    cache: Mutex<Option<CachedScan>>,
}

fn discovery_params() -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("ble_mac".into(), json!("0"));
    params
}

impl Discovery {
    pub fn new(link: Arc<dyn DeviceLink>, config: DiscoveryConfig) -> Self {
        Self {
            link,
            config,
            cache: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Broadcast for devices and collect descriptors for `timeout`.
    ///
    /// When probing is enabled a short first broadcast absorbs the garbage some
    /// firmware sends in reaction to the first datagram it sees; any valid
    /// answers it does yield are kept. Replies that identify nothing are dropped.
    pub async fn discover(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>> {
        let mut found: IndexMap<StableId, DeviceDescriptor> = IndexMap::new();

        if self.config.probe {
            match self
                .link
                .broadcast(Method::GetDevice, discovery_params(), self.config.probe_window)
                .await
            {
                Ok(replies) => merge(&mut found, &replies),
                Err(err) => {
                    debug!(target: TARGET, error = %err, "discovery probe failed; continuing")
                }
            }
        }

        let replies = self
            .link
            .broadcast(Method::GetDevice, discovery_params(), timeout)
            .await?;
        merge(&mut found, &replies);

        let devices: Vec<DeviceDescriptor> = found.into_values().collect();
        info!(target: TARGET, count = devices.len(), "discovery completed");
        for device in &devices {
            debug!(
                target: TARGET,
                id = %device.stable_id,
                ip = %device.ip,
                device_type = device.device_type.as_deref().unwrap_or("unknown"),
                "found device"
            );
        }
        *self.cache.lock() = Some(CachedScan {
            taken_at: Instant::now(),
            devices: devices.clone(),
        });
        Ok(devices)
    }

    /// Like [`Discovery::discover`], but reuses a result younger than the cache TTL.
    pub async fn discover_cached(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>> {
        if let Some(devices) = self.cached() {
            debug!(target: TARGET, count = devices.len(), "using cached discovery result");
            return Ok(devices);
        }
        self.discover(timeout).await
    }

    fn cached(&self) -> Option<Vec<DeviceDescriptor>> {
        let cache = self.cache.lock();
        cache
            .as_ref()
            .filter(|scan| scan.taken_at.elapsed() < self.config.cache_ttl)
            .map(|scan| scan.devices.clone())
    }

    pub fn clear_cache(&self) {
        *self.cache.lock() = None;
    }

    /// Directed discovery of a device at a known address.
    pub async fn query_one(&self, target: SocketAddr, timeout: Duration) -> Result<DeviceDescriptor> {
        let result = self
            .link
            .call(
                target,
                Method::GetDevice,
                discovery_params(),
                RequestOptions::with_timeout(timeout),
            )
            .await?;
        DeviceDescriptor::from_result(&result, target, None)
            .ok_or(DiscoveryError::NotADevice(target))
    }
}

fn merge(found: &mut IndexMap<StableId, DeviceDescriptor>, replies: &[Reply]) {
    for reply in replies {
        match DeviceDescriptor::from_reply(reply) {
            Some(device) => {
                found.entry(device.stable_id.clone()).or_insert(device);
            }
            None => debug!(target: TARGET, from = %reply.from, "dropping reply without device identity"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use r_bess_proto::{Outcome, Response};
    use r_bess_transport::TransportError;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted link: each broadcast pops the next batch of replies.
    #[derive(Default)]
    pub(crate) struct ScriptedLink {
        pub(crate) batches: Mutex<VecDeque<Vec<Reply>>>,
        pub(crate) broadcasts: AtomicUsize,
        pub(crate) directed: Mutex<Option<Map<String, Value>>>,
    }

    impl ScriptedLink {
        pub(crate) fn with_batches(batches: Vec<Vec<Reply>>) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(batches.into()),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl DeviceLink for ScriptedLink {
        async fn call(
            &self,
            target: SocketAddr,
            method: Method,
            _params: Map<String, Value>,
            _options: RequestOptions,
        ) -> r_bess_transport::Result<Map<String, Value>> {
            self.directed.lock().clone().ok_or(TransportError::Timeout {
                method: method.to_string(),
                target,
                attempts: 3,
            })
        }

        async fn broadcast(
            &self,
            _method: Method,
            _params: Map<String, Value>,
            _window: Duration,
        ) -> r_bess_transport::Result<Vec<Reply>> {
            self.broadcasts.fetch_add(1, Ordering::SeqCst);
            Ok(self.batches.lock().pop_front().unwrap_or_default())
        }
    }

    pub(crate) fn reply(from: &str, result: Value) -> Reply {
        let from: SocketAddr = from.parse().unwrap();
        let result = result.as_object().cloned().unwrap();
        Reply {
            from,
            stable_id: select_stable_id(
                result.get("ble_mac").and_then(Value::as_str),
                result.get("wifi_mac").and_then(Value::as_str),
                from.ip(),
            ),
            response: Response {
                id: 0,
                src: None,
                outcome: Outcome::Result(result),
            },
        }
    }

    fn config(probe: bool) -> DiscoveryConfig {
        DiscoveryConfig {
            probe,
            ..DiscoveryConfig::default()
        }
    }

    #[tokio::test]
    async fn probe_answers_are_merged_and_deduplicated() {
        let venus = json!({"device": "VenusE", "ble_mac": "acd929a74a38", "ip": "10.0.0.5"});
        let link = ScriptedLink::with_batches(vec![
            vec![reply("10.0.0.5:30000", venus.clone())],
            vec![
                reply("10.0.0.5:30000", venus),
                reply("10.0.0.6:30000", json!({"device": "VenusC", "wifi_mac": "112233445566"})),
            ],
        ]);
        let discovery = Discovery::new(link.clone(), config(true));
        let devices = discovery.discover(Duration::from_secs(1)).await.unwrap();
        assert_eq!(link.broadcasts.load(Ordering::SeqCst), 2);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].ble_mac.as_deref(), Some("ac:d9:29:a7:4a:38"));
        assert_eq!(devices[1].ip, "10.0.0.6".parse::<IpAddr>().unwrap());
        assert!(matches!(devices[1].stable_id, StableId::WifiMac(_)));
    }

    #[tokio::test]
    async fn replies_without_identity_are_dropped() {
        let link = ScriptedLink::with_batches(vec![vec![
            reply("10.0.0.9:30000", json!({"ver": 3})),
            reply("10.0.0.5:30000", json!({"device": "VenusE"})),
        ]]);
        let discovery = Discovery::new(link, config(false));
        let devices = discovery.discover(Duration::from_secs(1)).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].stable_id, StableId::Address("10.0.0.5".parse().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn cache_is_reused_until_ttl() {
        let link = ScriptedLink::with_batches(vec![
            vec![reply("10.0.0.5:30000", json!({"device": "VenusE"}))],
            vec![],
        ]);
        let discovery = Discovery::new(link.clone(), config(false));
        assert_eq!(discovery.discover_cached(Duration::from_secs(1)).await.unwrap().len(), 1);
        assert_eq!(discovery.discover_cached(Duration::from_secs(1)).await.unwrap().len(), 1);
        assert_eq!(link.broadcasts.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(discovery.discover_cached(Duration::from_secs(1)).await.unwrap().is_empty());
        assert_eq!(link.broadcasts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn query_one_falls_back_to_sender_address() {
        let link = ScriptedLink::with_batches(Vec::new());
        *link.directed.lock() = Some(
            json!({"device": "VenusE", "ble_mac": "acd929a74a38"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let discovery = Discovery::new(link.clone(), config(false));
        let target: SocketAddr = "192.168.1.40:30000".parse().unwrap();
        let device = discovery.query_one(target, Duration::from_secs(1)).await.unwrap();
        assert_eq!(device.ip, target.ip());

        *link.directed.lock() = Some(json!({"ver": 1}).as_object().cloned().unwrap());
        assert!(matches!(
            discovery.query_one(target, Duration::from_secs(1)).await,
            Err(DiscoveryError::NotADevice(_))
        ));
    }
}
