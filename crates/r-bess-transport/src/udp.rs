//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "UDP device transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use r_bess_common::TransportConfig;
use r_bess_metrics::TransportMetrics;
use r_bess_proto::{
    parse_response, select_stable_id, Codec, DeviceInfo, Inbound, Method, Outcome, Request,
    Response, DISCOVERY_REQUEST_ID, MAX_MESSAGE_SIZE,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{Map, Value};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::broadcast::broadcast_targets;
use crate::pacing::DestinationPacer;
use crate::pending::{Delivery, PendingRegistry};
use crate::retry::RetryPolicy;
use crate::stats::{AttemptOutcome, CommandStats, StatsBook};
use crate::{DeviceLink, Reply, RequestOptions, Result, TransportError};

const TARGET: &str = "r_bess::transport";

/// Shared UDP client. Cloning is cheap; all clones use the same socket.
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    codec: Codec,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    pending: Arc<PendingRegistry>,
    pacer: DestinationPacer,
    stats: StatsBook,
    metrics: Option<TransportMetrics>,
    broadcast_turn: tokio::sync::Mutex<()>,
    rng: Mutex<StdRng>,
    shutdown: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind the socket and start the receive loop.
    pub async fn bind(
        config: TransportConfig,
        codec: Codec,
        metrics: Option<TransportMetrics>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_socket()).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let pending = Arc::new(PendingRegistry::default());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let listener = tokio::spawn(listen(
            Arc::clone(&socket),
            Arc::clone(&pending),
            metrics.clone(),
            shutdown_rx,
        ));

        info!(
            target: TARGET,
            local = %local_addr,
            strict = codec.config().strict,
            "udp transport bound"
        );

        let pacer = DestinationPacer::new(config.min_request_interval, config.destination_idle_ttl);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                codec,
                socket,
                local_addr,
                pending,
                pacer,
                stats: StatsBook::default(),
                metrics,
                broadcast_turn: tokio::sync::Mutex::new(()),
                rng: Mutex::new(StdRng::from_entropy()),
                shutdown,
                listener: Mutex::new(Some(listener)),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn codec(&self) -> &Codec {
        &self.inner.codec
    }

    /// Device address on the configured device port.
    pub fn device_target(&self, ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.inner.config.device_port)
    }

    /// Requests currently waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Per-method counters across all destinations.
    pub fn command_stats(&self) -> HashMap<String, CommandStats> {
        self.inner.stats.snapshot()
    }

    /// Per-method counters for one destination.
    pub fn command_stats_for(&self, ip: IpAddr) -> HashMap<String, CommandStats> {
        self.inner.stats.snapshot_for(ip)
    }

    fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    fn free_id(&self) -> u32 {
        loop {
            let id = self.inner.codec.next_id();
            if !self.inner.pending.contains(id) {
                return id;
            }
        }
    }

    /// One attempt: send `request` and wait for the reply carrying its id.
    ///
    /// The pending entry is released when this returns or when the future is
    /// dropped, so a late reply is never attributed to another request.
    pub async fn send_request(
        &self,
        target: SocketAddr,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response> {
        if self.is_shut_down() {
            return Err(TransportError::Closed);
        }
        let (_guard, reply) = self.inner.pending.register_single(request.id())?;
        self.inner.socket.send_to(request.as_bytes(), target).await?;
        trace!(target: TARGET, device = %target, id = request.id(), method = %request.method(), "request sent");

        let delivery = match time::timeout(timeout, reply).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                return Err(TransportError::Timeout {
                    method: request.method().to_string(),
                    target,
                    attempts: 1,
                })
            }
        };
        let response = delivery.payload?;
        match response.outcome {
            Outcome::Error(error) => Err(TransportError::Device {
                method: request.method().to_string(),
                error,
            }),
            Outcome::Result(_) => Ok(response),
        }
    }

    /// Validate, pace, send, and retry on timeout with exponential backoff.
    ///
    /// Writes get the larger write budget unless `options` overrides it.
    /// Validation, parse, and device errors are returned at once.
    pub async fn request(
        &self,
        target: SocketAddr,
        method: Method,
        params: Map<String, Value>,
        options: RequestOptions,
    ) -> Result<Response> {
        let config = &self.inner.config;
        let retries = options.retries.unwrap_or(if method.is_write() {
            config.write_retries
        } else {
            config.read_retries
        });
        let timeout = options.timeout.unwrap_or(config.request_timeout);
        let policy = RetryPolicy::new(retries, config.retry_base_delay, config.retry_jitter);

        let mut request = self
            .inner
            .codec
            .build_with_id(self.free_id(), method.as_str(), params)?;
        let mut last_error = None;

        for attempt in 1..=policy.attempts() {
            if attempt > 1 {
                request = request.reissue(self.free_id())?;
            }
            self.inner.pacer.wait_turn(target.ip()).await;
            let started = Instant::now();
            let outcome = self.send_request(target, &request, timeout).await;
            let elapsed = started.elapsed();

            match outcome {
                Ok(response) => {
                    self.record(method, target, AttemptOutcome::Success, elapsed, None);
                    if attempt > 1 {
                        info!(target: TARGET, device = %target, method = %method, attempt, "request succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(err) if err.is_retryable() => {
                    let kind = if err.is_timeout() {
                        AttemptOutcome::Timeout
                    } else {
                        AttemptOutcome::Failure
                    };
                    self.record(method, target, kind, elapsed, Some(&err.to_string()));
                    if attempt < policy.attempts() {
                        let delay = {
                            let mut rng = self.inner.rng.lock();
                            policy.backoff_delay(attempt, &mut *rng)
                        };
                        debug!(
                            target: TARGET,
                            device = %target,
                            method = %method,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "request attempt failed; backing off"
                        );
                        time::sleep(delay).await;
                    }
                    last_error = Some(err);
                }
                Err(err) => {
                    self.record(method, target, AttemptOutcome::Failure, elapsed, Some(&err.to_string()));
                    warn!(target: TARGET, device = %target, method = %method, error = %err, "request failed");
                    return Err(err);
                }
            }
        }

        warn!(
            target: TARGET,
            device = %target,
            method = %method,
            attempts = policy.attempts(),
            "request exhausted retry budget"
        );
        match last_error {
            Some(TransportError::Timeout { .. }) | None => Err(TransportError::Timeout {
                method: method.to_string(),
                target,
                attempts: policy.attempts(),
            }),
            Some(err) => Err(err),
        }
    }

    /// Send `request` to every broadcast target and collect replies for `window`.
    ///
    /// Replies that name no device are dropped; the rest are deduplicated by
    /// the responder's stable identifier. Echoes and noise never reach this
    /// collector. Broadcasts are not paced but run
    /// one at a time, since they share the discovery id.
    pub async fn send_broadcast(&self, request: &Request, window: Duration) -> Result<Vec<Reply>> {
        if self.is_shut_down() {
            return Err(TransportError::Closed);
        }
        let _turn = self.inner.broadcast_turn.lock().await;
        let (_guard, mut inbox) = self.inner.pending.register_collect(request.id())?;

        let targets = broadcast_targets(
            &self.inner.config.broadcast_addresses,
            self.inner.config.device_port,
        );
        let mut sent = 0usize;
        let mut last_io = None;
        for target in &targets {
            match self.inner.socket.send_to(request.as_bytes(), *target).await {
                Ok(_) => sent += 1,
                Err(err) => {
                    debug!(target: TARGET, broadcast = %target, error = %err, "broadcast send failed");
                    last_io = Some(err);
                }
            }
        }
        if sent == 0 {
            return Err(last_io.map_or(TransportError::Closed, TransportError::Io));
        }
        debug!(
            target: TARGET,
            method = %request.method(),
            targets = sent,
            window_ms = window.as_millis() as u64,
            "broadcast sent"
        );

        let deadline = Instant::now() + window;
        let mut seen = HashSet::new();
        let mut replies = Vec::new();
        loop {
            let delivery = match time::timeout_at(deadline, inbox.recv()).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) | Err(_) => break,
            };
            let response = match delivery.payload {
                Ok(response) => response,
                Err(err) => {
                    debug!(target: TARGET, from = %delivery.from, error = %err, "discarding malformed broadcast reply");
                    continue;
                }
            };
            let Some(result) = response.result() else {
                debug!(target: TARGET, from = %delivery.from, "discarding broadcast error reply");
                continue;
            };
            if DeviceInfo::from_result(result).is_none() {
                debug!(target: TARGET, from = %delivery.from, "discarding broadcast reply without device identity");
                continue;
            }
            let stable_id = select_stable_id(
                result.get("ble_mac").and_then(Value::as_str),
                result.get("wifi_mac").and_then(Value::as_str),
                delivery.from.ip(),
            );
            if seen.insert(stable_id.clone()) {
                replies.push(Reply {
                    from: delivery.from,
                    stable_id,
                    response,
                });
            } else {
                trace!(target: TARGET, from = %delivery.from, %stable_id, "duplicate broadcast reply");
            }
        }
        Ok(replies)
    }

    /// Stop the receive loop and fail every waiting request with [`TransportError::Closed`].
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.pending.clear();
        let listener = self.inner.listener.lock().take();
        if let Some(listener) = listener {
            if let Err(err) = listener.await {
                error!(target: TARGET, error = %err, "udp listener task failed");
            }
        }
        info!(target: TARGET, local = %self.inner.local_addr, "udp transport stopped");
    }

    fn record(
        &self,
        method: Method,
        target: SocketAddr,
        outcome: AttemptOutcome,
        elapsed: Duration,
        error: Option<&str>,
    ) {
        self.inner
            .stats
            .record(method.as_str(), target.ip(), outcome, elapsed, error);
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_attempt(method.as_str(), outcome.as_label());
            if outcome == AttemptOutcome::Success {
                metrics.observe_latency(method.as_str(), elapsed.as_secs_f64());
            }
        }
    }
}

#[async_trait]
impl DeviceLink for UdpTransport {
    async fn call(
        &self,
        target: SocketAddr,
        method: Method,
        params: Map<String, Value>,
        options: RequestOptions,
    ) -> Result<Map<String, Value>> {
        let response = self.request(target, method, params, options).await?;
        match response.outcome {
            Outcome::Result(result) => Ok(result),
            Outcome::Error(error) => Err(TransportError::Device {
                method: method.to_string(),
                error,
            }),
        }
    }

    async fn broadcast(
        &self,
        method: Method,
        params: Map<String, Value>,
        window: Duration,
    ) -> Result<Vec<Reply>> {
        let id = if method == Method::GetDevice {
            DISCOVERY_REQUEST_ID
        } else {
            self.free_id()
        };
        let request = self.inner.codec.build_with_id(id, method.as_str(), params)?;
        self.send_broadcast(&request, window).await
    }
}

async fn listen(
    socket: Arc<UdpSocket>,
    pending: Arc<PendingRegistry>,
    metrics: Option<TransportMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => route(&buf[..len], from, &pending, metrics.as_ref()),
                Err(err) => debug!(target: TARGET, error = %err, "udp receive failed"),
            }
        }
    }
    debug!(target: TARGET, "udp listener stopped");
}

fn route(
    datagram: &[u8],
    from: SocketAddr,
    pending: &PendingRegistry,
    metrics: Option<&TransportMetrics>,
) {
    let unmatched = |kind: &str| {
        if let Some(metrics) = metrics {
            metrics.record_unmatched(kind);
        }
    };
    match parse_response(datagram) {
        Ok(Inbound::Response(response)) => {
            let id = response.id;
            let delivery = Delivery {
                from,
                payload: Ok(response),
            };
            if !pending.dispatch(id, delivery) {
                debug!(target: TARGET, %from, id, "discarding unmatched response");
                unmatched("response");
            }
        }
        Ok(Inbound::Echo { id, method, .. }) => {
            trace!(target: TARGET, %from, ?id, %method, "discarding echoed request");
            unmatched("echo");
        }
        Ok(Inbound::Noise { reason }) => {
            debug!(target: TARGET, %from, %reason, "discarding non-protocol datagram");
            unmatched("noise");
        }
        Err(err) => {
            let routed = err.id().is_some_and(|id| {
                pending.dispatch(
                    id,
                    Delivery {
                        from,
                        payload: Err(err.clone()),
                    },
                )
            });
            if !routed {
                debug!(target: TARGET, %from, error = %err, "discarding malformed datagram");
                unmatched("malformed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_bess_common::CodecConfig;
    use serde_json::json;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config(device_port: u16) -> TransportConfig {
        TransportConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_port: 0,
            device_port,
            request_timeout: Duration::from_millis(200),
            min_request_interval: Duration::from_millis(1),
            read_retries: 2,
            write_retries: 3,
            retry_base_delay: Duration::from_millis(10),
            retry_jitter: Duration::ZERO,
            broadcast_addresses: vec![Ipv4Addr::LOCALHOST],
            ..TransportConfig::default()
        }
    }

    /// Fake device: answers each datagram with whatever `reply` returns.
    async fn device<F>(reply: F) -> (SocketAddr, Arc<AtomicUsize>)
    where
        F: Fn(Value) -> Vec<Vec<u8>> + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                counter.fetch_add(1, Ordering::SeqCst);
                let request: Value = serde_json::from_slice(&buf[..len]).unwrap();
                for datagram in reply(request) {
                    socket.send_to(&datagram, from).await.unwrap();
                }
            }
        });
        (addr, seen)
    }

    async fn transport(device_port: u16) -> UdpTransport {
        UdpTransport::bind(test_config(device_port), Codec::new(CodecConfig::default()), None)
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn request_resolves_by_id() {
        let (addr, _) = device(|request| {
            vec![serde_json::to_vec(&json!({
                "id": request["id"],
                "src": "VenusE-test",
                "result": {"id": 0, "bat_soc": 55, "bat_power": 120}
            }))
            .unwrap()]
        })
        .await;
        let transport = transport(addr.port()).await;
        let result = transport
            .call(addr, Method::EsGetStatus, json!({"id": 0}).as_object().cloned().unwrap(), RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(result["bat_soc"], json!(55));
        assert_eq!(transport.pending_requests(), 0);
        let stats = transport.command_stats_for(addr.ip());
        assert_eq!(stats["ES.GetStatus"].successes, 1);
        transport.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_device_times_out_after_budget() {
        let (addr, seen) = device(|_| Vec::new()).await;
        let transport = transport(addr.port()).await;
        let err = transport
            .call(addr, Method::EsGetMode, Map::new(), RequestOptions::with_timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { attempts: 3, .. }));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(transport.pending_requests(), 0);
        let stats = &transport.command_stats()["ES.GetMode"];
        assert_eq!((stats.attempts, stats.timeouts), (3, 3));
        transport.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn device_error_is_not_retried() {
        let (addr, seen) = device(|request| {
            vec![serde_json::to_vec(&json!({
                "id": request["id"],
                "error": {"code": -32601, "message": "Method not found"}
            }))
            .unwrap()]
        })
        .await;
        let transport = transport(addr.port()).await;
        let err = transport
            .call(addr, Method::BleGetStatus, Map::new(), RequestOptions::default())
            .await
            .unwrap_err();
        match err {
            TransportError::Device { error, .. } => assert_eq!(error.code, Some(-32601)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        transport.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn echoes_and_noise_do_not_resolve_requests() {
        let (addr, _) = device(|request| {
            vec![
                b"Parse error".to_vec(),
                serde_json::to_vec(&request).unwrap(),
                serde_json::to_vec(&json!({"id": request["id"], "result": {"mode": "Auto"}})).unwrap(),
            ]
        })
        .await;
        let transport = transport(addr.port()).await;
        let result = transport
            .call(addr, Method::EsGetMode, Map::new(), RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(result["mode"], "Auto");
        transport.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_request_releases_its_slot() {
        let (addr, _) = device(|_| Vec::new()).await;
        let transport = transport(addr.port()).await;
        let task = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .call(addr, Method::EsGetMode, Map::new(), RequestOptions::with_timeout(Duration::from_secs(30)))
                    .await
            })
        };
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.pending_requests(), 1);
        task.abort();
        let _ = task.await;
        assert_eq!(transport.pending_requests(), 0);
        transport.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broadcast_dedupes_by_stable_id() {
        let (addr, _) = device(|request| {
            let reply = serde_json::to_vec(&json!({
                "id": request["id"],
                "src": "VenusE-acd929a74a38",
                "result": {"device": "VenusE", "ble_mac": "acd929a74a38", "ip": "127.0.0.1"}
            }))
            .unwrap();
            vec![b"Parse error".to_vec(), reply.clone(), reply]
        })
        .await;
        let transport = transport(addr.port()).await;
        let replies = transport
            .broadcast(Method::GetDevice, json!({"ble_mac": "0"}).as_object().cloned().unwrap(), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].stable_id.mac(), Some("ac:d9:29:a7:4a:38"));
        assert_eq!(replies[0].response.id, DISCOVERY_REQUEST_ID);
        transport.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn anonymous_broadcast_reply_does_not_claim_the_sender() {
        let (addr, _) = device(|request| {
            let anonymous = serde_json::to_vec(&json!({
                "id": request["id"],
                "result": {"bat_soc": 50}
            }))
            .unwrap();
            let identified = serde_json::to_vec(&json!({
                "id": request["id"],
                "src": "VenusE-acd929a74a38",
                "result": {"device": "VenusE", "ip": "127.0.0.1"}
            }))
            .unwrap();
            vec![anonymous, identified]
        })
        .await;
        let transport = transport(addr.port()).await;
        let replies = transport
            .broadcast(Method::GetDevice, json!({"ble_mac": "0"}).as_object().cloned().unwrap(), Duration::from_millis(200))
            .await
            .unwrap();
        // both replies share the sender address, so the anonymous one must not
        // take the ip-based identifier first
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].response.result().unwrap()["device"], "VenusE");
        transport.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retries_back_off_exponentially_within_jitter() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&arrivals);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            while socket.recv_from(&mut buf).await.is_ok() {
                recorded.lock().push(Instant::now());
            }
        });
        let base = Duration::from_millis(1000);
        let jitter = Duration::from_millis(200);
        let timeout = Duration::from_millis(100);
        let transport = UdpTransport::bind(
            TransportConfig {
                read_retries: 3,
                write_retries: 4,
                retry_base_delay: base,
                retry_jitter: jitter,
                ..test_config(addr.port())
            },
            Codec::new(CodecConfig::default()),
            None,
        )
        .await
        .unwrap();

        let err = transport
            .call(addr, Method::EsGetMode, Map::new(), RequestOptions::with_timeout(timeout))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { attempts: 4, .. }));

        let arrivals = arrivals.lock().clone();
        assert_eq!(arrivals.len(), 4);
        for (n, pair) in arrivals.windows(2).enumerate() {
            let gap = pair[1] - pair[0];
            let backoff = base * 2u32.pow(n as u32);
            let low = timeout + backoff;
            let high = low + jitter + Duration::from_millis(5);
            assert!(gap >= low && gap <= high, "gap {n}: {gap:?} outside [{low:?}, {high:?}]");
        }
        transport.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_reply_after_timeout_is_not_delivered_to_next_request() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let server = Arc::clone(&socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            let mut served = 0u32;
            while let Ok((len, from)) = server.recv_from(&mut buf).await {
                served += 1;
                let request: Value = serde_json::from_slice(&buf[..len]).unwrap();
                // the first answer misses its deadline and lands while the
                // second request is still waiting
                let (delay, mode) = if served == 1 {
                    (Duration::from_millis(100), "Stale")
                } else {
                    (Duration::from_millis(150), "Auto")
                };
                let reply = serde_json::to_vec(&json!({"id": request["id"], "result": {"mode": mode}})).unwrap();
                let socket = Arc::clone(&server);
                tokio::spawn(async move {
                    time::sleep(delay).await;
                    socket.send_to(&reply, from).await.unwrap();
                });
            }
        });
        let transport = transport(addr.port()).await;

        let err = transport
            .call(addr, Method::EsGetMode, Map::new(), RequestOptions::with_timeout(Duration::from_millis(50)).retries(0))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let result = transport
            .call(addr, Method::EsGetMode, Map::new(), RequestOptions::with_timeout(Duration::from_millis(500)).retries(0))
            .await
            .unwrap();
        assert_eq!(result["mode"], "Auto");
        assert_eq!(transport.pending_requests(), 0);
        transport.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_command_is_never_sent() {
        let (addr, seen) = device(|_| Vec::new()).await;
        let transport = transport(addr.port()).await;
        let params = json!({"id": 0, "config": {"mode": "Passive", "passive_cfg": {"power": 9000, "cd_time": 60}}});
        let err = transport
            .call(addr, Method::EsSetMode, params.as_object().cloned().unwrap(), RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Validation(_)));
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        transport.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_rejects_new_requests() {
        let (addr, _) = device(|_| Vec::new()).await;
        let transport = transport(addr.port()).await;
        transport.shutdown().await;
        let err = transport
            .call(addr, Method::EsGetMode, Map::new(), RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
