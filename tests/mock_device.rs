//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Loopback UDP device used by the R-BESS integration tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! A scriptable device bound to `127.0.0.1:0`.
//!
//! Answers are keyed by method name. Methods without an answer are ignored, as
//! is everything while the device is silent.
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use r_bess_common::TransportConfig;
use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

pub const DEVICE_SRC: &str = "VenusE-mock";

#[derive(Default)]
struct State {
    answers: Mutex<HashMap<String, Value>>,
    silent: AtomicBool,
    apply_set_mode: AtomicBool,
    noise_before_reply: AtomicUsize,
    requests: Mutex<Vec<Value>>,
}

pub struct MockDevice {
    addr: SocketAddr,
    state: Arc<State>,
    task: JoinHandle<()>,
}

impl MockDevice {
    pub async fn start() -> std::io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let state = Arc::new(State::default());
        let task = tokio::spawn(serve(socket, Arc::clone(&state)));
        Ok(Self { addr, state, task })
    }

    /// A device that already answers every polled method.
    pub async fn battery(soc: f64, bat_power: f64) -> std::io::Result<Self> {
        let device = Self::start().await?;
        device.answer("Marstek.GetDevice", identity("AA:BB:CC:00:11:22"));
        device.answer("ES.GetMode", json!({"id": 0, "mode": "Auto", "ongrid_power": 0, "bat_soc": soc}));
        device.answer(
            "ES.GetStatus",
            json!({"id": 0, "bat_soc": soc, "bat_cap": 5120, "bat_power": bat_power, "pv_power": 0, "ongrid_power": 0}),
        );
        device.answer(
            "EM.GetStatus",
            json!({"id": 0, "ct_state": 1, "a_power": 10, "b_power": 20, "c_power": 30, "total_power": 60}),
        );
        device.answer("ES.SetMode", json!({"id": 0, "set_result": true}));
        Ok(device)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn answer(&self, method: &str, result: Value) {
        self.state.answers.lock().insert(method.to_owned(), result);
    }

    /// Stop replying to anything.
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Reflect accepted `ES.SetMode` configs in later `ES.GetMode` answers.
    pub fn apply_set_mode(&self, apply: bool) {
        self.state.apply_set_mode.store(apply, Ordering::SeqCst);
    }

    /// Send `count` junk datagrams (alternating garbage and request echoes)
    /// ahead of every real reply.
    pub fn noise_before_reply(&self, count: usize) {
        self.state.noise_before_reply.store(count, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|request| request["method"] == method)
            .count()
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Loopback transport settings aimed at `device_port`, with broadcasts sent
/// to 127.0.0.1 only.
pub fn transport_config(device_port: u16) -> TransportConfig {
    TransportConfig {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        bind_port: 0,
        device_port,
        request_timeout: Duration::from_millis(150),
        min_request_interval: Duration::from_millis(1),
        read_retries: 0,
        write_retries: 1,
        retry_base_delay: Duration::from_millis(10),
        retry_jitter: Duration::ZERO,
        broadcast_addresses: vec![Ipv4Addr::LOCALHOST],
        ..TransportConfig::default()
    }
}

/// `Marstek.GetDevice` result for a device with the given BLE MAC.
pub fn identity(ble_mac: &str) -> Value {
    json!({
        "device": "VenusE",
        "ver": 111,
        "ble_mac": ble_mac,
        "wifi_mac": "a1b2c3d4e5f6",
        "wifi_name": "home",
        "ip": "127.0.0.1",
    })
}

async fn serve(socket: UdpSocket, state: Arc<State>) {
    let mut buf = vec![0u8; 65535];
    while let Ok((len, from)) = socket.recv_from(&mut buf).await {
        let Ok(request) = serde_json::from_slice::<Value>(&buf[..len]) else {
            continue;
        };
        state.requests.lock().push(request.clone());
        if state.silent.load(Ordering::SeqCst) {
            continue;
        }
        let Some(method) = request["method"].as_str() else {
            continue;
        };
        if method == "ES.SetMode" && state.apply_set_mode.load(Ordering::SeqCst) {
            reflect_mode(&state, &request["params"]["config"]);
        }
        let Some(result) = state.answers.lock().get(method).cloned() else {
            continue;
        };

        for n in 0..state.noise_before_reply.load(Ordering::SeqCst) {
            let junk = if n % 2 == 0 {
                format!("garbage #{n}").into_bytes()
            } else {
                buf[..len].to_vec()
            };
            let _ = socket.send_to(&junk, from).await;
        }
        let reply = json!({"id": request["id"], "src": DEVICE_SRC, "result": result});
        let Ok(bytes) = serde_json::to_vec(&reply) else {
            continue;
        };
        let _ = socket.send_to(&bytes, from).await;
    }
}

fn reflect_mode(state: &State, config: &Value) {
    let mut answers = state.answers.lock();
    let mode = answers
        .entry("ES.GetMode".to_owned())
        .or_insert_with(|| json!({"id": 0}));
    mode["mode"] = config["mode"].clone();
    if let Some(passive) = config.get("passive_cfg") {
        mode["passive_cfg"] = passive.clone();
    }
}
