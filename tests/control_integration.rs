//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Verified control commands against a loopback device."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use r_bess_common::{CodecConfig, ControlConfig, PollingConfig};
use r_bess_core::{
    ControlError, ControlExecutor, CoordinatorHandle, CycleOutcome, DeviceTarget,
    PollingCoordinator, Tier,
};
use r_bess_proto::{Codec, ModeConfig, PassiveTarget};
use r_bess_tests::{transport_config, MockDevice};
use r_bess_transport::{DeviceLink, UdpTransport};
use serde_json::json;

struct Rig {
    device: MockDevice,
    transport: UdpTransport,
    poller: CoordinatorHandle,
    executor: ControlExecutor,
}

impl Rig {
    async fn start(device: MockDevice) -> Self {
        let transport = UdpTransport::bind(
            transport_config(device.port()),
            Codec::new(CodecConfig::default()),
            None,
        )
        .await
        .unwrap();
        let link: Arc<dyn DeviceLink> = Arc::new(transport.clone());
        let poller = PollingCoordinator::new(
            "battery",
            link,
            PollingConfig {
                request_delay: Duration::from_millis(5),
                request_timeout: Duration::from_millis(150),
                include_pv: false,
                ..PollingConfig::default()
            },
            DeviceTarget::new(device.addr()),
        )
        .spawn();
        let executor = ControlExecutor::for_coordinator(
            &poller,
            Arc::new(Codec::new(CodecConfig::default())),
            ControlConfig {
                settle_delay: Duration::from_millis(50),
                verification_attempts: 3,
                verification_interval: Duration::from_millis(50),
                write_attempts: 2,
                retry_backoff: Duration::from_millis(20),
                retry_jitter: Duration::ZERO,
                ..ControlConfig::default()
            },
        );
        Self {
            device,
            transport,
            poller,
            executor,
        }
    }

    async fn stop(self) {
        self.poller.shutdown().await;
        self.transport.shutdown().await;
    }
}

fn passive() -> ModeConfig {
    ModeConfig::Passive(PassiveTarget {
        power: -2000,
        duration_secs: 1800,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn passive_mode_is_written_and_confirmed() {
    let device = MockDevice::battery(40.0, 0.0).await.unwrap();
    device.apply_set_mode(true);
    let rig = Rig::start(device).await;

    rig.executor.set_mode(&passive()).await.unwrap();

    let writes: Vec<_> = rig
        .device
        .requests()
        .into_iter()
        .filter(|request| request["method"] == "ES.SetMode")
        .collect();
    assert_eq!(writes.len(), 1);
    assert_eq!(
        writes[0]["params"],
        json!({"id": 0, "config": {"mode": "Passive", "passive_cfg": {"power": -2000, "cd_time": 1800}}})
    );
    assert!(!rig.poller.is_paused());
    rig.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ignored_mode_change_fails_verification_and_polling_resumes() {
    let device = MockDevice::battery(40.0, 0.0).await.unwrap();
    let rig = Rig::start(device).await;

    let err = rig.executor.set_mode(&passive()).await.unwrap_err();

    match &err {
        ControlError::Verification {
            observed,
            writes,
            attempts,
            ..
        } => {
            assert_eq!(*writes, 2);
            assert_eq!(*attempts, 3);
            assert!(observed.contains("Auto"), "observed: {observed}");
        }
        other => panic!("expected a verification failure, got {other}"),
    }
    assert_eq!(err.kind(), "verification");
    assert_eq!(rig.device.count("ES.SetMode"), 2);
    assert!(rig.device.count("ES.GetMode") >= 6);
    assert!(!rig.poller.is_paused());
    assert_eq!(rig.poller.fetch_tier(Tier::Fast).await, CycleOutcome::Success);
    rig.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn charge_is_confirmed_by_battery_flow() {
    let device = MockDevice::battery(40.0, -800.0).await.unwrap();
    device.apply_set_mode(true);
    let rig = Rig::start(device).await;

    rig.executor.charge(800).await.unwrap();

    let write = rig
        .device
        .requests()
        .into_iter()
        .find(|request| request["method"] == "ES.SetMode")
        .unwrap();
    let slot = &write["params"]["config"]["manual_cfg"];
    assert_eq!(write["params"]["config"]["mode"], "Manual");
    assert_eq!(slot["time_num"], 0);
    assert_eq!(slot["power"], -800);
    assert_eq!(slot["enable"], 1);
    rig.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn discharge_against_a_charging_battery_is_rejected() {
    let device = MockDevice::battery(40.0, -800.0).await.unwrap();
    device.apply_set_mode(true);
    let rig = Rig::start(device).await;

    let err = rig.executor.discharge(600).await.unwrap_err();

    assert!(matches!(err, ControlError::Verification { .. }), "got {err}");
    assert!(!rig.poller.is_paused());
    rig.stop().await;
}
