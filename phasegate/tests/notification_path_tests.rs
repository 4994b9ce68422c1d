// tests/notification_path_tests.rs
//
// Push mode end to end: a stub broker (httpmock) accepts the subscription
// and the forcePhase PATCH, notifications are posted to the real /notify
// endpoint, and the controller loop runs on its own task.

use std::sync::Arc;
use std::time::Duration;

use httpmock::Method::{DELETE, PATCH, POST};
use httpmock::{Mock, MockServer};
use serde_json::json;

use phasegate::broker::BrokerClient;
use phasegate::config::Config;
use phasegate::control::{run_push_loop, Controller, PushRuntime, Shutdown, StopReason};
use phasegate::error::{ErrorClass, PolicyError};
use phasegate::ops::ControllerMetrics;
use phasegate::policy::{validate_state, Policy, PolicyHandle};

const SUB_ID: &str = "urn:ngsi-ld:Subscription:control:J1";

/// Advances only on the congested state (3, 5, phase 0, pm25 12).
struct AdvanceOnCongestion;

impl Policy for AdvanceOnCongestion {
    fn version(&self) -> &str {
        "advance-on-congestion"
    }

    fn state_width(&self) -> usize {
        4
    }

    fn scores(&self, state: &[f64]) -> Result<Vec<f64>, PolicyError> {
        validate_state(state, 4)?;
        if state == [3.0, 5.0, 0.0, 12.0] {
            Ok(vec![0.0, 1.0])
        } else {
            Ok(vec![1.0, 0.0])
        }
    }
}

fn config(server: &MockServer) -> Config {
    let mut cfg = Config::default();
    cfg.intersection.min_green_steps = 0;
    cfg.broker.url = server.url("/ngsi-ld/v1");
    cfg.broker.notify_bind = "127.0.0.1".to_string();
    cfg.broker.notify_host = "127.0.0.1".to_string();
    cfg.broker.notify_port = 0;
    cfg.broker.startup_deadline_s = 5;
    cfg.broker.shutdown_grace_ms = 0;
    cfg
}

async fn stub_subscription(server: &MockServer) -> (Mock<'_>, Mock<'_>) {
    let create = server
        .mock_async(|when, then| {
            when.method(POST).path("/ngsi-ld/v1/subscriptions");
            then.status(201)
                .header("Location", format!("/ngsi-ld/v1/subscriptions/{SUB_ID}"));
        })
        .await;
    let delete = server
        .mock_async(|when, then| {
            when.method(DELETE)
                .path(format!("/ngsi-ld/v1/subscriptions/{SUB_ID}"));
            then.status(204);
        })
        .await;
    (create, delete)
}

async fn post_notification(port: u16, body: serde_json::Value) {
    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/notify"))
        .json(&body)
        .send()
        .await
        .expect("notify request");
    assert_eq!(resp.status().as_u16(), 200);
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn congested_notification_forces_one_phase_change() {
    let server = MockServer::start_async().await;
    let (create, delete) = stub_subscription(&server).await;
    let force = server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path("/ngsi-ld/v1/entities/urn:ngsi-ld:TrafficLight:J1/attrs")
                .json_body_partial(r#"{"forcePhase": {"type": "Property", "value": 1}}"#);
            then.status(204);
        })
        .await;

    let cfg = config(&server);
    let metrics = ControllerMetrics::new();
    let client = BrokerClient::new(&cfg.broker).expect("client");
    let runtime = PushRuntime::start(&cfg, client.clone(), metrics.clone())
        .await
        .expect("push runtime");
    create.assert_async().await;
    assert_eq!(runtime.subscription().active_id().as_deref(), Some(SUB_ID));

    let handle = Arc::new(PolicyHandle::new(Arc::new(AdvanceOnCongestion)));
    let mut controller =
        Controller::new(&cfg.intersection, handle, metrics.clone()).expect("controller");
    let queue = Arc::clone(runtime.queue());
    let shutdown = Shutdown::new();
    let loop_shutdown = shutdown.clone();
    let task = tokio::spawn(async move {
        run_push_loop(&mut controller, &queue, &client, &loop_shutdown).await
    });

    post_notification(
        runtime.port(),
        json!({
            "id": "urn:ngsi-ld:Notification:1",
            "type": "Notification",
            "subscriptionId": SUB_ID,
            "notifiedAt": "2026-01-01T00:00:01.000Z",
            "data": [
                {
                    "id": "urn:ngsi-ld:TrafficFlowObserved:J1",
                    "type": "TrafficFlowObserved",
                    "queues": {"type": "Property", "value": [3, 5]},
                    "phase": {"type": "Property", "value": 0}
                },
                {
                    "id": "urn:ngsi-ld:AirQualityObserved:J1",
                    "type": "AirQualityObserved",
                    "pm25": {"type": "Property", "value": 12.0}
                }
            ]
        }),
    )
    .await;

    wait_for(|| metrics.advances() >= 1).await;
    for _ in 0..250 {
        if force.hits_async().await >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Give a second command a chance to show up before asserting on it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    force.assert_hits_async(1).await;

    shutdown.trigger();
    let report = task.await.expect("join").expect("loop");
    assert_eq!(report.reason, StopReason::Shutdown);
    assert_eq!(report.ticks, 1);
    assert_eq!(report.advances, 1);
    assert_eq!(metrics.notifications_received(), 1);

    runtime.shutdown().await;
    delete.assert_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn air_only_and_foreign_updates_do_not_command() {
    let server = MockServer::start_async().await;
    let (_create, _delete) = stub_subscription(&server).await;
    let force = server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path("/ngsi-ld/v1/entities/urn:ngsi-ld:TrafficLight:J1/attrs");
            then.status(204);
        })
        .await;

    let cfg = config(&server);
    let metrics = ControllerMetrics::new();
    let client = BrokerClient::new(&cfg.broker).expect("client");
    let runtime = PushRuntime::start(&cfg, client.clone(), metrics.clone())
        .await
        .expect("push runtime");

    let handle = Arc::new(PolicyHandle::new(Arc::new(AdvanceOnCongestion)));
    let mut controller =
        Controller::new(&cfg.intersection, handle, metrics.clone()).expect("controller");
    let queue = Arc::clone(runtime.queue());
    let shutdown = Shutdown::new();
    let loop_shutdown = shutdown.clone();
    let task = tokio::spawn(async move {
        run_push_loop(&mut controller, &queue, &client, &loop_shutdown).await
    });

    post_notification(
        runtime.port(),
        json!({
            "subscriptionId": SUB_ID,
            "data": [{"id": "urn:ngsi-ld:AirQualityObserved:J1", "pm25": 12.0}]
        }),
    )
    .await;
    post_notification(
        runtime.port(),
        json!({
            "subscriptionId": SUB_ID,
            "data": [{"id": "urn:ngsi-ld:TrafficFlowObserved:J9", "queues": [3, 5]}]
        }),
    )
    .await;

    wait_for(|| metrics.errors(ErrorClass::Protocol) >= 1).await;
    shutdown.trigger();
    let report = task.await.expect("join").expect("loop");
    assert_eq!(report.ticks, 0);
    assert_eq!(report.advances, 0);
    assert_eq!(metrics.notifications_received(), 2);
    force.assert_hits_async(0).await;

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_body_still_gets_200() {
    let server = MockServer::start_async().await;
    let (_create, _delete) = stub_subscription(&server).await;

    let cfg = config(&server);
    let metrics = ControllerMetrics::new();
    let client = BrokerClient::new(&cfg.broker).expect("client");
    let runtime = PushRuntime::start(&cfg, client, metrics.clone())
        .await
        .expect("push runtime");

    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/notify", runtime.port()))
        .body("{not json")
        .send()
        .await
        .expect("notify request");
    assert_eq!(resp.status().as_u16(), 200);
    assert!(runtime.queue().is_empty());
    assert_eq!(metrics.notifications_received(), 0);
    assert_eq!(metrics.errors(ErrorClass::Protocol), 1);

    runtime.shutdown().await;
}
