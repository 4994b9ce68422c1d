// tests/broker_client_tests.rs
//
// BrokerClient against an httpmock broker: publish fallbacks, retry
// accounting, and the lookups the bridge relies on.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use httpmock::Method::{DELETE, GET, PATCH, POST};
use httpmock::MockServer;
use serde_json::json;

use phasegate::broker::{BoxFuture, BrokerClient, SleepFn};
use phasegate::config::BrokerConfig;
use phasegate::error::{BrokerError, ErrorClass};
use phasegate::ops::ControllerMetrics;
use phasegate::types::AirQualityObserved;

const LIGHT: &str = "urn:ngsi-ld:TrafficLight:J1";

fn client(server: &MockServer, max_tries: u32) -> BrokerClient {
    let cfg = BrokerConfig {
        url: server.url("/ngsi-ld/v1"),
        max_tries,
        ..BrokerConfig::default()
    };
    BrokerClient::new(&cfg).expect("client")
}

/// Counts backoff sleeps without waiting.
fn counting_sleep(counter: Arc<AtomicU32>) -> SleepFn {
    Arc::new(move |_: Duration| -> BoxFuture<'static, ()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {})
    })
}

#[tokio::test]
async fn missing_entity_is_created_after_patch_404() {
    let server = MockServer::start_async().await;
    let patch = server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path(format!("/ngsi-ld/v1/entities/{LIGHT}/attrs"));
            then.status(404).body("ResourceNotFound");
        })
        .await;
    let create = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/ngsi-ld/v1/entities")
                .json_body_partial(
                    r#"{"id": "urn:ngsi-ld:TrafficLight:J1", "type": "TrafficLight",
                        "forcePhase": {"type": "Property", "value": 0}}"#,
                );
            then.status(201);
        })
        .await;

    let metrics = ControllerMetrics::new();
    let c = client(&server, 1).with_metrics(metrics.clone());
    c.publish_force_phase("J1", 0).await.expect("upsert");

    patch.assert_hits_async(1).await;
    create.assert_hits_async(1).await;
    assert_eq!(metrics.errors(ErrorClass::Protocol), 0);
}

#[tokio::test]
async fn creation_race_falls_back_to_a_second_patch() {
    let server = MockServer::start_async().await;
    let patch = server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path("/ngsi-ld/v1/entities/urn:ngsi-ld:AirQualityObserved:J1/attrs");
            then.status(404);
        })
        .await;
    let create = server
        .mock_async(|when, then| {
            when.method(POST).path("/ngsi-ld/v1/entities");
            then.status(409).body("AlreadyExists");
        })
        .await;

    let air = AirQualityObserved {
        id: "urn:ngsi-ld:AirQualityObserved:J1".to_string(),
        pm25: 8.5,
    };
    let err = client(&server, 1)
        .publish_air(&air)
        .await
        .expect_err("second patch still 404");
    assert!(matches!(err, BrokerError::Rejected { status: 404, .. }));
    patch.assert_hits_async(2).await;
    create.assert_hits_async(1).await;
}

#[tokio::test]
async fn server_errors_are_retried_up_to_max_tries() {
    let server = MockServer::start_async().await;
    let busy = server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path(format!("/ngsi-ld/v1/entities/{LIGHT}/attrs"));
            then.status(503);
        })
        .await;

    let sleeps = Arc::new(AtomicU32::new(0));
    let metrics = ControllerMetrics::new();
    let c = client(&server, 3)
        .with_metrics(metrics.clone())
        .with_sleep_fn(counting_sleep(Arc::clone(&sleeps)));

    let err = c.publish_force_phase("J1", 1).await.expect_err("still busy");
    assert!(matches!(err, BrokerError::Rejected { status: 503, .. }));
    assert_eq!(err.class(), ErrorClass::Transient);
    busy.assert_hits_async(3).await;
    assert_eq!(sleeps.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.broker_retries(), 2);
    assert_eq!(metrics.errors(ErrorClass::Transient), 1);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start_async().await;
    let bad = server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path(format!("/ngsi-ld/v1/entities/{LIGHT}/attrs"));
            then.status(400).body("BadRequestData");
        })
        .await;

    let sleeps = Arc::new(AtomicU32::new(0));
    let c = client(&server, 5).with_sleep_fn(counting_sleep(Arc::clone(&sleeps)));
    let err = c.publish_force_phase("J1", 1).await.expect_err("rejected");
    assert_eq!(err.class(), ErrorClass::Protocol);
    bad.assert_hits_async(1).await;
    assert_eq!(sleeps.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unreachable_broker_is_transient() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        probe.local_addr().expect("addr").port()
    };
    let cfg = BrokerConfig {
        url: format!("http://127.0.0.1:{port}/ngsi-ld/v1"),
        max_tries: 1,
        request_timeout_ms: 500,
        ..BrokerConfig::default()
    };
    let err = BrokerClient::new(&cfg)
        .expect("client")
        .get_entity(LIGHT)
        .await
        .expect_err("nothing listening");
    assert!(matches!(err, BrokerError::Unavailable(_)));
    assert_eq!(err.class(), ErrorClass::Transient);
}

#[tokio::test]
async fn entity_lookup_and_delete_tolerate_absence() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/ngsi-ld/v1/entities/{LIGHT}"));
            then.status(200).json_body(json!({
                "id": LIGHT,
                "type": "TrafficLight",
                "forcePhase": {"type": "Property", "value": 1}
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/ngsi-ld/v1/entities/urn:ngsi-ld:TrafficLight:J9");
            then.status(404);
        })
        .await;
    let gone = server
        .mock_async(|when, then| {
            when.method(DELETE)
                .path("/ngsi-ld/v1/entities/urn:ngsi-ld:TrafficLight:J9");
            then.status(404);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/ngsi-ld/v1/entities")
                .query_param("type", "TrafficLight");
            then.status(200).json_body(json!([{"id": LIGHT, "type": "TrafficLight"}]));
        })
        .await;

    let c = client(&server, 1);
    let light = c.get_entity(LIGHT).await.expect("get").expect("present");
    assert_eq!(light["forcePhase"]["value"], 1);
    assert!(c
        .get_entity("urn:ngsi-ld:TrafficLight:J9")
        .await
        .expect("get")
        .is_none());
    c.delete_entity("urn:ngsi-ld:TrafficLight:J9")
        .await
        .expect("delete of a missing entity");
    gone.assert_async().await;

    let lights = c.query_entities("TrafficLight").await.expect("query");
    assert_eq!(lights.len(), 1);
}

#[tokio::test]
async fn slow_broker_times_out_as_unavailable() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/ngsi-ld/v1/entities/{LIGHT}"));
            then.status(200).delay(Duration::from_millis(800)).body("{}");
        })
        .await;
    let cfg = BrokerConfig {
        url: server.url("/ngsi-ld/v1"),
        max_tries: 1,
        request_timeout_ms: 100,
        ..BrokerConfig::default()
    };
    let err = BrokerClient::new(&cfg)
        .expect("client")
        .get_entity(LIGHT)
        .await
        .expect_err("timed out");
    assert!(matches!(err, BrokerError::Unavailable(_)));
}
