// tests/bridge_tests.rs
//
// The simulator bridge against an httpmock broker: forcePhase is applied
// once per change and every tick publishes both observation entities.

use chrono::{DateTime, Utc};
use httpmock::Method::{GET, PATCH, POST};
use httpmock::MockServer;
use serde_json::json;

use phasegate::bridge::Bridge;
use phasegate::broker::BrokerClient;
use phasegate::config::{BrokerConfig, IntersectionConfig};
use phasegate::control::{Shutdown, StopReason};
use phasegate::error::ErrorClass;
use phasegate::ops::ControllerMetrics;
use phasegate::sim::{QueueSim, QueueSimConfig, Simulator};

fn bridge(server: &MockServer, metrics: &ControllerMetrics) -> Bridge<QueueSim> {
    let intersection = IntersectionConfig::default();
    let sim = QueueSim::new(
        QueueSimConfig::default().with_total_vehicles(10_000),
        intersection.clone(),
    );
    let cfg = BrokerConfig {
        url: server.url("/ngsi-ld/v1"),
        max_tries: 1,
        ..BrokerConfig::default()
    };
    let client = BrokerClient::new(&cfg)
        .expect("client")
        .with_metrics(metrics.clone());
    let base = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
        .expect("base")
        .with_timezone(&Utc);
    Bridge::new(sim, client, &intersection, metrics.clone()).with_base_time(base)
}

#[tokio::test]
async fn force_phase_is_applied_once_and_observations_published() {
    let server = MockServer::start_async().await;
    let light = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/ngsi-ld/v1/entities/urn:ngsi-ld:TrafficLight:J1");
            then.status(200).json_body(json!({
                "id": "urn:ngsi-ld:TrafficLight:J1",
                "type": "TrafficLight",
                "forcePhase": {"type": "Property", "value": 1}
            }));
        })
        .await;
    let flow = server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path("/ngsi-ld/v1/entities/urn:ngsi-ld:TrafficFlowObserved:J1/attrs")
                .json_body_partial(
                    r#"{"dateObservedFrom": {"type": "Property", "value": "2026-01-01T00:00:00.000Z"}}"#,
                );
            then.status(204);
        })
        .await;
    let later_flow = server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path("/ngsi-ld/v1/entities/urn:ngsi-ld:TrafficFlowObserved:J1/attrs");
            then.status(204);
        })
        .await;
    let air = server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path("/ngsi-ld/v1/entities/urn:ngsi-ld:AirQualityObserved:J1/attrs");
            then.status(204);
        })
        .await;

    let metrics = ControllerMetrics::new();
    let mut b = bridge(&server, &metrics);
    b.simulator_mut().start().expect("start");

    let first = b.tick().await.expect("tick");
    assert_eq!(first.forced, Some(1));
    assert_eq!(first.published, 2);
    assert_eq!(first.publish_failures, 0);
    assert_eq!(b.simulator_mut().read_state().expect("state").phase, 1);

    let second = b.tick().await.expect("tick");
    assert_eq!(second.forced, None);
    assert_eq!(second.published, 2);

    light.assert_hits_async(2).await;
    // Only the first window starts at the base time.
    flow.assert_hits_async(1).await;
    later_flow.assert_hits_async(1).await;
    air.assert_hits_async(2).await;
}

#[tokio::test]
async fn out_of_range_request_is_ignored_and_run_closes_the_session() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/ngsi-ld/v1/entities/urn:ngsi-ld:TrafficLight:J1");
            then.status(200).json_body(json!({
                "id": "urn:ngsi-ld:TrafficLight:J1",
                "type": "TrafficLight",
                "forcePhase": {"type": "Property", "value": 7}
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path("/ngsi-ld/v1/entities/urn:ngsi-ld:TrafficFlowObserved:J1/attrs");
            then.status(204);
        })
        .await;
    // The air entity does not exist yet and creation fails.
    server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path("/ngsi-ld/v1/entities/urn:ngsi-ld:AirQualityObserved:J1/attrs");
            then.status(404);
        })
        .await;
    let create = server
        .mock_async(|when, then| {
            when.method(POST).path("/ngsi-ld/v1/entities");
            then.status(400).body("BadRequestData");
        })
        .await;

    let metrics = ControllerMetrics::new();
    let mut b = bridge(&server, &metrics);
    let report = b.run(3, &Shutdown::new()).await.expect("run");

    assert_eq!(report.reason, StopReason::MaxTicks);
    assert_eq!(report.ticks, 3);
    assert_eq!(report.forced, 0);
    assert_eq!(report.published, 3);
    assert_eq!(report.publish_failures, 3);
    // Three out-of-range requests plus three rejected creations.
    assert_eq!(metrics.errors(ErrorClass::Protocol), 6);
    create.assert_hits_async(3).await;
    assert!(!b.simulator().is_running());
}

#[tokio::test]
async fn missing_traffic_light_means_no_command() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/ngsi-ld/v1/entities/urn:ngsi-ld:TrafficLight:J1");
            then.status(404);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(PATCH);
            then.status(204);
        })
        .await;

    let metrics = ControllerMetrics::new();
    let mut b = bridge(&server, &metrics);
    let shutdown = Shutdown::new();
    let report = b.run(2, &shutdown).await.expect("run");
    assert_eq!(report.forced, 0);
    assert_eq!(report.published, 4);
    assert_eq!(metrics.errors(ErrorClass::Protocol), 0);
}
