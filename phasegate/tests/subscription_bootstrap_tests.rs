// tests/subscription_bootstrap_tests.rs
//
// Startup registration against a broker that is not there yet.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use httpmock::Method::POST;
use httpmock::MockServer;

use phasegate::broker::{retry_until, Backoff, BrokerClient, SubscriptionManager, SubscriptionSpec};
use phasegate::config::BrokerConfig;
use phasegate::error::BrokerError;

fn client(server: &MockServer) -> BrokerClient {
    let cfg = BrokerConfig {
        url: server.url("/ngsi-ld/v1"),
        max_tries: 1,
        ..BrokerConfig::default()
    };
    BrokerClient::new(&cfg).expect("client")
}

fn spec() -> SubscriptionSpec {
    SubscriptionSpec::controller("J1", "http://127.0.0.1:8090/notify")
}

#[tokio::test(start_paused = true)]
async fn broker_coming_up_late_is_registered_exactly_once() {
    let started = tokio::time::Instant::now();
    let attempts = AtomicU32::new(0);
    let registrations = AtomicU32::new(0);

    let (attempts_seen, registered) = (&attempts, &registrations);

    let result = retry_until(Duration::from_secs(30), Backoff::default(), move || {
        attempts_seen.fetch_add(1, Ordering::SeqCst);
        let up = started.elapsed() >= Duration::from_secs(12);
        async move {
            if up {
                registered.fetch_add(1, Ordering::SeqCst);
                Ok("urn:ngsi-ld:Subscription:control:J1".to_string())
            } else {
                Err(BrokerError::Unavailable("connection refused".to_string()))
            }
        }
    })
    .await;

    assert_eq!(result.expect("registered"), "urn:ngsi-ld:Subscription:control:J1");
    assert_eq!(registrations.load(Ordering::SeqCst), 1);
    assert!(attempts.load(Ordering::SeqCst) > 1);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(12), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(30), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn non_transient_failure_is_not_retried() {
    let attempts = AtomicU32::new(0);
    let result: Result<String, BrokerError> =
        retry_until(Duration::from_secs(30), Backoff::default(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(BrokerError::Rejected {
                    status: 400,
                    body: "bad subscription".to_string(),
                })
            }
        })
        .await;
    assert!(matches!(result, Err(BrokerError::Rejected { status: 400, .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bootstrap_waits_out_an_unavailable_broker() {
    let server = MockServer::start_async().await;
    let unavailable = server
        .mock_async(|when, then| {
            when.method(POST).path("/ngsi-ld/v1/subscriptions");
            then.status(503);
        })
        .await;
    let manager = SubscriptionManager::new(client(&server), spec());

    let (result, created) = tokio::join!(manager.bootstrap(Duration::from_secs(10)), async {
        tokio::time::sleep(Duration::from_millis(700)).await;
        // The older 503 mock keeps matching until it is deleted.
        let created = server
            .mock_async(|when, then| {
                when.method(POST).path("/ngsi-ld/v1/subscriptions");
                then.status(201).header(
                    "Location",
                    "/ngsi-ld/v1/subscriptions/urn:ngsi-ld:Subscription:control:J1",
                );
            })
            .await;
        unavailable.delete_async().await;
        created
    });

    assert_eq!(result.expect("bootstrap"), "urn:ngsi-ld:Subscription:control:J1");
    created.assert_hits_async(1).await;
    assert_eq!(
        manager.active_id().as_deref(),
        Some("urn:ngsi-ld:Subscription:control:J1")
    );
}

#[tokio::test]
async fn conflict_is_treated_as_already_registered() {
    let server = MockServer::start_async().await;
    let conflict = server
        .mock_async(|when, then| {
            when.method(POST).path("/ngsi-ld/v1/subscriptions");
            then.status(409).body("AlreadyExists");
        })
        .await;
    let c = client(&server);

    let direct = c.subscribe(&spec()).await;
    assert!(matches!(
        direct,
        Err(BrokerError::ConflictingSubscription { ref id }) if id == "urn:ngsi-ld:Subscription:control:J1"
    ));

    let manager = SubscriptionManager::new(c, spec());
    let id = manager.register().await.expect("conflict is success");
    assert_eq!(id, "urn:ngsi-ld:Subscription:control:J1");
    assert_eq!(manager.active_id().as_deref(), Some(id.as_str()));
    conflict.assert_hits_async(2).await;
}

#[tokio::test]
async fn rejected_subscription_fails_bootstrap_immediately() {
    let server = MockServer::start_async().await;
    let rejected = server
        .mock_async(|when, then| {
            when.method(POST).path("/ngsi-ld/v1/subscriptions");
            then.status(400).body("BadRequestData");
        })
        .await;
    let manager = SubscriptionManager::new(client(&server), spec());
    let result = manager.bootstrap(Duration::from_secs(10)).await;
    assert!(matches!(result, Err(BrokerError::Rejected { status: 400, .. })));
    rejected.assert_hits_async(1).await;
    assert!(manager.active_id().is_none());
}
