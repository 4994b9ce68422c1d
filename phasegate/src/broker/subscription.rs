// src/broker/subscription.rs
//
// Subscription lifecycle: one subscription per (intersection, purpose),
// registered at startup with deadline-bounded retries and deleted
// best-effort at shutdown.
//
// Ids are deterministic (`urn:ngsi-ld:Subscription:<purpose>:<tlsId>`), so
// re-registering after a restart collides with the previous subscription
// and the broker's 409 is taken as "already owned".

use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use super::{retry_until, Backoff, BrokerClient, BrokerResult};
use crate::error::BrokerError;
use crate::types::urn;

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSpec {
    pub id: String,
    pub description: String,
    /// Entity ids to watch.
    pub entities: Vec<(String, String)>,
    pub watched_attributes: Vec<String>,
    pub notify_uri: String,
    pub accept: String,
    /// Minimum seconds between notifications; 0 disables throttling.
    pub throttling_s: u32,
}

impl SubscriptionSpec {
    /// The controller's subscription: flow and air-quality changes for
    /// one intersection.
    pub fn controller(tls_id: &str, notify_uri: &str) -> Self {
        Self {
            id: urn::subscription_id(tls_id, "control"),
            description: format!("phasegate controller feed for {tls_id}"),
            entities: vec![
                (
                    urn::entity_id(urn::TRAFFIC_FLOW, tls_id),
                    urn::TRAFFIC_FLOW.to_string(),
                ),
                (
                    urn::entity_id(urn::AIR_QUALITY, tls_id),
                    urn::AIR_QUALITY.to_string(),
                ),
            ],
            watched_attributes: vec![
                super::ngsi::ATTR_QUEUES.to_string(),
                super::ngsi::ATTR_PHASE.to_string(),
                super::ngsi::ATTR_PM25.to_string(),
            ],
            notify_uri: notify_uri.to_string(),
            accept: "application/json".to_string(),
            throttling_s: 0,
        }
    }

    pub fn to_document(&self) -> Value {
        let entities: Vec<Value> = self
            .entities
            .iter()
            .map(|(id, ty)| json!({ "id": id, "type": ty }))
            .collect();
        let mut doc = json!({
            "id": self.id,
            "type": "Subscription",
            "description": self.description,
            "entities": entities,
            "watchedAttributes": self.watched_attributes,
            "notification": {
                "format": "normalized",
                "endpoint": {
                    "uri": self.notify_uri,
                    "accept": self.accept,
                }
            }
        });
        if self.throttling_s > 0 {
            doc["throttling"] = json!(self.throttling_s);
        }
        doc
    }
}

/// Owns the broker-side subscription for one intersection.
pub struct SubscriptionManager {
    client: BrokerClient,
    spec: SubscriptionSpec,
    active: Mutex<Option<String>>,
}

impl SubscriptionManager {
    pub fn new(client: BrokerClient, spec: SubscriptionSpec) -> Self {
        Self {
            client,
            spec,
            active: Mutex::new(None),
        }
    }

    pub fn spec(&self) -> &SubscriptionSpec {
        &self.spec
    }

    pub fn active_id(&self) -> Option<String> {
        match self.active.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_active(&self, id: Option<String>) {
        match self.active.lock() {
            Ok(mut g) => *g = id,
            Err(poisoned) => *poisoned.into_inner() = id,
        }
    }

    /// One registration attempt. A conflict counts as success.
    pub async fn register(&self) -> BrokerResult<String> {
        let id = match self.client.subscribe(&self.spec).await {
            Ok(id) => id,
            Err(BrokerError::ConflictingSubscription { id }) => {
                info!(subscription_id = %id, "equivalent subscription already registered");
                id
            }
            Err(err) => return Err(err),
        };
        self.set_active(Some(id.clone()));
        Ok(id)
    }

    /// Keep registering until success or `deadline`.
    pub async fn bootstrap(&self, deadline: Duration) -> BrokerResult<String> {
        retry_until(deadline, Backoff::default(), || self.register()).await
    }

    /// Delete the subscription; failures are logged and swallowed.
    pub async fn shutdown(&self) {
        let Some(id) = self.active_id() else {
            return;
        };
        match self.client.unsubscribe(&id).await {
            Ok(()) => info!(subscription_id = %id, "subscription deleted"),
            Err(err) => warn!(subscription_id = %id, error = %err, "subscription delete failed"),
        }
        self.set_active(None);
    }
}
