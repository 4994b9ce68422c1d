//! Broker adapter: the only component that speaks the context-broker wire
//! format.
//!
//! `BrokerClient` wraps every HTTP call in a bounded timeout and a bounded
//! retry loop with exponential backoff. Publishes use PATCH-then-create:
//! an attribute update is attempted first and a 404 falls back to entity
//! creation.

pub mod ngsi;
pub mod notify;
pub mod subscription;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::ops::ControllerMetrics;
use crate::types::{urn, AirQualityObserved, TrafficFlowObserved};

pub use notify::{NotificationServer, StateQueue};
pub use subscription::{SubscriptionManager, SubscriptionSpec};

pub type BrokerResult<T> = Result<T, BrokerError>;
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type SleepFn = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

pub fn tokio_sleep() -> SleepFn {
    Arc::new(|d| -> BoxFuture<'static, ()> { Box::pin(tokio::time::sleep(d)) })
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total tries including the first.
    pub max_tries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &BrokerConfig) -> Self {
        Self {
            max_tries: cfg.max_tries.max(1),
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            ..Self::default()
        }
    }

    pub fn next_backoff(&self, current: Duration) -> Duration {
        Duration::from_millis(
            ((current.as_millis() as f64) * self.backoff_multiplier)
                .min(self.max_backoff.as_millis() as f64) as u64,
        )
    }
}

/// Response body and headers we care about.
#[derive(Debug, Clone)]
pub struct BrokerResponse {
    pub status: u16,
    pub location: Option<String>,
    pub body: String,
}

#[derive(Clone)]
pub struct BrokerClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    sleep_fn: SleepFn,
    metrics: Option<ControllerMetrics>,
}

impl BrokerClient {
    pub fn new(cfg: &BrokerConfig) -> BrokerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout())
            .build()
            .map_err(|err| BrokerError::Unavailable(format!("http client: {err}")))?;
        Ok(Self {
            http,
            base_url: cfg.url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::from_config(cfg),
            sleep_fn: tokio_sleep(),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_sleep_fn(mut self, sleep_fn: SleepFn) -> Self {
        self.sleep_fn = sleep_fn;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> BrokerResult<BrokerResponse> {
        let mut req = self.http.request(method, url);
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req
            .send()
            .await
            .map_err(|err| BrokerError::Unavailable(err.to_string()))?;
        let status = resp.status();
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = resp.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(BrokerResponse {
                status: status.as_u16(),
                location,
                body: text,
            })
        } else {
            Err(BrokerError::Rejected {
                status: status.as_u16(),
                body: text,
            })
        }
    }

    /// One logical request with bounded retries on transient failures.
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> BrokerResult<BrokerResponse> {
        let url = self.url(path);
        let mut attempt: u32 = 1;
        let mut backoff = self.retry.initial_backoff;
        loop {
            match self.send_once(method.clone(), &url, body).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    if err.is_retryable() && attempt < self.retry.max_tries {
                        debug!(%method, %url, attempt, error = %err, "broker request failed; retrying");
                        attempt += 1;
                        if let Some(metrics) = self.metrics.as_ref() {
                            metrics.inc_broker_retry();
                        }
                        (self.sleep_fn)(backoff).await;
                        backoff = self.retry.next_backoff(backoff);
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// PATCH the attributes; create the entity when the broker says 404.
    pub async fn upsert(
        &self,
        entity_id: &str,
        entity_type: &str,
        attrs: Map<String, Value>,
    ) -> BrokerResult<()> {
        let patch = Value::Object(attrs.clone());
        let path = format!("/entities/{entity_id}/attrs");
        let result = match self.execute(Method::PATCH, &path, Some(&patch)).await {
            Ok(_) => Ok(()),
            Err(BrokerError::Rejected { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                debug!(entity_id, "entity missing; creating");
                let doc = ngsi::entity_document(entity_id, entity_type, &attrs);
                match self.execute(Method::POST, "/entities", Some(&doc)).await {
                    Ok(_) => Ok(()),
                    // Lost a creation race: the entity exists now, so update it.
                    Err(BrokerError::Rejected { status, .. })
                        if status == StatusCode::CONFLICT.as_u16() =>
                    {
                        self.execute(Method::PATCH, &path, Some(&patch))
                            .await
                            .map(|_| ())
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        };
        if let Some(metrics) = self.metrics.as_ref() {
            match &result {
                Ok(()) => metrics.inc_publish_ok(),
                Err(err) => {
                    metrics.inc_publish_fail();
                    metrics.inc_error(err.class());
                }
            }
        }
        result
    }

    pub async fn publish_flow(&self, flow: &TrafficFlowObserved) -> BrokerResult<()> {
        self.upsert(&flow.id, urn::TRAFFIC_FLOW, ngsi::flow_attrs(flow))
            .await
    }

    pub async fn publish_air(&self, air: &AirQualityObserved) -> BrokerResult<()> {
        self.upsert(&air.id, urn::AIR_QUALITY, ngsi::air_attrs(air)).await
    }

    /// Write `forcePhase` on the intersection's TrafficLight entity.
    pub async fn publish_force_phase(&self, tls_id: &str, phase: usize) -> BrokerResult<()> {
        let id = urn::entity_id(urn::TRAFFIC_LIGHT, tls_id);
        self.upsert(&id, urn::TRAFFIC_LIGHT, ngsi::force_phase_attrs(phase))
            .await
    }

    /// Fetch one entity; `None` when the broker does not know it.
    pub async fn get_entity(&self, entity_id: &str) -> BrokerResult<Option<Value>> {
        match self
            .execute(Method::GET, &format!("/entities/{entity_id}"), None)
            .await
        {
            Ok(resp) => serde_json::from_str(&resp.body)
                .map(Some)
                .map_err(|err| BrokerError::Decode(format!("entity {entity_id}: {err}"))),
            Err(BrokerError::Rejected { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// List entities of one type.
    pub async fn query_entities(&self, entity_type: &str) -> BrokerResult<Vec<Value>> {
        let resp = self
            .execute(Method::GET, &format!("/entities?type={entity_type}"), None)
            .await?;
        serde_json::from_str(&resp.body)
            .map_err(|err| BrokerError::Decode(format!("entity list: {err}")))
    }

    pub async fn delete_entity(&self, entity_id: &str) -> BrokerResult<()> {
        match self
            .execute(Method::DELETE, &format!("/entities/{entity_id}"), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(BrokerError::Rejected { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Post a subscription document and return its id.
    ///
    /// A 409 means the broker already holds this subscription and is
    /// reported as `ConflictingSubscription`.
    pub async fn subscribe(&self, spec: &SubscriptionSpec) -> BrokerResult<String> {
        let doc = spec.to_document();
        match self.execute(Method::POST, "/subscriptions", Some(&doc)).await {
            Ok(resp) => {
                let id = resp
                    .location
                    .as_deref()
                    .and_then(|loc| loc.rsplit('/').next())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| spec.id.clone());
                info!(subscription_id = %id, "subscription registered");
                Ok(id)
            }
            Err(BrokerError::Rejected { status, .. }) if status == StatusCode::CONFLICT.as_u16() => {
                Err(BrokerError::ConflictingSubscription {
                    id: spec.id.clone(),
                })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> BrokerResult<()> {
        match self
            .execute(
                Method::DELETE,
                &format!("/subscriptions/{subscription_id}"),
                None,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(BrokerError::Rejected { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                warn!(subscription_id, "subscription already gone");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Backoff parameters for deadline-bounded retries.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// Retry `attempt` on transient errors until it succeeds or `deadline`
/// elapses. Non-transient errors return immediately.
pub async fn retry_until<T, F, Fut>(
    deadline: Duration,
    backoff: Backoff,
    mut attempt: F,
) -> BrokerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BrokerResult<T>>,
{
    let started = tokio::time::Instant::now();
    let mut delay = backoff.initial;
    let mut tries: u32 = 0;
    loop {
        tries += 1;
        let err = match attempt().await {
            Ok(v) => return Ok(v),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => err,
        };
        let elapsed = started.elapsed();
        if elapsed >= deadline {
            warn!(tries, error = %err, "startup deadline reached");
            return Err(err);
        }
        let sleep_for = delay.min(deadline - elapsed);
        debug!(tries, error = %err, ?sleep_for, "broker not ready; retrying");
        tokio::time::sleep(sleep_for).await;
        delay = Duration::from_millis(
            ((delay.as_millis() as f64) * backoff.multiplier).min(backoff.max.as_millis() as f64)
                as u64,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_backoff: Duration::from_millis(500),
            ..RetryPolicy::default()
        };
        let b = policy.next_backoff(Duration::from_millis(200));
        assert_eq!(b, Duration::from_millis(400));
        assert_eq!(policy.next_backoff(b), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_until_gives_up_at_deadline() {
        let started = tokio::time::Instant::now();
        let mut calls = 0u32;
        let result: BrokerResult<()> =
            retry_until(Duration::from_secs(10), Backoff::default(), || {
                calls += 1;
                async { Err(BrokerError::Unavailable("refused".into())) }
            })
            .await;
        assert!(matches!(result, Err(BrokerError::Unavailable(_))));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
        assert!(calls > 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_until_stops_on_non_transient() {
        let mut calls = 0u32;
        let result: BrokerResult<()> =
            retry_until(Duration::from_secs(10), Backoff::default(), || {
                calls += 1;
                async {
                    Err(BrokerError::Rejected {
                        status: 400,
                        body: "bad".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
