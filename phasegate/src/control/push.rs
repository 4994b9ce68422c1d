// src/control/push.rs
//
// Push-mode wiring around the controller: the notification endpoint, its
// queue, and the broker subscription that feeds it.
//
// Shutdown order:
// 1. stop forwarding notifications (the endpoint keeps answering 200)
// 2. close and clear the queue so the controller stops within one state
// 3. delete the subscription, best-effort
// 4. keep the endpoint up for the grace period, then stop it

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::broker::{BrokerClient, NotificationServer, StateQueue, SubscriptionManager, SubscriptionSpec};
use crate::config::Config;
use crate::error::ControlError;
use crate::ops::ControllerMetrics;

pub struct PushRuntime {
    server: NotificationServer,
    queue: Arc<StateQueue>,
    subscription: SubscriptionManager,
    grace: Duration,
}

impl PushRuntime {
    /// Bind the endpoint, then register the subscription, retrying until
    /// the configured startup deadline.
    pub async fn start(
        cfg: &Config,
        client: BrokerClient,
        metrics: ControllerMetrics,
    ) -> Result<Self, ControlError> {
        let queue = Arc::new(StateQueue::new(cfg.broker.queue_capacity).with_metrics(metrics.clone()));
        let addr = format!("{}:{}", cfg.broker.notify_bind, cfg.broker.notify_port);
        let server = NotificationServer::start(&addr, Arc::clone(&queue), metrics)?;

        let notify_uri = format!("http://{}:{}/notify", cfg.broker.notify_host, server.port());
        let spec = SubscriptionSpec::controller(&cfg.intersection.tls_id, &notify_uri);
        let subscription = SubscriptionManager::new(client, spec);
        if let Err(err) = subscription.bootstrap(cfg.broker.startup_deadline()).await {
            server.shutdown();
            return Err(err.into());
        }

        Ok(Self {
            server,
            queue,
            subscription,
            grace: cfg.broker.shutdown_grace(),
        })
    }

    pub fn queue(&self) -> &Arc<StateQueue> {
        &self.queue
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn subscription(&self) -> &SubscriptionManager {
        &self.subscription
    }

    pub async fn shutdown(self) {
        self.server.stop_accepting();
        self.queue.close();
        let discarded = self.queue.clear();
        self.subscription.shutdown().await;
        info!(discarded, grace_ms = self.grace.as_millis() as u64, "notification intake stopped");
        if !self.grace.is_zero() {
            tokio::time::sleep(self.grace).await;
        }
        self.server.shutdown();
    }
}
