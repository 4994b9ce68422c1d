// src/broker/notify.rs
//
// Notification intake: a tiny_http endpoint on its own thread feeding a
// bounded drop-oldest queue that the controller consumes.
//
// `/notify` always answers 200, whatever happens to the payload, so the
// broker never retries into a stampede. After `stop_accepting` the endpoint
// keeps answering 200 but hands nothing to the controller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tiny_http::{Method, Response, Server};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::ngsi::{self, PartialState};
use crate::error::{BrokerError, ErrorClass};
use crate::ops::ControllerMetrics;

/// Bounded FIFO between the HTTP thread and the controller. On overflow the
/// oldest pending state is discarded.
pub struct StateQueue {
    inner: Mutex<VecDeque<PartialState>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    metrics: Option<ControllerMetrics>,
}

impl StateQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Enqueue without blocking. Returns true when an older state was dropped.
    pub fn push(&self, state: PartialState) -> bool {
        let dropped = {
            let mut q = match self.inner.lock() {
                Ok(q) => q,
                Err(poisoned) => poisoned.into_inner(),
            };
            let dropped = if q.len() >= self.capacity {
                q.pop_front();
                true
            } else {
                false
            };
            q.push_back(state);
            dropped
        };
        if dropped {
            if let Some(m) = self.metrics.as_ref() {
                m.inc_notification_dropped();
            }
        }
        self.notify.notify_one();
        dropped
    }

    pub fn try_pop(&self) -> Option<PartialState> {
        match self.inner.lock() {
            Ok(mut q) => q.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(q) => q.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next state; `None` once closed and drained.
    pub async fn recv(&self) -> Option<PartialState> {
        loop {
            if let Some(s) = self.try_pop() {
                return Some(s);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Discard everything still pending; returns how many were dropped.
    pub fn clear(&self) -> usize {
        match self.inner.lock() {
            Ok(mut q) => q.drain(..).count(),
            Err(poisoned) => poisoned.into_inner().drain(..).count(),
        }
    }
}

pub struct NotificationServer {
    server: Arc<Server>,
    accepting: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    port: u16,
}

impl NotificationServer {
    /// Bind `addr` (e.g. `0.0.0.0:8090`, or port 0 for an ephemeral port)
    /// and start serving `/notify`.
    pub fn start(
        addr: &str,
        queue: Arc<StateQueue>,
        metrics: ControllerMetrics,
    ) -> Result<Self, BrokerError> {
        let server = Server::http(addr)
            .map_err(|err| BrokerError::Unavailable(format!("bind {addr}: {err}")))?;
        let port = server
            .server_addr()
            .to_ip()
            .map(|a| a.port())
            .unwrap_or_default();
        let server = Arc::new(server);
        let accepting = Arc::new(AtomicBool::new(true));

        let thread_server = Arc::clone(&server);
        let thread_accepting = Arc::clone(&accepting);
        let handle = std::thread::Builder::new()
            .name("phasegate-notify".to_string())
            .spawn(move || serve(thread_server, thread_accepting, queue, metrics))
            .map_err(|err| BrokerError::Unavailable(format!("notify thread: {err}")))?;

        info!(%addr, port, "notification endpoint listening");
        Ok(Self {
            server,
            accepting,
            handle: Some(handle),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Keep answering 200 but stop forwarding to the controller.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Stop the HTTP thread and wait for it.
    pub fn shutdown(mut self) {
        self.stop_accepting();
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        debug!(port = self.port, "notification endpoint stopped");
    }
}

fn serve(
    server: Arc<Server>,
    accepting: Arc<AtomicBool>,
    queue: Arc<StateQueue>,
    metrics: ControllerMetrics,
) {
    for mut request in server.incoming_requests() {
        let path = request.url().split('?').next().unwrap_or_default().to_string();
        if path != "/notify" {
            let _ = request.respond(Response::from_string("not found").with_status_code(404));
            continue;
        }
        if *request.method() != Method::Post {
            let _ = request.respond(Response::from_string("method not allowed").with_status_code(405));
            continue;
        }

        let mut body = Vec::new();
        let read = request.as_reader().read_to_end(&mut body);

        if !accepting.load(Ordering::Acquire) {
            metrics.inc_notification_ignored();
            let _ = request.respond(Response::from_string("ignored"));
            continue;
        }

        match read {
            Ok(_) => handle_body(&body, &queue, &metrics),
            Err(err) => {
                metrics.inc_error(ErrorClass::Transient);
                warn!(error = %err, "failed to read notification body");
            }
        }
        let _ = request.respond(Response::from_string("ok"));
    }
}

fn handle_body(body: &[u8], queue: &StateQueue, metrics: &ControllerMetrics) {
    let (states, skipped) = match ngsi::parse_notification(body) {
        Ok(parsed) => parsed,
        Err(err) => {
            metrics.inc_error(err.class());
            warn!(
                error = %err,
                payload = %String::from_utf8_lossy(body),
                "malformed notification"
            );
            return;
        }
    };
    metrics.inc_notification_received();
    for err in skipped {
        metrics.inc_error(err.class());
        warn!(error = %err, "skipping undecodable entity");
    }

    // One merged state per intersection per notification, so flow and air
    // entities delivered together count as a single observation.
    let mut merged: Vec<(String, PartialState)> = Vec::new();
    for state in states {
        let bad = state.malformed_attrs();
        if !bad.is_empty() {
            metrics.inc_error(ErrorClass::Protocol);
            warn!(entity = %state.entity_id, attrs = ?bad, "malformed attributes in notification");
        }
        let Some(tls) = state.tls_id().map(str::to_string) else {
            metrics.inc_error(ErrorClass::Protocol);
            warn!(entity = %state.entity_id, "entity id does not carry an intersection id");
            continue;
        };
        match merged.iter_mut().find(|(t, _)| *t == tls) {
            Some((_, acc)) => acc.merge(state),
            None => merged.push((tls, state)),
        }
    }
    for (_, state) in merged {
        queue.push(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: &str) -> PartialState {
        PartialState {
            entity_id: id.to_string(),
            ..PartialState::default()
        }
    }

    #[test]
    fn overflow_drops_oldest() {
        let metrics = ControllerMetrics::new();
        let q = StateQueue::new(2).with_metrics(metrics.clone());
        assert!(!q.push(state("a")));
        assert!(!q.push(state("b")));
        assert!(q.push(state("c")));
        assert_eq!(q.try_pop().map(|s| s.entity_id), Some("b".to_string()));
        assert_eq!(q.try_pop().map(|s| s.entity_id), Some("c".to_string()));
        assert!(q.try_pop().is_none());
        assert_eq!(metrics.notifications_dropped(), 1);
    }

    #[tokio::test]
    async fn recv_wakes_on_push_and_ends_on_close() {
        let q = Arc::new(StateQueue::new(4));
        let producer = Arc::clone(&q);
        let task = tokio::spawn(async move {
            producer.push(state("x"));
            producer.close();
        });
        assert_eq!(q.recv().await.map(|s| s.entity_id), Some("x".to_string()));
        assert!(q.recv().await.is_none());
        task.await.expect("producer");
    }

    #[test]
    fn entities_of_one_intersection_are_merged() {
        let metrics = ControllerMetrics::new();
        let q = StateQueue::new(4);
        let body = serde_json::json!({
            "subscriptionId": "s",
            "data": [
                {"id": "urn:ngsi-ld:TrafficFlowObserved:J1", "queues": [3, 5], "phase": 0},
                {"id": "urn:ngsi-ld:AirQualityObserved:J1", "pm25": 12.0}
            ]
        });
        handle_body(body.to_string().as_bytes(), &q, &metrics);
        assert_eq!(q.len(), 1);
        let s = q.try_pop().expect("merged state");
        assert_eq!(s.pm25, ngsi::Observed::Present(12.0));
        assert_eq!(metrics.notifications_received(), 1);
    }

    #[test]
    fn malformed_body_is_counted_not_queued() {
        let metrics = ControllerMetrics::new();
        let q = StateQueue::new(4);
        handle_body(b"{oops", &q, &metrics);
        assert!(q.is_empty());
        assert_eq!(metrics.errors(ErrorClass::Protocol), 1);
    }
}
