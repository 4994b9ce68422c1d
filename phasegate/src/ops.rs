//! Operational surface: Prometheus metrics, health flags and the tiny
//! `/metrics` `/health` `/ready` server.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tiny_http::{Header, Response, Server};
use tracing::{info, warn};

use crate::error::ErrorClass;

#[derive(Debug, Clone)]
pub struct HealthState {
    healthy: Arc<AtomicBool>,
    ready: Arc<AtomicBool>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

/// Counters and gauges for one controller process. Cheap to clone; all
/// clones share the same registry.
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    ticks: IntCounter,
    advances: IntCounter,
    gate_blocked: IntCounter,
    out_of_range_actions: IntCounter,
    errors_by_class: IntCounterVec,
    notifications_received: IntCounter,
    notifications_dropped: IntCounter,
    notifications_ignored: IntCounter,
    publish_ok: IntCounter,
    publish_fail: IntCounter,
    broker_retries: IntCounter,
    current_phase: IntGauge,
    steps_in_phase: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts");
    registry
        .register(Box::new(c.clone()))
        .expect("counter registered once");
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let g = IntGauge::with_opts(Opts::new(name, help)).expect("valid gauge opts");
    registry
        .register(Box::new(g.clone()))
        .expect("gauge registered once");
    g
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let errors_by_class = IntCounterVec::new(
            Opts::new("phasegate_errors", "Errors by class"),
            &["class"],
        )
        .expect("errors by class");
        registry
            .register(Box::new(errors_by_class.clone()))
            .expect("reg errors by class");
        Self {
            ticks: counter(&registry, "phasegate_ticks", "Controller ticks"),
            advances: counter(&registry, "phasegate_advances", "Effected phase advances"),
            gate_blocked: counter(
                &registry,
                "phasegate_gate_blocked",
                "Advance requests dropped by the minimum-green gate",
            ),
            out_of_range_actions: counter(
                &registry,
                "phasegate_out_of_range_actions",
                "Actions outside the action set",
            ),
            notifications_received: counter(
                &registry,
                "phasegate_notifications_received",
                "Notifications accepted by /notify",
            ),
            notifications_dropped: counter(
                &registry,
                "phasegate_notifications_dropped",
                "Queued states dropped on overflow",
            ),
            notifications_ignored: counter(
                &registry,
                "phasegate_notifications_ignored",
                "Notifications accepted after shutdown and ignored",
            ),
            publish_ok: counter(&registry, "phasegate_publish_ok", "Broker publishes ok"),
            publish_fail: counter(&registry, "phasegate_publish_fail", "Broker publishes failed"),
            broker_retries: counter(&registry, "phasegate_broker_retries", "Broker retries"),
            current_phase: gauge(&registry, "phasegate_current_phase", "Current phase"),
            steps_in_phase: gauge(&registry, "phasegate_steps_in_phase", "Ticks in phase"),
            errors_by_class,
            registry,
        }
    }

    pub fn inc_tick(&self) {
        self.ticks.inc();
    }

    pub fn inc_advance(&self) {
        self.advances.inc();
    }

    pub fn inc_gate_blocked(&self) {
        self.gate_blocked.inc();
    }

    pub fn inc_out_of_range_action(&self) {
        self.out_of_range_actions.inc();
        self.inc_error(ErrorClass::Operational);
    }

    pub fn inc_error(&self, class: ErrorClass) {
        self.errors_by_class.with_label_values(&[class.as_str()]).inc();
    }

    pub fn inc_notification_received(&self) {
        self.notifications_received.inc();
    }

    pub fn inc_notification_dropped(&self) {
        self.notifications_dropped.inc();
    }

    pub fn inc_notification_ignored(&self) {
        self.notifications_ignored.inc();
    }

    pub fn inc_publish_ok(&self) {
        self.publish_ok.inc();
    }

    pub fn inc_publish_fail(&self) {
        self.publish_fail.inc();
    }

    pub fn inc_broker_retry(&self) {
        self.broker_retries.inc();
    }

    pub fn set_phase(&self, phase: usize, steps_in_phase: u64) {
        self.current_phase.set(phase as i64);
        self.steps_in_phase.set(steps_in_phase as i64);
    }

    pub fn advances(&self) -> u64 {
        self.advances.get()
    }

    pub fn gate_blocked(&self) -> u64 {
        self.gate_blocked.get()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.get()
    }

    pub fn notifications_received(&self) -> u64 {
        self.notifications_received.get()
    }

    pub fn notifications_dropped(&self) -> u64 {
        self.notifications_dropped.get()
    }

    pub fn notifications_ignored(&self) -> u64 {
        self.notifications_ignored.get()
    }

    pub fn broker_retries(&self) -> u64 {
        self.broker_retries.get()
    }

    pub fn errors(&self, class: ErrorClass) -> u64 {
        self.errors_by_class.with_label_values(&[class.as_str()]).get()
    }

    pub fn gather(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Serve `/metrics`, `/health` and `/ready` from a background thread.
pub fn start_ops_server(addr: &str, metrics: ControllerMetrics, health: HealthState) {
    let addr = addr.to_string();
    std::thread::spawn(move || {
        let server = match Server::http(addr.as_str()) {
            Ok(server) => server,
            Err(err) => {
                warn!(%addr, error = %err, "ops server failed to bind");
                return;
            }
        };
        info!(%addr, "ops server listening");
        let text_plain = Header::from_bytes(&b"Content-Type"[..], &b"text/plain; version=0.0.4"[..]);
        for request in server.incoming_requests() {
            let response = match request.url() {
                "/metrics" => {
                    let resp = Response::from_string(metrics.gather());
                    match text_plain.clone() {
                        Ok(header) => resp.with_header(header),
                        Err(_) => resp,
                    }
                }
                "/health" => {
                    if health.is_healthy() {
                        Response::from_string("ok")
                    } else {
                        Response::from_string("unhealthy").with_status_code(503)
                    }
                }
                "/ready" => {
                    if health.is_ready() {
                        Response::from_string("ready")
                    } else {
                        Response::from_string("not_ready").with_status_code(503)
                    }
                }
                _ => Response::from_string("not found").with_status_code(404),
            };
            let _ = request.respond(response);
        }
    });
}
