// src/control/assembler.rs
//
// Push-mode state assembly: folds notified partial states into full policy
// states for one intersection.
//
// A decision is due only when a notification carries queues. Air-quality
// only updates refresh the cached pm25 that later queue updates reuse. The
// phase always comes from the phase lock, not from the notification.

use chrono::{DateTime, FixedOffset};
use tracing::debug;

use crate::broker::ngsi::{Observed, PartialState};
use crate::types::{clamp_non_negative, StateVector};

#[derive(Debug, Clone, PartialEq)]
pub enum Assembled {
    /// A complete state; run the controller on it.
    Ready(StateVector),
    /// Cache refreshed, nothing to decide.
    Cached,
    /// Observation window older than one already consumed.
    Stale,
    /// Entity belongs to another intersection.
    Foreign(String),
    /// Queue vector could not be used.
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct StateAssembler {
    tls_id: String,
    num_detectors: usize,
    last_pm25: f64,
    last_observed_to: Option<DateTime<FixedOffset>>,
}

impl StateAssembler {
    pub fn new(tls_id: impl Into<String>, num_detectors: usize) -> Self {
        Self {
            tls_id: tls_id.into(),
            num_detectors,
            last_pm25: 0.0,
            last_observed_to: None,
        }
    }

    pub fn last_pm25(&self) -> f64 {
        self.last_pm25
    }

    pub fn absorb(&mut self, partial: PartialState, phase: usize) -> Assembled {
        match partial.tls_id() {
            Some(tls) if tls == self.tls_id => {}
            other => return Assembled::Foreign(other.unwrap_or_default().to_string()),
        }

        if let Some(raw) = partial.observed_to.as_deref() {
            if let Ok(to) = DateTime::parse_from_rfc3339(raw) {
                if self.last_observed_to.is_some_and(|last| to < last) {
                    debug!(entity = %partial.entity_id, observed_to = raw, "stale observation");
                    return Assembled::Stale;
                }
                self.last_observed_to = Some(to);
            }
        }

        if let Observed::Present(pm25) = partial.pm25 {
            self.last_pm25 = clamp_non_negative(pm25);
        }

        match partial.queues {
            Observed::Present(queues) if queues.len() == self.num_detectors => {
                Assembled::Ready(StateVector::new(queues, phase, self.last_pm25))
            }
            Observed::Present(queues) => Assembled::Invalid(format!(
                "expected {} queues, got {}",
                self.num_detectors,
                queues.len()
            )),
            Observed::Malformed(raw) => Assembled::Invalid(format!("malformed queues: {raw}")),
            Observed::Missing => Assembled::Cached,
        }
    }
}
