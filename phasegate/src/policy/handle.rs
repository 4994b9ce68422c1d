// src/policy/handle.rs
//
// Shared policy handle. Callers clone the inner `Arc` per evaluation, so a
// reload swaps the pointer while in-flight evaluations finish on the old
// predictor.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use super::{Policy, QNetPolicy, QueueThresholdPolicy, RandomPolicy};
use crate::config::{FallbackKind, PolicyConfig};
use crate::error::PolicyError;

pub struct PolicyHandle {
    inner: RwLock<Arc<dyn Policy>>,
    fallback: AtomicBool,
}

impl std::fmt::Debug for PolicyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyHandle")
            .field("fallback", &self.fallback.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PolicyHandle {
    pub fn new(policy: Arc<dyn Policy>) -> Self {
        Self {
            inner: RwLock::new(policy),
            fallback: AtomicBool::new(false),
        }
    }

    fn fallback_policy(cfg: &PolicyConfig, num_detectors: usize, num_phases: usize) -> Arc<dyn Policy> {
        let width = num_detectors + 2;
        match cfg.fallback {
            FallbackKind::Random => Arc::new(RandomPolicy::new(width, cfg.seed)),
            FallbackKind::Rule => Arc::new(QueueThresholdPolicy::new(num_detectors, num_phases)),
        }
    }

    /// Load the configured artifact.
    ///
    /// A missing or unreadable artifact degrades to the fallback predictor
    /// when `random_fallback` is set and is fatal otherwise. An artifact
    /// built for a different state width is always fatal.
    pub fn load(
        cfg: &PolicyConfig,
        num_detectors: usize,
        num_phases: usize,
    ) -> Result<Self, PolicyError> {
        let width = num_detectors + 2;
        let loaded = match cfg.artifact_path.as_deref() {
            Some(path) => QNetPolicy::load(path),
            None => Err(PolicyError::Load("no artifact path configured".to_string())),
        };
        match loaded {
            Ok(policy) => {
                if policy.state_width() != width {
                    return Err(PolicyError::StateShapeMismatch {
                        expected: width,
                        got: policy.state_width(),
                    });
                }
                info!(
                    artifact = ?cfg.artifact_path,
                    version = policy.version(),
                    "policy artifact loaded"
                );
                Ok(Self::new(Arc::new(policy)))
            }
            Err(err) if cfg.random_fallback => {
                let fallback = Self::fallback_policy(cfg, num_detectors, num_phases);
                warn!(
                    error = %err,
                    fallback = fallback.version(),
                    "policy artifact unavailable; using fallback"
                );
                let handle = Self::new(fallback);
                handle.set_fallback(true);
                Ok(handle)
            }
            Err(err) => Err(err),
        }
    }

    fn set_fallback(&self, value: bool) {
        self.fallback.store(value, Ordering::Release);
    }

    /// True while a fallback predictor stands in for the artifact.
    pub fn is_fallback(&self) -> bool {
        self.fallback.load(Ordering::Acquire)
    }

    /// Snapshot of the current predictor.
    pub fn current(&self) -> Arc<dyn Policy> {
        match self.inner.read() {
            Ok(g) => Arc::clone(&*g),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    pub fn state_width(&self) -> usize {
        self.current().state_width()
    }

    pub fn act(&self, state: &[f64]) -> Result<usize, PolicyError> {
        self.current().act(state)
    }

    pub fn scores(&self, state: &[f64]) -> Result<Vec<f64>, PolicyError> {
        self.current().scores(state)
    }

    /// Swap in a new predictor of the same width.
    pub fn swap(&self, policy: Arc<dyn Policy>) -> Result<(), PolicyError> {
        let expected = self.state_width();
        if policy.state_width() != expected {
            return Err(PolicyError::StateShapeMismatch {
                expected,
                got: policy.state_width(),
            });
        }
        match self.inner.write() {
            Ok(mut g) => *g = policy,
            Err(poisoned) => *poisoned.into_inner() = policy,
        }
        self.set_fallback(false);
        Ok(())
    }

    /// Load a new artifact from `path` and swap it in. The current predictor
    /// stays in place on failure.
    pub fn reload(&self, path: &Path) -> Result<(), PolicyError> {
        let policy = QNetPolicy::load(path)?;
        self.swap(Arc::new(policy))?;
        info!(artifact = %path.display(), "policy artifact reloaded");
        Ok(())
    }
}
