// src/error.rs
//
// Error kinds for every component, plus the coarse class each one maps to.
//
// Classes decide what the caller does with a failure:
// - Transient:   retried with backoff, surfaced once the budget is spent
// - Protocol:    logged with the offending payload and skipped
// - Config:      fatal at startup
// - Operational: suppressed in the control loop and counted in metrics

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transient,
    Protocol,
    Config,
    Operational,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Protocol => "protocol",
            ErrorClass::Config => "config",
            ErrorClass::Operational => "operational",
        }
    }
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error("simulator session already running")]
    AlreadyRunning,
    #[error("no simulator session is open")]
    NotRunning,
    #[error("failed to launch simulator: {0}")]
    Launch(String),
    #[error("simulator not reachable yet: {0}")]
    NotListening(String),
    #[error("simulator protocol error: {0}")]
    Protocol(String),
    #[error("bad simulator config: {0}")]
    BadConfig(String),
    #[error("simulator i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SimError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SimError::NotListening(_) | SimError::Io(_) => ErrorClass::Transient,
            SimError::Protocol(_) => ErrorClass::Protocol,
            SimError::BadConfig(_) | SimError::Launch(_) => ErrorClass::Config,
            SimError::AlreadyRunning | SimError::NotRunning => ErrorClass::Operational,
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker refused subscription {id}: an equivalent subscription exists")]
    ConflictingSubscription { id: String },
    #[error("broker rejected request (status {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("broker payload could not be decoded: {0}")]
    Decode(String),
}

impl BrokerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BrokerError::Unavailable(_) => ErrorClass::Transient,
            BrokerError::Rejected { status, .. } if *status >= 500 || *status == 429 => {
                ErrorClass::Transient
            }
            BrokerError::Rejected { .. } | BrokerError::Decode(_) => ErrorClass::Protocol,
            BrokerError::ConflictingSubscription { .. } => ErrorClass::Operational,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("state has width {got}, policy expects {expected}")]
    StateShapeMismatch { expected: usize, got: usize },
    #[error("state component {index} is not finite ({value})")]
    NonFiniteState { index: usize, value: f64 },
    #[error("failed to load policy artifact: {0}")]
    Load(String),
}

impl PolicyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PolicyError::StateShapeMismatch { .. } | PolicyError::Load(_) => ErrorClass::Config,
            PolicyError::NonFiniteState { .. } => ErrorClass::Protocol,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid config field {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read config file {path}: {reason}")]
    File { path: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::Config
    }
}

/// Failures that stop a control or training loop.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Sim(#[from] SimError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ControlError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ControlError::Sim(e) => e.class(),
            ControlError::Broker(e) => e.class(),
            ControlError::Policy(e) => e.class(),
            ControlError::Config(e) => e.class(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_server_errors_are_retryable() {
        let err = BrokerError::Rejected {
            status: 503,
            body: "down".to_string(),
        };
        assert!(err.is_retryable());
        let err = BrokerError::Rejected {
            status: 400,
            body: "bad".to_string(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.class(), ErrorClass::Protocol);
    }

    #[test]
    fn sim_error_classes() {
        assert_eq!(SimError::NotRunning.class(), ErrorClass::Operational);
        assert_eq!(
            SimError::BadConfig("det".into()).class(),
            ErrorClass::Config
        );
        assert_eq!(
            SimError::NotListening("refused".into()).class(),
            ErrorClass::Transient
        );
    }
}
