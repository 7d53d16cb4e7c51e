use std::path::PathBuf;
use std::time::Duration;

/// Invalid or missing startup configuration. Fatal when raised at startup;
/// during a live reload the previous configuration is kept instead.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {key}")]
    Missing { key: String },

    #[error("setting {key} is invalid: {reason}")]
    Invalid { key: String, reason: String },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("symbol {symbol}: {reason}")]
    Symbol { symbol: String, reason: String },

    #[error("no strategies approved in any whitelist")]
    EmptyWhitelist,
}

/// Transient failure reading the candidate signal feed; the cycle is skipped.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("failed to read signal feed {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("signal feed {} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure talking to the broker capability.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker call {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("broker rejected request (retcode {code}): {message}")]
    Rejected { code: i64, message: String },

    /// The request reached the broker but the reply could not be read.
    #[error("unreadable broker reply: {0}")]
    MalformedReply(String),
}

impl BrokerError {
    /// Timeouts and replies that never arrived intact leave the outcome unknown.
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout { .. } | BrokerError::MalformedReply(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    /// The broker does not support the requested filling mode; another mode may succeed.
    FillModeUnsupported { code: i64, message: String },
    /// Explicit refusal. Terminal for this signal.
    Rejected { code: i64, message: String },
    /// No answer was obtained before submission; nothing reached the broker.
    Unavailable(String),
    /// The order may or may not have been placed.
    Timeout,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::FillModeUnsupported { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::FillModeUnsupported { .. } => "fill_mode_unsupported",
            FailureKind::Rejected { .. } => "rejected",
            FailureKind::Unavailable(_) => "broker_unavailable",
            FailureKind::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("order submission failed ({}): {detail}", kind.label())]
pub struct SubmitFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl SubmitFailure {
    pub fn new(kind: FailureKind) -> Self {
        let detail = match &kind {
            FailureKind::FillModeUnsupported { code, message }
            | FailureKind::Rejected { code, message } => format!("retcode {} {}", code, message),
            FailureKind::Unavailable(reason) => reason.clone(),
            FailureKind::Timeout => "no response from broker".to_string(),
        };
        Self { kind, detail }
    }
}
