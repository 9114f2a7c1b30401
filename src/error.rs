//! Error taxonomy shared by every write path.
//!
//! Adapters convert raw transport failures into an [`OpError`] exactly once,
//! at the call boundary. Everything downstream (the self-healer, the agent
//! loop) matches on [`FailureKind`] instead of re-parsing message text.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of failure signatures the self-healer knows how to treat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ConnectionReset,
    ConnectionRefused,
    Unauthorized,
    Forbidden,
    BadRequest,
    RateLimited,
    ServerError,
    MalformedData,
    Unknown,
}

impl FailureKind {
    /// Classify a raw failure. Status code wins over error code, which wins
    /// over message patterns. Anything unmatched is `Unknown`.
    pub fn classify(status: Option<u16>, code: Option<&str>, message: &str) -> Self {
        if let Some(kind) = status.and_then(Self::from_status) {
            return kind;
        }
        if let Some(kind) = code.and_then(Self::from_code) {
            return kind;
        }
        Self::from_message(message)
    }

    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            400 | 422 => Some(Self::BadRequest),
            401 => Some(Self::Unauthorized),
            403 => Some(Self::Forbidden),
            408 => Some(Self::Timeout),
            429 => Some(Self::RateLimited),
            500..=599 => Some(Self::ServerError),
            _ => None,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_ascii_uppercase().as_str() {
            "ETIMEDOUT" | "ESOCKETTIMEDOUT" | "ECONNABORTED" => Some(Self::Timeout),
            "ECONNRESET" | "EPIPE" => Some(Self::ConnectionReset),
            "ECONNREFUSED" => Some(Self::ConnectionRefused),
            _ => None,
        }
    }

    pub fn from_message(message: &str) -> Self {
        let msg = message.to_ascii_lowercase();
        if msg.contains("timed out") || msg.contains("timeout") {
            Self::Timeout
        } else if msg.contains("connection reset") || msg.contains("socket hang up") {
            Self::ConnectionReset
        } else if msg.contains("connection refused") {
            Self::ConnectionRefused
        } else if msg.contains("unexpected token")
            || msg.contains("invalid json")
            || msg.contains("malformed")
            || msg.contains("parse error")
        {
            Self::MalformedData
        } else {
            Self::Unknown
        }
    }

    /// Stable code used in error records and escalation tickets.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::ConnectionReset => "CONNECTION_RESET",
            Self::ConnectionRefused => "CONNECTION_REFUSED",
            Self::Unauthorized => "HTTP_401",
            Self::Forbidden => "HTTP_403",
            Self::BadRequest => "HTTP_400",
            Self::RateLimited => "HTTP_429",
            Self::ServerError => "HTTP_5XX",
            Self::MalformedData => "MALFORMED_DATA",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A classified failure from an external operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OpError {
    pub kind: FailureKind,
    pub message: String,
    pub status: Option<u16>,
}

impl OpError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    /// Failure carrying an HTTP status code.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: FailureKind::classify(Some(status), None, &message),
            message,
            status: Some(status),
        }
    }

    /// Failure carrying a socket-level error code such as `ECONNRESET`.
    pub fn with_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: FailureKind::classify(None, Some(code), &message),
            message,
            status: None,
        }
    }

    /// Failure known only by its message; falls back to pattern matching.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: FailureKind::from_message(&message),
            message,
            status: None,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

impl From<reqwest::Error> for OpError {
    fn from(e: reqwest::Error) -> Self {
        let message = e.to_string();
        if let Some(status) = e.status() {
            return Self::http(status.as_u16(), message);
        }
        let kind = if e.is_timeout() {
            FailureKind::Timeout
        } else if e.is_connect() {
            FailureKind::ConnectionRefused
        } else if e.is_decode() {
            FailureKind::MalformedData
        } else {
            FailureKind::from_message(&message)
        };
        Self::new(kind, message)
    }
}

impl From<serde_json::Error> for OpError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(FailureKind::MalformedData, e.to_string())
    }
}

/// Errors from the on-disk state documents.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error on {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
