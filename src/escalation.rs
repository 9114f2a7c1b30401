//! Hand-off of unrecoverable conditions to humans.
//!
//! Subscribers are invoked best-effort: an error or panic from one
//! subscriber is logged and does not stop delivery to the rest. Actual
//! delivery (chat, paging) lives behind the subscriber callbacks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    UnrecoverableError,
    KillSwitch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

/// Support ticket handed to every subscriber
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub reason: EscalationReason,
    pub severity: Severity,
    pub module: String,
    pub error_code: String,
    pub message: String,
    /// Ticket or product details, depending on `reason`
    #[serde(default)]
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl Escalation {
    pub fn critical(
        reason: EscalationReason,
        module: &str,
        error_code: &str,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            reason,
            severity: Severity::Critical,
            module: module.to_string(),
            error_code: error_code.to_string(),
            message: message.into(),
            details,
            timestamp: Utc::now(),
        }
    }
}

pub type Subscriber = Arc<dyn Fn(&Escalation) -> Result<(), String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct EscalationHub {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl EscalationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&Escalation) -> Result<(), String> + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(f));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Log the ticket and fan it out. Returns how many subscribers accepted it.
    pub fn escalate(&self, ticket: &Escalation) -> usize {
        error!(
            id = %ticket.id,
            reason = ?ticket.reason,
            module = %ticket.module,
            error_code = %ticket.error_code,
            message = %ticket.message,
            "ESCALATION"
        );
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut delivered = 0;
        for subscriber in subscribers {
            match panic::catch_unwind(AssertUnwindSafe(|| subscriber(ticket))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(id = %ticket.id, error = %e, "escalation subscriber failed"),
                Err(_) => warn!(id = %ticket.id, "escalation subscriber panicked"),
            }
        }
        delivered
    }
}
