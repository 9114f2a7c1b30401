//! Self-healer: wraps fallible operations, classifies their failures and
//! applies a bounded remediation.
//!
//! The healer only swallows an error it actually remediated. Anything else
//! is handed back to the caller unchanged, and unclassified failures are
//! escalated to humans.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::HealerConfig;
use crate::error::{FailureKind, OpError};
use crate::escalation::{Escalation, EscalationHub, EscalationReason};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::store;

/// Remediation applied to a classified failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealStrategy {
    Retry,
    RetryDelay,
    Backoff,
    RefreshToken,
    Rollback,
    Inspect,
}

impl HealStrategy {
    /// `None` means the failure is unfixable and must be escalated.
    pub fn for_kind(kind: FailureKind) -> Option<Self> {
        match kind {
            FailureKind::Timeout | FailureKind::ConnectionReset | FailureKind::ConnectionRefused => {
                Some(Self::Retry)
            }
            FailureKind::ServerError => Some(Self::RetryDelay),
            FailureKind::RateLimited => Some(Self::Backoff),
            FailureKind::Unauthorized | FailureKind::Forbidden => Some(Self::RefreshToken),
            FailureKind::MalformedData => Some(Self::Rollback),
            FailureKind::BadRequest => Some(Self::Inspect),
            FailureKind::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealAction {
    Retried,
    RetryExhausted,
    RolledBack,
    NoSnapshot,
    Inspect,
    Escalated,
}

#[derive(Debug, Clone)]
pub struct HealOutcome<T> {
    pub healed: bool,
    pub action: HealAction,
    pub strategy: Option<HealStrategy>,
    pub attempts: u32,
    /// Result of a successful retry
    pub value: Option<T>,
    /// State to restore after a rollback; re-applying it is the caller's job
    pub snapshot: Option<Snapshot>,
    pub hint: Option<String>,
}

impl<T> HealOutcome<T> {
    fn failed(action: HealAction, strategy: Option<HealStrategy>, attempts: u32) -> Self {
        Self {
            healed: false,
            action,
            strategy,
            attempts,
            value: None,
            snapshot: None,
            hint: None,
        }
    }

    fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// What `with_healing` produced
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery<T> {
    Completed(T),
    RolledBack(Snapshot),
}

impl Recovery<Value> {
    pub fn into_value(self) -> Value {
        match self {
            Recovery::Completed(v) => v,
            Recovery::RolledBack(snapshot) => serde_json::json!({
                "rolled_back": true,
                "snapshot": snapshot.name,
                "state": snapshot.state,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub module: String,
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub total_errors: usize,
    pub by_module: HashMap<String, usize>,
    pub by_code: HashMap<String, usize>,
    pub recent: Vec<ErrorRecord>,
}

pub struct SelfHealer {
    config: HealerConfig,
    snapshots: SnapshotStore,
    errors_path: PathBuf,
    errors: Mutex<VecDeque<ErrorRecord>>,
    escalation: EscalationHub,
}

impl SelfHealer {
    pub fn open(state_dir: &Path, config: HealerConfig, escalation: EscalationHub) -> Self {
        let errors_path = state_dir.join("errors.json");
        let errors = match store::read_json::<VecDeque<ErrorRecord>>(&errors_path) {
            Ok(Some(errors)) => errors,
            Ok(None) => VecDeque::new(),
            Err(e) => {
                warn!(error = %e, "error log unreadable, starting fresh");
                VecDeque::new()
            }
        };
        Self {
            snapshots: SnapshotStore::new(state_dir, config.max_snapshots),
            config,
            errors_path,
            errors: Mutex::new(errors),
            escalation,
        }
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn escalation(&self) -> &EscalationHub {
        &self.escalation
    }

    /// Try to remediate `error`. `retry` re-runs the failed operation and is
    /// only invoked for retrying strategies.
    pub async fn heal<T, F, Fut>(&self, error: &OpError, module: &str, retry: F) -> HealOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OpError>>,
    {
        self.log_error(module, error);

        let strategy = match HealStrategy::for_kind(error.kind) {
            Some(s) => s,
            None => {
                self.escalate(module, error);
                return HealOutcome::failed(HealAction::Escalated, None, 0)
                    .with_hint("unclassified failure escalated for manual review");
            }
        };
        info!(module = %module, code = %error.code(), strategy = ?strategy, "healing");

        match strategy {
            HealStrategy::Retry => self.retry_loop(module, strategy, self.config.retry_delay_ms, retry).await,
            HealStrategy::RetryDelay => {
                self.retry_loop(module, strategy, self.config.slow_retry_delay_ms, retry).await
            }
            HealStrategy::Backoff => {
                self.retry_loop(module, strategy, self.config.backoff_delay_ms, retry).await
            }
            HealStrategy::RefreshToken => {
                warn!(module = %module, "credentials rejected, token refresh required before retry");
                self.retry_loop(module, strategy, self.config.retry_delay_ms, retry).await
            }
            HealStrategy::Rollback => match self.snapshots.latest() {
                Some(snapshot) => {
                    info!(module = %module, snapshot = %snapshot.name, "rolling back to snapshot");
                    HealOutcome {
                        healed: true,
                        action: HealAction::RolledBack,
                        strategy: Some(strategy),
                        attempts: 0,
                        value: None,
                        snapshot: Some(snapshot),
                        hint: None,
                    }
                }
                None => {
                    warn!(module = %module, "rollback requested but no snapshot exists");
                    HealOutcome::failed(HealAction::NoSnapshot, Some(strategy), 0)
                        .with_hint("malformed data and no snapshot to roll back to")
                }
            },
            HealStrategy::Inspect => HealOutcome::failed(HealAction::Inspect, Some(strategy), 0)
                .with_hint(format!(
                    "request rejected as malformed ({}); check the payload before resending",
                    error.message
                )),
        }
    }

    /// Run `operation`, healing on failure. Optionally saves a snapshot
    /// first. Returns the original error if healing did not succeed.
    pub async fn with_healing<T, F, Fut>(
        &self,
        module: &str,
        mut operation: F,
        snapshot: Option<(&str, Value)>,
    ) -> Result<Recovery<T>, OpError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OpError>>,
    {
        if let Some((name, state)) = snapshot {
            if let Err(e) = self.snapshots.save(name, state) {
                warn!(module = %module, snapshot = %name, error = %e, "snapshot failed, continuing");
            }
        }

        let err = match operation().await {
            Ok(v) => return Ok(Recovery::Completed(v)),
            Err(e) => e,
        };

        let outcome = self.heal(&err, module, &mut operation).await;
        match outcome {
            HealOutcome {
                healed: true,
                value: Some(v),
                ..
            } => Ok(Recovery::Completed(v)),
            HealOutcome {
                healed: true,
                snapshot: Some(s),
                ..
            } => Ok(Recovery::RolledBack(s)),
            other => {
                warn!(
                    module = %module,
                    action = ?other.action,
                    hint = other.hint.as_deref().unwrap_or(""),
                    "healing failed, surfacing original error"
                );
                Err(err)
            }
        }
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.lock_errors().iter().cloned().collect()
    }

    pub fn health(&self) -> HealthReport {
        let errors = self.lock_errors();
        let mut by_module = HashMap::new();
        let mut by_code = HashMap::new();
        for record in errors.iter() {
            *by_module.entry(record.module.clone()).or_insert(0) += 1;
            *by_code.entry(record.code.clone()).or_insert(0) += 1;
        }
        HealthReport {
            total_errors: errors.len(),
            by_module,
            by_code,
            recent: errors.iter().rev().take(10).cloned().collect(),
        }
    }

    async fn retry_loop<T, F, Fut>(
        &self,
        module: &str,
        strategy: HealStrategy,
        base_delay_ms: u64,
        mut retry: F,
    ) -> HealOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OpError>>,
    {
        let max = self.config.max_attempts;
        for attempt in 1..=max {
            let delay = Duration::from_millis(base_delay_ms.saturating_mul(attempt as u64));
            tokio::time::sleep(delay).await;
            match retry().await {
                Ok(v) => {
                    info!(module = %module, attempt, "healed by retry");
                    return HealOutcome {
                        healed: true,
                        action: HealAction::Retried,
                        strategy: Some(strategy),
                        attempts: attempt,
                        value: Some(v),
                        snapshot: None,
                        hint: None,
                    };
                }
                Err(e) => {
                    warn!(module = %module, attempt, max, error = %e, "retry failed");
                }
            }
        }
        error!(module = %module, attempts = max, "retries exhausted");
        HealOutcome::failed(HealAction::RetryExhausted, Some(strategy), max)
    }

    fn escalate(&self, module: &str, error: &OpError) {
        let ticket = Escalation::critical(
            EscalationReason::UnrecoverableError,
            module,
            error.code(),
            error.message.clone(),
            serde_json::json!({"status": error.status}),
        );
        self.escalation.escalate(&ticket);
    }

    fn log_error(&self, module: &str, error: &OpError) {
        let mut errors = self.lock_errors();
        errors.push_back(ErrorRecord {
            module: module.to_string(),
            code: error.code().to_string(),
            message: error.message.clone(),
            timestamp: Utc::now(),
        });
        while errors.len() > self.config.error_log_limit {
            errors.pop_front();
        }
        if let Err(e) = store::write_json_atomic(&self.errors_path, &*errors) {
            warn!(error = %e, "failed to persist error log");
        }
    }

    fn lock_errors(&self) -> std::sync::MutexGuard<'_, VecDeque<ErrorRecord>> {
        self.errors.lock().unwrap_or_else(|e| e.into_inner())
    }
}
