//! Autonomy gate: a running score over weighted outcome events that decides
//! whether modules may act without a human in the loop.
//!
//! Events are append-only and capped; scores of evicted events are not
//! subtracted back out, so `net_score` can drift from the sum of the
//! retained window once the cap is hit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::config::AutonomyConfig;
use crate::error::StoreError;
use crate::store;

/// Closed table of outcome kinds the gate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    SuccessfulUpdate,
    GoodPrediction,
    UserApproval,
    ModuleFailure,
    StockError,
    UserRejection,
    KillSwitchTrip,
    EscalatedCustomer,
}

impl OutcomeKind {
    pub fn weight(&self) -> i64 {
        match self {
            Self::SuccessfulUpdate => 1,
            Self::GoodPrediction => 2,
            Self::UserApproval => 3,
            Self::ModuleFailure => -3,
            Self::StockError => -5,
            Self::UserRejection => -3,
            Self::KillSwitchTrip => -10,
            Self::EscalatedCustomer => -4,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SUCCESSFUL_UPDATE" => Some(Self::SuccessfulUpdate),
            "GOOD_PREDICTION" => Some(Self::GoodPrediction),
            "USER_APPROVAL" => Some(Self::UserApproval),
            "MODULE_FAILURE" => Some(Self::ModuleFailure),
            "STOCK_ERROR" => Some(Self::StockError),
            "USER_REJECTION" => Some(Self::UserRejection),
            "KILL_SWITCH_TRIP" => Some(Self::KillSwitchTrip),
            "ESCALATED_CUSTOMER" => Some(Self::EscalatedCustomer),
            _ => None,
        }
    }
}

/// A single scored outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreEvent {
    pub kind: OutcomeKind,
    pub weight: i64,
    pub context: String,
    pub category: String,
    pub timestamp: DateTime<Utc>,
}

/// Persisted gate state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutonomyState {
    pub net_score: i64,
    pub events: Vec<ScoreEvent>,
    pub category_scores: HashMap<String, i64>,
    /// `Some(_)` bypasses the score entirely
    pub manual_override: Option<bool>,
}

/// Gate status summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomyStatus {
    pub autonomous: bool,
    pub net_score: i64,
    pub threshold: i64,
    pub manual_override: Option<bool>,
    pub event_count: usize,
    pub category_scores: HashMap<String, i64>,
}

pub struct AutonomyGate {
    path: PathBuf,
    threshold: i64,
    history_limit: usize,
    state: Mutex<AutonomyState>,
}

impl AutonomyGate {
    /// Open the gate, restoring `autonomy.json` from `state_dir` if present.
    pub fn open(state_dir: &Path, config: &AutonomyConfig) -> Self {
        let path = state_dir.join("autonomy.json");
        let state = match store::read_json::<AutonomyState>(&path) {
            Ok(Some(state)) => {
                info!(net_score = state.net_score, events = state.events.len(), "autonomy state restored");
                state
            }
            Ok(None) => AutonomyState::default(),
            Err(e) => {
                warn!(error = %e, "autonomy state unreadable, starting fresh");
                AutonomyState::default()
            }
        };
        Self {
            path,
            threshold: config.threshold,
            history_limit: config.history_limit,
            state: Mutex::new(state),
        }
    }

    /// Record an outcome by name. Unknown names are ignored with a warning.
    /// Returns whether an event was recorded.
    pub fn record(&self, kind: &str, context: &str, category: &str) -> Result<bool, StoreError> {
        match OutcomeKind::from_name(kind) {
            Some(kind) => self.record_kind(kind, context, category).map(|_| true),
            None => {
                warn!(kind = %kind, "unknown outcome kind ignored");
                Ok(false)
            }
        }
    }

    pub fn record_kind(
        &self,
        kind: OutcomeKind,
        context: &str,
        category: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let before = state.net_score;
        let weight = kind.weight();

        state.events.push(ScoreEvent {
            kind,
            weight,
            context: context.to_string(),
            category: category.to_string(),
            timestamp: Utc::now(),
        });
        state.net_score += weight;
        *state.category_scores.entry(category.to_string()).or_insert(0) += weight;

        if state.events.len() > self.history_limit {
            let excess = state.events.len() - self.history_limit;
            state.events.drain(..excess);
        }

        if before >= self.threshold && state.net_score < self.threshold {
            warn!(
                net_score = state.net_score,
                threshold = self.threshold,
                category = %category,
                "autonomy threshold crossed, unattended execution disabled"
            );
        }

        store::write_json_atomic(&self.path, &*state)
    }

    pub fn is_autonomous(&self) -> bool {
        let state = self.lock();
        state
            .manual_override
            .unwrap_or(state.net_score >= self.threshold)
    }

    pub fn set_autonomous_mode(&self, enabled: bool) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.manual_override = Some(enabled);
        info!(enabled, "autonomy manual override set");
        store::write_json_atomic(&self.path, &*state)
    }

    pub fn clear_override(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.manual_override = None;
        info!("autonomy manual override cleared");
        store::write_json_atomic(&self.path, &*state)
    }

    /// Zero the score and history. The manual override is kept.
    pub fn reset(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        let manual_override = state.manual_override;
        *state = AutonomyState {
            manual_override,
            ..AutonomyState::default()
        };
        info!("autonomy score reset");
        store::write_json_atomic(&self.path, &*state)
    }

    pub fn net_score(&self) -> i64 {
        self.lock().net_score
    }

    pub fn category_score(&self, category: &str) -> i64 {
        self.lock().category_scores.get(category).copied().unwrap_or(0)
    }

    pub fn events(&self) -> Vec<ScoreEvent> {
        self.lock().events.clone()
    }

    pub fn status(&self) -> AutonomyStatus {
        let state = self.lock();
        AutonomyStatus {
            autonomous: state
                .manual_override
                .unwrap_or(state.net_score >= self.threshold),
            net_score: state.net_score,
            threshold: self.threshold,
            manual_override: state.manual_override,
            event_count: state.events.len(),
            category_scores: state.category_scores.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AutonomyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
