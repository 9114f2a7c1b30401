//! Pricing decision engine.
//!
//! `decide` is a pure function of the product, the competitor offers, the
//! policy and the global kill switch. Writes happen only in
//! `execute_decision`, through the critical lane, wrapped by the self-healer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::autonomy::{AutonomyGate, OutcomeKind};
use crate::config::PricingConfig;
use crate::error::OpError;
use crate::escalation::{Escalation, EscalationReason};
use crate::healer::{Recovery, SelfHealer};
use crate::killswitch::{KillSwitch, KillSwitchState};
use crate::lane::{CriticalLane, EnqueueOptions, LaneError, Settled};
use crate::marketplace::{CompetitorOffer, CompetitorSource, MarketplaceWriter};
use crate::policy::{PricingPolicy, Strategy};
use crate::store;

const MODULE: &str = "pricing";
const BLOCKED_KEY: &str = "blocked_by_kill_switch";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub barcode: String,
    pub sku: String,
    pub cost: f64,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PricingAction {
    Hold,
    Increase,
    Decrease,
    KillSwitch,
    Blocked,
}

impl PricingAction {
    /// Only price changes reach the marketplace
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Increase | Self::Decrease)
    }
}

impl fmt::Display for PricingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Hold => "HOLD",
            Self::Increase => "INCREASE",
            Self::Decrease => "DECREASE",
            Self::KillSwitch => "KILL_SWITCH",
            Self::Blocked => "BLOCKED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingDecision {
    pub barcode: String,
    pub old_price: f64,
    pub action: PricingAction,
    pub new_price: f64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl PricingDecision {
    fn new(product: &Product, action: PricingAction, new_price: f64, reason: String) -> Self {
        Self {
            barcode: product.barcode.clone(),
            old_price: product.price,
            action,
            new_price,
            reason,
            timestamp: Utc::now(),
        }
    }

    fn hold(product: &Product, reason: String) -> Self {
        Self::new(product, PricingAction::Hold, product.price, reason)
    }

    /// Human-readable lane label
    pub fn summary(&self) -> String {
        format!(
            "{} {} {:.2} -> {:.2}",
            self.action, self.barcode, self.old_price, self.new_price
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// No write was attempted
    Logged,
    Executed,
    /// The write failed on malformed data and the last snapshot was restored
    RolledBack,
    DryRun,
    Failed,
}

/// Entry in the decision log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision: PricingDecision,
    pub outcome: ExecutionOutcome,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PricingError {
    #[error("competitor prices unavailable: {0}")]
    Competitors(OpError),
    #[error(transparent)]
    Lane(#[from] LaneError),
}

pub struct PricingEngine {
    config: PricingConfig,
    policy: RwLock<PricingPolicy>,
    kill_switch: Arc<KillSwitch>,
    lane: CriticalLane,
    healer: Arc<SelfHealer>,
    gate: Arc<AutonomyGate>,
    log_path: PathBuf,
    decisions: Mutex<VecDeque<DecisionRecord>>,
}

impl PricingEngine {
    pub fn new(
        state_dir: &Path,
        config: PricingConfig,
        policy: PricingPolicy,
        kill_switch: Arc<KillSwitch>,
        lane: CriticalLane,
        healer: Arc<SelfHealer>,
        gate: Arc<AutonomyGate>,
    ) -> Self {
        let log_path = state_dir.join("pricing_decisions.json");
        let decisions = match store::read_json::<VecDeque<DecisionRecord>>(&log_path) {
            Ok(Some(d)) => d,
            Ok(None) => VecDeque::new(),
            Err(e) => {
                warn!(error = %e, "decision log unreadable, starting empty");
                VecDeque::new()
            }
        };
        info!(strategy = %policy.strategy, min_margin = policy.min_margin_pct, "pricing engine ready");
        Self {
            config,
            policy: RwLock::new(policy),
            kill_switch,
            lane,
            healer,
            gate,
            log_path,
            decisions: Mutex::new(decisions),
        }
    }

    pub fn policy(&self) -> PricingPolicy {
        self.policy.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_policy(&self, policy: PricingPolicy) {
        info!(?policy, "pricing policy replaced");
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    pub fn kill_switch_state(&self) -> KillSwitchState {
        self.kill_switch.state()
    }

    pub fn reset_kill_switch(&self) -> Result<(), crate::error::StoreError> {
        self.kill_switch.reset()
    }

    /// Decide what to do with one product's price.
    pub fn decide(&self, product: &Product, competitors: &[CompetitorOffer]) -> PricingDecision {
        let policy = self.policy();

        if self.kill_switch.is_active() {
            return PricingDecision::new(
                product,
                PricingAction::Blocked,
                product.price,
                "kill switch active, pricing writes blocked".to_string(),
            );
        }

        let margin = if product.price > 0.0 {
            (product.price - product.cost) / product.price * 100.0
        } else {
            f64::NEG_INFINITY
        };
        if margin < policy.kill_switch_margin_pct {
            let reason = format!(
                "margin {:.1}% below kill switch threshold {:.1}% on {}",
                margin, policy.kill_switch_margin_pct, product.barcode
            );
            self.trip_kill_switch(product, &reason);
            return PricingDecision::new(product, PricingAction::KillSwitch, product.price, reason);
        }

        let floor = product.cost * (1.0 + policy.min_margin_pct / 100.0);
        let active: Vec<&CompetitorOffer> = competitors.iter().filter(|c| c.stock > 0).collect();

        if active.is_empty() {
            return match policy.strategy {
                Strategy::Aggressive => PricingDecision::new(
                    product,
                    PricingAction::Increase,
                    (product.price * 1.10).round(),
                    "no active competitors, probing +10%".to_string(),
                ),
                _ => PricingDecision::hold(product, "no active competitors".to_string()),
            };
        }

        let low_stock = active
            .iter()
            .filter(|c| c.stock < self.config.low_stock_units)
            .count();
        let low_stock_ratio = low_stock as f64 / active.len() as f64;
        if low_stock_ratio >= self.config.scarcity_ratio {
            // raising is never unsafe relative to the floor
            return PricingDecision::new(
                product,
                PricingAction::Increase,
                (product.price * 1.05).round(),
                format!("competitor stock scarce ({:.0}% low), +5%", low_stock_ratio * 100.0),
            );
        }

        let cheapest = active
            .iter()
            .map(|c| c.price)
            .fold(f64::INFINITY, f64::min);
        let target = cheapest - policy.strategy.undercut();
        let rounded = target.round();

        if target < floor || rounded < floor {
            return PricingDecision::hold(
                product,
                format!("target {:.2} below floor {:.2}", target, floor),
            );
        }
        if (rounded - product.price).abs() < self.config.min_price_change {
            return PricingDecision::hold(product, "already at target".to_string());
        }
        if rounded < product.price {
            let discount = (product.price - rounded) / product.price * 100.0;
            if discount > policy.max_discount_pct {
                return PricingDecision::hold(
                    product,
                    format!(
                        "discount {:.1}% exceeds max {:.1}%",
                        discount, policy.max_discount_pct
                    ),
                );
            }
        }

        let action = if rounded > product.price {
            PricingAction::Increase
        } else {
            PricingAction::Decrease
        };
        PricingDecision::new(
            product,
            action,
            rounded,
            format!(
                "cheapest active competitor {:.2}, {} undercut {:.0}",
                cheapest,
                policy.strategy,
                policy.strategy.undercut()
            ),
        )
    }

    /// Carry out a decision. Non-write actions are only logged. Price changes
    /// are serialized through the critical lane with `write_op` wrapped by the
    /// self-healer; a lane failure is surfaced after being logged.
    pub async fn execute_decision<F, Fut>(
        &self,
        product: &Product,
        decision: PricingDecision,
        write_op: F,
        dry_run: bool,
    ) -> Result<DecisionRecord, LaneError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, OpError>> + Send + 'static,
    {
        if !decision.action.is_write() {
            info!(
                barcode = %decision.barcode,
                action = %decision.action,
                reason = %decision.reason,
                "pricing decision, no write"
            );
            return Ok(self.append(DecisionRecord {
                decision,
                outcome: ExecutionOutcome::Logged,
                result: None,
                error: None,
            }));
        }

        // The switch may have tripped since the decision was made
        if self.kill_switch.is_active() {
            warn!(barcode = %decision.barcode, "kill switch tripped before write, blocking");
            return Ok(self.append(Self::blocked(decision)));
        }

        let healer = self.healer.clone();
        let kill_switch = self.kill_switch.clone();
        let snapshot_name = format!("pricing-{}", product.barcode);
        let snapshot_state = serde_json::json!({
            "barcode": product.barcode,
            "sku": product.sku,
            "cost": product.cost,
            "price": product.price,
        });

        let handle = self.lane.enqueue(
            decision.summary(),
            EnqueueOptions::dry_run(dry_run),
            move || async move {
                // Re-checked at the head of the lane: a trip while queued wins
                if kill_switch.is_active() {
                    return Ok(serde_json::json!({ BLOCKED_KEY: true }));
                }
                healer
                    .with_healing(MODULE, write_op, Some((snapshot_name.as_str(), snapshot_state)))
                    .await
                    .map(Recovery::into_value)
            },
        );

        match handle.await {
            Ok(settled) => {
                let outcome = match &settled {
                    Settled::Completed(v) if v[BLOCKED_KEY] == true => {
                        warn!(barcode = %decision.barcode, "kill switch tripped while queued, write blocked");
                        return Ok(self.append(Self::blocked(decision)));
                    }
                    Settled::Completed(v) if v["rolled_back"] == true => {
                        warn!(
                            barcode = %decision.barcode,
                            snapshot = %v["snapshot"],
                            "pricing write rolled back to snapshot"
                        );
                        ExecutionOutcome::RolledBack
                    }
                    Settled::Completed(_) => ExecutionOutcome::Executed,
                    Settled::Skipped { .. } => ExecutionOutcome::DryRun,
                };
                info!(
                    barcode = %decision.barcode,
                    action = %decision.action,
                    new_price = decision.new_price,
                    outcome = ?outcome,
                    "pricing decision settled"
                );
                Ok(self.append(DecisionRecord {
                    decision,
                    outcome,
                    result: Some(settled.to_json()),
                    error: None,
                }))
            }
            Err(e) => {
                error!(barcode = %decision.barcode, error = %e, "pricing write failed");
                self.append(DecisionRecord {
                    decision,
                    outcome: ExecutionOutcome::Failed,
                    result: None,
                    error: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    /// Fetch competitor offers, decide, and execute against `writer`.
    pub async fn run_for_product(
        &self,
        product: &Product,
        source: &dyn CompetitorSource,
        writer: Arc<dyn MarketplaceWriter>,
        dry_run: bool,
    ) -> Result<DecisionRecord, PricingError> {
        let competitors = source
            .competitor_prices(&product.sku)
            .await
            .map_err(PricingError::Competitors)?;
        let decision = self.decide(product, &competitors);

        let sku = product.sku.clone();
        let price = decision.new_price;
        let write_op = move || {
            let writer = writer.clone();
            let sku = sku.clone();
            async move { writer.update_price(&sku, price).await?.into_result() }
        };
        Ok(self.execute_decision(product, decision, write_op, dry_run).await?)
    }

    /// Most recent decisions, oldest first.
    pub fn decisions(&self) -> Vec<DecisionRecord> {
        self.lock_decisions().iter().cloned().collect()
    }

    fn blocked(decision: PricingDecision) -> DecisionRecord {
        DecisionRecord {
            decision: PricingDecision {
                action: PricingAction::Blocked,
                new_price: decision.old_price,
                reason: "kill switch active, pricing writes blocked".to_string(),
                ..decision
            },
            outcome: ExecutionOutcome::Logged,
            result: None,
            error: None,
        }
    }

    fn trip_kill_switch(&self, product: &Product, reason: &str) {
        let newly_tripped = match self.kill_switch.trip(reason) {
            Ok(tripped) => tripped,
            Err(e) => {
                warn!(error = %e, "kill switch state not persisted");
                true
            }
        };
        if !newly_tripped {
            return;
        }

        let ticket = Escalation::critical(
            EscalationReason::KillSwitch,
            MODULE,
            "KILL_SWITCH",
            reason,
            serde_json::to_value(product).unwrap_or(Value::Null),
        );
        self.healer.escalation().escalate(&ticket);

        if let Err(e) = self
            .gate
            .record_kind(OutcomeKind::KillSwitchTrip, reason, MODULE)
        {
            warn!(error = %e, "failed to record kill switch trip");
        }
    }

    fn append(&self, record: DecisionRecord) -> DecisionRecord {
        let mut decisions = self.lock_decisions();
        decisions.push_back(record.clone());
        while decisions.len() > self.config.decision_log_limit {
            decisions.pop_front();
        }
        if let Err(e) = store::write_json_atomic(&self.log_path, &*decisions) {
            warn!(error = %e, "failed to persist decision log");
        }
        record
    }

    fn lock_decisions(&self) -> std::sync::MutexGuard<'_, VecDeque<DecisionRecord>> {
        self.decisions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
