//! Process-wide state, built once at startup and shared by `Arc`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::agent::{AgentLoop, ModuleInfo};
use crate::autonomy::{AutonomyGate, AutonomyStatus};
use crate::config::Config;
use crate::error::StoreError;
use crate::escalation::EscalationHub;
use crate::healer::{HealthReport, SelfHealer};
use crate::killswitch::{KillSwitch, KillSwitchState};
use crate::lane::{CriticalLane, LaneStats};
use crate::metrics::RunMetrics;
use crate::policy::PricingPolicy;
use crate::pricing::PricingEngine;
use crate::scheduler::{JobInfo, Scheduler};

pub struct AppState {
    pub config: Config,
    pub escalation: EscalationHub,
    pub gate: Arc<AutonomyGate>,
    pub lane: CriticalLane,
    pub healer: Arc<SelfHealer>,
    pub scheduler: Arc<Scheduler>,
    pub kill_switch: Arc<KillSwitch>,
    pub pricing: Arc<PricingEngine>,
    pub agent: Arc<AgentLoop>,
}

/// Everything `status` prints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub autonomy: AutonomyStatus,
    pub kill_switch: KillSwitchState,
    pub policy: PricingPolicy,
    pub lane: LaneStats,
    pub jobs: Vec<JobInfo>,
    pub modules: Vec<ModuleInfo>,
    pub health: HealthReport,
    pub metrics: RunMetrics,
}

impl AppState {
    /// Open every component against `config.state_dir`, creating it if needed.
    pub fn open(config: Config) -> Result<Self, StoreError> {
        let dir = config.state_dir.clone();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let escalation = EscalationHub::new();
        let gate = Arc::new(AutonomyGate::open(&dir, &config.autonomy));
        let lane = CriticalLane::new(config.lane.settle_delay());
        let healer = Arc::new(SelfHealer::open(&dir, config.healer.clone(), escalation.clone()));
        let scheduler = Arc::new(Scheduler::open(&dir));
        let kill_switch = Arc::new(KillSwitch::open(&dir));

        let policy = match &config.pricing.policy_path {
            Some(path) => PricingPolicy::load(path),
            None => PricingPolicy::default(),
        };
        let pricing = Arc::new(PricingEngine::new(
            &dir,
            config.pricing.clone(),
            policy,
            kill_switch.clone(),
            lane.clone(),
            healer.clone(),
            gate.clone(),
        ));
        let agent = Arc::new(AgentLoop::new(gate.clone(), healer.clone(), scheduler.clone()));

        info!(state_dir = %dir.display(), "application state opened");
        Ok(Self {
            config,
            escalation,
            gate,
            lane,
            healer,
            scheduler,
            kill_switch,
            pricing,
            agent,
        })
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            autonomy: self.gate.status(),
            kill_switch: self.kill_switch.state(),
            policy: self.pricing.policy(),
            lane: self.lane.stats(),
            jobs: self.scheduler.list_jobs(),
            modules: self.agent.modules(),
            health: self.healer.health(),
            metrics: self.agent.metrics(),
        }
    }
}
