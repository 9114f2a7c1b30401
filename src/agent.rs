//! Agent loop: registered modules run on cron schedules, gated by the
//! autonomy score and wrapped by the self-healer.
//!
//! A module failure never escapes the loop. It is logged, counted, and
//! recorded as a negative autonomy event against the module's category.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::autonomy::{AutonomyGate, OutcomeKind};
use crate::error::OpError;
use crate::healer::SelfHealer;
use crate::metrics::RunMetrics;
use crate::scheduler::{self, JobTask, Scheduler, SchedulerError};

pub type ModuleFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, OpError>> + Send + Sync>;

struct Module {
    cron: String,
    enabled: bool,
    run: ModuleFn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub cron: String,
    pub enabled: bool,
}

/// Result of one module execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModuleRun {
    Skipped { reason: String },
    Completed { duration_ms: u64, result: Value },
    Failed { duration_ms: u64, code: String, error: String },
}

pub struct AgentLoop {
    gate: Arc<AutonomyGate>,
    healer: Arc<SelfHealer>,
    scheduler: Arc<Scheduler>,
    modules: Mutex<BTreeMap<String, Module>>,
    metrics: Mutex<RunMetrics>,
}

impl AgentLoop {
    pub fn new(gate: Arc<AutonomyGate>, healer: Arc<SelfHealer>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            gate,
            healer,
            scheduler,
            modules: Mutex::new(BTreeMap::new()),
            metrics: Mutex::new(RunMetrics::new()),
        }
    }

    /// Register (or replace) a module. The cron expression is validated now.
    pub fn register<F, Fut>(&self, name: &str, run: F, cron: &str, enabled: bool) -> Result<(), SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, OpError>> + Send + 'static,
    {
        scheduler::parse_cron(cron)?;
        let run: ModuleFn = Arc::new(move || run().boxed());
        self.lock_modules().insert(
            name.to_string(),
            Module {
                cron: cron.to_string(),
                enabled,
                run,
            },
        );
        info!(module = %name, cron = %cron, enabled, "module registered");
        Ok(())
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.lock_modules()
            .iter()
            .map(|(name, m)| ModuleInfo {
                name: name.clone(),
                cron: m.cron.clone(),
                enabled: m.enabled,
            })
            .collect()
    }

    /// Schedule every enabled module. Returns how many jobs were created.
    pub fn start(self: &Arc<Self>) -> Result<usize, SchedulerError> {
        let enabled: Vec<(String, String)> = self
            .lock_modules()
            .iter()
            .filter(|(_, m)| m.enabled)
            .map(|(name, m)| (name.clone(), m.cron.clone()))
            .collect();

        for (name, cron) in &enabled {
            let task = self.job_task(name);
            self.scheduler
                .add_job(name, cron, task, true, &format!("agent module {}", name))?;
        }
        info!(modules = enabled.len(), "agent loop started");
        Ok(enabled.len())
    }

    /// Execute one module immediately, outside its schedule.
    pub async fn execute(&self, name: &str) -> ModuleRun {
        let run = self.lock_modules().get(name).map(|m| m.run.clone());
        let run = match run {
            Some(run) => run,
            None => {
                warn!(module = %name, "execution requested for unknown module");
                return ModuleRun::Skipped {
                    reason: format!("unknown module {}", name),
                };
            }
        };

        if !self.gate.is_autonomous() {
            warn!(module = %name, net_score = self.gate.net_score(), "autonomy disabled, skipping run");
            self.lock_metrics().module(name).record_skip();
            return ModuleRun::Skipped {
                reason: "autonomy disabled".to_string(),
            };
        }

        let started_at = Utc::now();
        let snapshot_name = format!("{}-{}", name, started_at.format("%Y%m%dT%H%M%S%3f"));
        let snapshot_state = serde_json::json!({
            "module": name,
            "started_at": started_at,
        });

        let started = Instant::now();
        let result = self
            .healer
            .with_healing(name, || run(), Some((snapshot_name.as_str(), snapshot_state)))
            .await;
        let elapsed = started.elapsed();
        let duration_ms = elapsed.as_millis() as u64;

        match result {
            Ok(recovery) => {
                info!(module = %name, duration_ms, "module completed");
                self.lock_metrics().module(name).record_success(elapsed);
                self.record(OutcomeKind::SuccessfulUpdate, "module completed", name);
                ModuleRun::Completed {
                    duration_ms,
                    result: recovery.into_value(),
                }
            }
            Err(e) => {
                error!(module = %name, duration_ms, error = %e, "module failed");
                self.lock_metrics().module(name).record_failure(elapsed);
                self.record(OutcomeKind::ModuleFailure, &e.to_string(), name);
                ModuleRun::Failed {
                    duration_ms,
                    code: e.code().to_string(),
                    error: e.message,
                }
            }
        }
    }

    pub fn metrics(&self) -> RunMetrics {
        self.lock_metrics().clone()
    }

    fn record(&self, kind: OutcomeKind, context: &str, module: &str) {
        if let Err(e) = self.gate.record_kind(kind, context, module) {
            warn!(module = %module, error = %e, "failed to record autonomy event");
        }
    }

    // Weak: the scheduler's task map must not keep the agent alive.
    fn job_task(self: &Arc<Self>, name: &str) -> JobTask {
        let agent: Weak<Self> = Arc::downgrade(self);
        let name = name.to_string();
        Arc::new(move || {
            let agent = agent.clone();
            let name = name.clone();
            async move {
                if let Some(agent) = agent.upgrade() {
                    agent.execute(&name).await;
                }
                Ok(())
            }
            .boxed()
        })
    }

    fn lock_modules(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Module>> {
        self.modules.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, RunMetrics> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }
}
