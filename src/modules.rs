//! Handlers behind the module names listed in `[[modules]]`.
//!
//! A configured name without a handler, or whose adapters are missing, is
//! logged and left unregistered.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{Config, PlannerConfig};
use crate::error::OpError;
use crate::lane::LaneError;
use crate::marketplace::{CompetitorSource, HttpMarketplace, MarketplaceWriter};
use crate::planner::{LlmPlanner, PlanOptions, Planner};
use crate::pricing::{PricingEngine, PricingError, Product};
use crate::scheduler::SchedulerError;
use crate::state::AppState;

type ModuleFuture = BoxFuture<'static, Result<Value, OpError>>;

/// External collaborators the module handlers call into
#[derive(Clone, Default)]
pub struct Adapters {
    pub competitors: Option<Arc<dyn CompetitorSource>>,
    pub writer: Option<Arc<dyn MarketplaceWriter>>,
    pub planner: Option<Arc<dyn Planner>>,
}

impl Adapters {
    /// Marketplace from `[marketplace]`, planner from `PLANNER_*` variables.
    pub fn from_config(config: &Config) -> Result<Self, OpError> {
        let mut adapters = Self::default();
        if let Some(marketplace) = &config.marketplace {
            let http = Arc::new(HttpMarketplace::new(marketplace)?);
            adapters.competitors = Some(http.clone());
            adapters.writer = Some(http);
        }
        if let Some(planner) = LlmPlanner::from_env() {
            adapters.planner = Some(Arc::new(planner));
        }
        Ok(adapters)
    }
}

/// Attach handlers to the configured module names. Returns how many were registered.
pub fn register_modules(state: &AppState, adapters: &Adapters) -> Result<usize, SchedulerError> {
    let mut registered = 0;
    for module in &state.config.modules {
        let name = module.name.as_str();
        let (cron, enabled) = (module.cron.as_str(), module.enabled);
        match name {
            "health" => {
                state.agent.register(name, health_module(state), cron, enabled)?;
            }
            "pricing" => {
                let (Some(competitors), Some(writer)) = (&adapters.competitors, &adapters.writer) else {
                    warn!(module = %name, "pricing module needs a [marketplace] section, ignored");
                    continue;
                };
                if state.config.pricing.products.is_empty() {
                    warn!(module = %name, "no products configured for pricing, ignored");
                    continue;
                }
                let run = pricing_module(
                    state.pricing.clone(),
                    state.config.pricing.products.clone(),
                    competitors.clone(),
                    writer.clone(),
                    state.config.pricing.dry_run,
                );
                state.agent.register(name, run, cron, enabled)?;
            }
            "plan" => {
                let Some(planner) = &adapters.planner else {
                    warn!(module = %name, "planning module needs PLANNER_BASE_URL and PLANNER_API_KEY, ignored");
                    continue;
                };
                let run = planning_module(
                    planner.clone(),
                    state.pricing.clone(),
                    state.config.planner.clone(),
                );
                state.agent.register(name, run, cron, enabled)?;
            }
            other => {
                warn!(module = %other, "no handler for configured module, ignored");
                continue;
            }
        }
        registered += 1;
    }
    info!(registered, "modules registered");
    Ok(registered)
}

fn health_module(state: &AppState) -> impl Fn() -> ModuleFuture + Send + Sync + 'static {
    let healer = state.healer.clone();
    let lane = state.lane.clone();
    move || {
        let report = healer.health();
        let stats = lane.stats();
        async move {
            Ok(serde_json::json!({
                "total_errors": report.total_errors,
                "by_code": report.by_code,
                "lane": stats,
            }))
        }
        .boxed()
    }
}

/// One pass over the catalog. Every product is attempted; the pass fails
/// with the first write failure after all products were tried.
pub fn pricing_module(
    engine: Arc<PricingEngine>,
    products: Vec<Product>,
    competitors: Arc<dyn CompetitorSource>,
    writer: Arc<dyn MarketplaceWriter>,
    dry_run: bool,
) -> impl Fn() -> ModuleFuture + Send + Sync + 'static {
    let products = Arc::new(products);
    move || {
        let engine = engine.clone();
        let products = products.clone();
        let competitors = competitors.clone();
        let writer = writer.clone();
        async move { pricing_pass(&engine, &products, competitors.as_ref(), writer, dry_run).await }
            .boxed()
    }
}

async fn pricing_pass(
    engine: &PricingEngine,
    products: &[Product],
    competitors: &dyn CompetitorSource,
    writer: Arc<dyn MarketplaceWriter>,
    dry_run: bool,
) -> Result<Value, OpError> {
    let mut actions: BTreeMap<String, usize> = BTreeMap::new();
    let mut outcomes: BTreeMap<String, usize> = BTreeMap::new();
    let mut unavailable = 0;
    let mut failures: Vec<OpError> = Vec::new();

    for product in products {
        match engine
            .run_for_product(product, competitors, writer.clone(), dry_run)
            .await
        {
            Ok(record) => {
                *actions.entry(record.decision.action.to_string()).or_default() += 1;
                let outcome = serde_json::to_value(record.outcome)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                *outcomes.entry(outcome).or_default() += 1;
            }
            Err(PricingError::Competitors(e)) => {
                warn!(barcode = %product.barcode, error = %e, "competitor prices unavailable, product skipped");
                unavailable += 1;
            }
            Err(PricingError::Lane(LaneError::Operation(e))) => failures.push(e),
            Err(PricingError::Lane(e)) => failures.push(OpError::from_message(e.to_string())),
        }
    }

    let failed = failures.len();
    if let Some(first) = failures.into_iter().next() {
        return Err(OpError {
            message: format!(
                "{} of {} pricing writes failed, first: {}",
                failed,
                products.len(),
                first.message
            ),
            ..first
        });
    }
    Ok(serde_json::json!({
        "products": products.len(),
        "actions": actions,
        "outcomes": outcomes,
        "unavailable": unavailable,
    }))
}

/// Ask the planner for next actions, given the recent decision log.
pub fn planning_module(
    planner: Arc<dyn Planner>,
    engine: Arc<PricingEngine>,
    config: PlannerConfig,
) -> impl Fn() -> ModuleFuture + Send + Sync + 'static {
    let options = PlanOptions {
        system: config.system.clone(),
        max_tokens: config.max_tokens,
    };
    move || {
        let planner = planner.clone();
        let options = options.clone();
        let prompt = planning_prompt(&config.prompt, &engine);
        async move {
            let plan = planner.plan(&prompt, &options).await?;
            Ok(serde_json::json!({ "plan": plan }))
        }
        .boxed()
    }
}

fn planning_prompt(base: &str, engine: &PricingEngine) -> String {
    let decisions = engine.decisions();
    let mut prompt = format!("{}\n\nKill switch active: {}\n", base, engine.kill_switch_state().active);
    if decisions.is_empty() {
        prompt.push_str("No pricing decisions recorded yet.\n");
        return prompt;
    }
    prompt.push_str("Recent pricing decisions:\n");
    for record in decisions.iter().rev().take(20) {
        prompt.push_str(&format!(
            "- {} ({:?}): {}\n",
            record.decision.summary(),
            record.outcome,
            record.decision.reason
        ));
    }
    prompt
}
