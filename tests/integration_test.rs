use async_trait::async_trait;
use commerce_autopilot::agent::ModuleRun;
use commerce_autopilot::config::Config;
use commerce_autopilot::error::OpError;
use commerce_autopilot::escalation::EscalationReason;
use commerce_autopilot::marketplace::{CompetitorOffer, CompetitorSource, MarketplaceWriter, WriteAck};
use commerce_autopilot::pricing::{ExecutionOutcome, PricingAction, Product};
use commerce_autopilot::scheduler::JobTask;
use commerce_autopilot::state::AppState;
use futures::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

/// Records writes and the highest number of writes seen in flight at once
#[derive(Default)]
struct RecordingWriter {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    prices: Mutex<Vec<(String, f64)>>,
}

#[async_trait]
impl MarketplaceWriter for RecordingWriter {
    async fn update_price(&self, sku: &str, price: f64) -> Result<WriteAck, OpError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.prices.lock().unwrap().push((sku.to_string(), price));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(WriteAck::ok())
    }

    async fn update_stock(&self, _sku: &str, _quantity: u32) -> Result<WriteAck, OpError> {
        Ok(WriteAck::ok())
    }
}

struct FixedCompetitors(Vec<CompetitorOffer>);

#[async_trait]
impl CompetitorSource for FixedCompetitors {
    async fn competitor_prices(&self, _sku: &str) -> Result<Vec<CompetitorOffer>, OpError> {
        Ok(self.0.clone())
    }
}

fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::with_state_dir(dir);
    config.lane.settle_delay_ms = 0;
    config.healer.retry_delay_ms = 1;
    config.healer.slow_retry_delay_ms = 1;
    config.healer.backoff_delay_ms = 1;
    config
}

fn product(barcode: &str, cost: f64, price: f64) -> Product {
    Product {
        barcode: barcode.to_string(),
        sku: format!("SKU-{}", barcode),
        cost,
        price,
    }
}

fn rivals(price: f64) -> FixedCompetitors {
    FixedCompetitors(vec![CompetitorOffer {
        seller: "rival".to_string(),
        price,
        stock: 25,
    }])
}

/// Pricing writes for many products never overlap
#[tokio::test]
async fn test_concurrent_pricing_writes_are_serialized() {
    let dir = tempdir().unwrap();
    let state = Arc::new(AppState::open(test_config(dir.path())).unwrap());
    let writer = Arc::new(RecordingWriter::default());

    let mut tasks = Vec::new();
    for i in 0..5 {
        let state = state.clone();
        let writer = writer.clone();
        tasks.push(tokio::spawn(async move {
            let p = product(&format!("P{}", i), 50.0, 100.0);
            state
                .pricing
                .run_for_product(&p, &rivals(90.0), writer, false)
                .await
        }));
    }
    for task in tasks {
        let record = task.await.unwrap().unwrap();
        assert_eq!(record.outcome, ExecutionOutcome::Executed);
        assert_eq!(record.decision.action, PricingAction::Decrease);
    }

    assert_eq!(writer.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(writer.prices.lock().unwrap().len(), 5);
    assert!(writer.prices.lock().unwrap().iter().all(|(_, p)| *p == 89.0));
    assert_eq!(state.lane.stats().completed, 5);
}

/// A margin breach halts every later pricing write until reset
#[tokio::test]
async fn test_kill_switch_halts_pricing_until_reset() {
    let dir = tempdir().unwrap();
    let state = AppState::open(test_config(dir.path())).unwrap();
    let tickets = Arc::new(Mutex::new(Vec::new()));
    let t = tickets.clone();
    state.escalation.subscribe(move |ticket| {
        t.lock().unwrap().push(ticket.reason);
        Ok(())
    });
    let writer = Arc::new(RecordingWriter::default());

    let record = state
        .pricing
        .run_for_product(&product("BAD", 96.0, 100.0), &rivals(90.0), writer.clone(), false)
        .await
        .unwrap();
    assert_eq!(record.decision.action, PricingAction::KillSwitch);
    assert_eq!(*tickets.lock().unwrap(), vec![EscalationReason::KillSwitch]);
    assert_eq!(state.gate.net_score(), -10);

    let record = state
        .pricing
        .run_for_product(&product("GOOD", 50.0, 100.0), &rivals(90.0), writer.clone(), false)
        .await
        .unwrap();
    assert_eq!(record.decision.action, PricingAction::Blocked);
    assert!(writer.prices.lock().unwrap().is_empty());

    state.pricing.reset_kill_switch().unwrap();
    let record = state
        .pricing
        .run_for_product(&product("GOOD", 50.0, 100.0), &rivals(90.0), writer.clone(), false)
        .await
        .unwrap();
    assert_eq!(record.decision.action, PricingAction::Decrease);
    assert_eq!(writer.prices.lock().unwrap().len(), 1);
}

/// Repeated module failures close the gate; later runs are skipped
#[tokio::test]
async fn test_failing_module_degrades_autonomy() {
    let dir = tempdir().unwrap();
    let state = AppState::open(test_config(dir.path())).unwrap();
    state
        .agent
        .register(
            "orders",
            || async { Err(OpError::from_message("order payload rejected upstream")) },
            "0 * * * *",
            true,
        )
        .unwrap();

    // -3 per failure, threshold -15: five failures still leave the gate open
    for _ in 0..5 {
        assert!(matches!(state.agent.execute("orders").await, ModuleRun::Failed { .. }));
    }
    assert_eq!(state.gate.net_score(), -15);
    assert!(state.gate.is_autonomous());

    assert!(matches!(state.agent.execute("orders").await, ModuleRun::Failed { .. }));
    assert!(!state.gate.is_autonomous());

    assert!(matches!(state.agent.execute("orders").await, ModuleRun::Skipped { .. }));
    let metrics = state.agent.metrics();
    assert_eq!(metrics.modules["orders"].runs_failed, 6);
    assert_eq!(metrics.modules["orders"].runs_skipped, 1);
    assert_eq!(state.healer.health().total_errors, 6);
}

/// Kill switch, autonomy score and job definitions survive a restart
#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempdir().unwrap();
    {
        let state = AppState::open(test_config(dir.path())).unwrap();
        state.kill_switch.trip("margin breach").unwrap();
        state.gate.record("USER_APPROVAL", "approved plan", "pricing").unwrap();
        let task: JobTask = Arc::new(|| async { Ok(()) }.boxed());
        state
            .scheduler
            .add_job("x", "0 * * * *", task, true, "msg")
            .unwrap();
    }

    let state = AppState::open(test_config(dir.path())).unwrap();
    let status = state.status();
    assert!(status.kill_switch.active);
    assert_eq!(status.autonomy.net_score, 3);
    let defs = state.scheduler.load_definitions().unwrap();
    assert_eq!(defs.len(), 1);
    assert_eq!(defs[0].name, "x");
    assert_eq!(defs[0].cron_expression, "0 * * * *");
    assert_eq!(defs[0].message, "msg");
}

/// Dry runs go through the lane without touching the marketplace
#[tokio::test]
async fn test_dry_run_pipeline() {
    let dir = tempdir().unwrap();
    let state = AppState::open(test_config(dir.path())).unwrap();
    let writer = Arc::new(RecordingWriter::default());

    let record = state
        .pricing
        .run_for_product(&product("P", 50.0, 100.0), &rivals(90.0), writer.clone(), true)
        .await
        .unwrap();
    assert_eq!(record.outcome, ExecutionOutcome::DryRun);
    assert!(writer.prices.lock().unwrap().is_empty());
    assert_eq!(state.lane.stats().skipped, 1);
    assert_eq!(state.pricing.decisions().len(), 1);
}
