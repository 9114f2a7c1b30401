use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Counters for one agent module
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleMetrics {
    pub runs_total: u64,
    pub runs_success: u64,
    pub runs_failed: u64,
    pub runs_skipped: u64,
    pub last_duration_ms: Option<u64>,
    pub last_run: Option<DateTime<Utc>>,
}

impl ModuleMetrics {
    pub fn record_success(&mut self, duration: Duration) {
        self.runs_total += 1;
        self.runs_success += 1;
        self.finish(duration);
    }

    pub fn record_failure(&mut self, duration: Duration) {
        self.runs_total += 1;
        self.runs_failed += 1;
        self.finish(duration);
    }

    /// Skipped runs never executed, so they carry no duration
    pub fn record_skip(&mut self) {
        self.runs_total += 1;
        self.runs_skipped += 1;
        self.last_run = Some(Utc::now());
    }

    /// Success rate over executed (not skipped) runs, as a percentage
    pub fn success_rate(&self) -> f64 {
        let executed = self.runs_success + self.runs_failed;
        if executed == 0 {
            return 100.0;
        }
        (self.runs_success as f64 / executed as f64) * 100.0
    }

    fn finish(&mut self, duration: Duration) {
        self.last_duration_ms = Some(duration.as_millis() as u64);
        self.last_run = Some(Utc::now());
    }
}

/// Agent loop metrics, per module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub started_at: DateTime<Utc>,
    pub modules: BTreeMap<String, ModuleMetrics>,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            modules: BTreeMap::new(),
        }
    }
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module(&mut self, name: &str) -> &mut ModuleMetrics {
        self.modules.entry(name.to_string()).or_default()
    }

    pub fn uptime_sec(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    /// Sum across modules. `last_*` fields come from the most recent run.
    pub fn totals(&self) -> ModuleMetrics {
        let mut total = ModuleMetrics::default();
        for m in self.modules.values() {
            total.runs_total += m.runs_total;
            total.runs_success += m.runs_success;
            total.runs_failed += m.runs_failed;
            total.runs_skipped += m.runs_skipped;
            if m.last_run > total.last_run {
                total.last_run = m.last_run;
                total.last_duration_ms = m.last_duration_ms;
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_counters() {
        let mut metrics = RunMetrics::new();
        metrics.module("pricing").record_success(Duration::from_millis(40));
        metrics.module("pricing").record_failure(Duration::from_millis(10));
        metrics.module("pricing").record_skip();

        let m = &metrics.modules["pricing"];
        assert_eq!(m.runs_total, 3);
        assert_eq!(m.runs_success, 1);
        assert_eq!(m.runs_failed, 1);
        assert_eq!(m.runs_skipped, 1);
        assert_eq!(m.last_duration_ms, Some(10));
        assert_eq!(m.success_rate(), 50.0);
    }

    #[test]
    fn test_success_rate_empty() {
        let m = ModuleMetrics::default();
        assert_eq!(m.success_rate(), 100.0);
    }

    #[test]
    fn test_totals() {
        let mut metrics = RunMetrics::new();
        metrics.module("a").record_success(Duration::from_millis(1));
        metrics.module("b").record_failure(Duration::from_millis(2));
        metrics.module("b").record_skip();

        let t = metrics.totals();
        assert_eq!(t.runs_total, 3);
        assert_eq!(t.runs_success, 1);
        assert_eq!(t.runs_failed, 1);
        assert_eq!(t.runs_skipped, 1);
        assert!(t.last_run.is_some());
    }

    #[test]
    fn test_serialization() {
        let mut metrics = RunMetrics::new();
        metrics.module("health").record_success(Duration::from_millis(5));
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["modules"]["health"]["runs_success"], 1);
    }
}
