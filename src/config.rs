use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::pricing::Product;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding every persisted state document
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub autonomy: AutonomyConfig,

    #[serde(default)]
    pub lane: LaneConfig,

    #[serde(default)]
    pub healer: HealerConfig,

    #[serde(default)]
    pub pricing: PricingConfig,

    /// Marketplace gateway; the pricing module is only wired when set
    #[serde(default)]
    pub marketplace: Option<MarketplaceConfig>,

    #[serde(default)]
    pub planner: PlannerConfig,

    /// Agent loop modules (name, cron, enabled)
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomyConfig {
    /// Net score below which unattended execution stops
    #[serde(default = "default_threshold")]
    pub threshold: i64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Pause after each settlement before the next task starts
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealerConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_slow_retry_delay_ms")]
    pub slow_retry_delay_ms: u64,
    #[serde(default = "default_backoff_delay_ms")]
    pub backoff_delay_ms: u64,
    #[serde(default = "default_error_log_limit")]
    pub error_log_limit: usize,
    /// Snapshot files kept on disk; oldest by timestamp are evicted
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Free-text brand policy document
    #[serde(default)]
    pub policy_path: Option<PathBuf>,
    #[serde(default = "default_decision_log_limit")]
    pub decision_log_limit: usize,
    /// Price moves smaller than this are treated as no-ops
    #[serde(default = "default_min_price_change")]
    pub min_price_change: f64,
    #[serde(default = "default_low_stock_units")]
    pub low_stock_units: u32,
    #[serde(default = "default_scarcity_ratio")]
    pub scarcity_ratio: f64,
    /// Route writes through the lane without calling the marketplace
    #[serde(default)]
    pub dry_run: bool,
    /// Catalog evaluated by the scheduled pricing module
    #[serde(default)]
    pub products: Vec<Product>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceConfig {
    pub base_url: String,
    /// Sent as a bearer token
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

/// Prompt for the scheduled planning module. Endpoint and key come from
/// `PLANNER_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_planner_prompt")]
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default = "default_planner_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    pub cron: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_threshold() -> i64 {
    -15
}

fn default_history_limit() -> usize {
    500
}

fn default_settle_delay_ms() -> u64 {
    50
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_slow_retry_delay_ms() -> u64 {
    5_000
}

fn default_backoff_delay_ms() -> u64 {
    30_000
}

fn default_error_log_limit() -> usize {
    500
}

fn default_max_snapshots() -> usize {
    50
}

fn default_decision_log_limit() -> usize {
    200
}

fn default_min_price_change() -> f64 {
    1.0
}

fn default_low_stock_units() -> u32 {
    5
}

fn default_scarcity_ratio() -> f64 {
    0.7
}

fn default_enabled() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_planner_prompt() -> String {
    "Review the recent pricing decisions below and propose the next actions for the catalog.".to_string()
}

fn default_planner_max_tokens() -> u32 {
    1024
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            history_limit: default_history_limit(),
        }
    }
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl LaneConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            slow_retry_delay_ms: default_slow_retry_delay_ms(),
            backoff_delay_ms: default_backoff_delay_ms(),
            error_log_limit: default_error_log_limit(),
            max_snapshots: default_max_snapshots(),
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            policy_path: None,
            decision_log_limit: default_decision_log_limit(),
            min_price_change: default_min_price_change(),
            low_stock_units: default_low_stock_units(),
            scarcity_ratio: default_scarcity_ratio(),
            dry_run: false,
            products: Vec::new(),
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            prompt: default_planner_prompt(),
            system: None,
            max_tokens: default_planner_max_tokens(),
        }
    }
}

impl MarketplaceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            autonomy: AutonomyConfig::default(),
            lane: LaneConfig::default(),
            healer: HealerConfig::default(),
            pricing: PricingConfig::default(),
            marketplace: None,
            planner: PlannerConfig::default(),
            modules: vec![ModuleConfig {
                name: "health".to_string(),
                cron: "*/5 * * * *".to_string(),
                enabled: true,
            }],
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        info!(
            state_dir = %config.state_dir.display(),
            modules = config.modules.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Default configuration rooted at a specific state directory
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.state_dir, PathBuf::from("state"));
        assert_eq!(config.autonomy.threshold, -15);
        assert_eq!(config.lane.settle_delay_ms, 50);
        assert_eq!(config.healer.backoff_delay_ms, 30_000);
        assert_eq!(config.pricing.decision_log_limit, 200);
        assert!(config.modules.is_empty());
        assert!(config.marketplace.is_none());
        assert!(!config.pricing.dry_run);
        assert_eq!(config.planner.max_tokens, 1024);
    }

    #[test]
    fn test_catalog_and_marketplace() {
        let config = Config::from_toml(
            r#"
            [pricing]
            dry_run = true

            [[pricing.products]]
            barcode = "8690000000011"
            sku = "MUG-01"
            cost = 40.0
            price = 79.9

            [marketplace]
            base_url = "https://gateway.example.com/api"
            api_key = "secret"

            [planner]
            prompt = "plan the week"
            "#,
        )
        .unwrap();

        assert!(config.pricing.dry_run);
        assert_eq!(config.pricing.products.len(), 1);
        assert_eq!(config.pricing.products[0].sku, "MUG-01");
        assert_eq!(config.pricing.decision_log_limit, 200);
        let marketplace = config.marketplace.unwrap();
        assert_eq!(marketplace.api_key.as_deref(), Some("secret"));
        assert_eq!(marketplace.timeout(), Duration::from_secs(30));
        assert_eq!(config.planner.prompt, "plan the week");
        assert!(config.planner.system.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
            state_dir = "/var/lib/autopilot"

            [lane]
            settle_delay_ms = 10

            [[modules]]
            name = "pricing"
            cron = "0 * * * *"

            [[modules]]
            name = "orders"
            cron = "*/15 * * * *"
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.state_dir, PathBuf::from("/var/lib/autopilot"));
        assert_eq!(config.lane.settle_delay(), Duration::from_millis(10));
        assert_eq!(config.healer.max_attempts, 3);
        assert_eq!(config.modules.len(), 2);
        assert!(config.modules[0].enabled);
        assert!(!config.modules[1].enabled);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            Config::from_toml("state_dir = ["),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::from_file("/nonexistent/autopilot.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
