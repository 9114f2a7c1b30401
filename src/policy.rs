//! Brand pricing policy, parsed from a human-edited text document.
//!
//! The document is free text. Lines mentioning a minimum margin, a maximum
//! discount or a kill switch contribute the first number found on them;
//! strategy is picked by keyword. Anything missing or out of range keeps
//! its default.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Aggressive,
    Smart,
    Conservative,
}

impl Strategy {
    /// Amount subtracted from the cheapest competitor price
    pub fn undercut(&self) -> f64 {
        match self {
            Self::Aggressive => 2.0,
            Self::Smart => 1.0,
            Self::Conservative => 0.0,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Aggressive => "aggressive",
            Self::Smart => "smart",
            Self::Conservative => "conservative",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingPolicy {
    pub min_margin_pct: f64,
    pub max_discount_pct: f64,
    pub kill_switch_margin_pct: f64,
    pub strategy: Strategy,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            min_margin_pct: 15.0,
            max_discount_pct: 30.0,
            kill_switch_margin_pct: 5.0,
            strategy: Strategy::Smart,
        }
    }
}

impl PricingPolicy {
    /// Load from a file; an unreadable file yields the defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "policy unreadable, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut policy = Self::default();

        for line in text.lines() {
            let lower = line.to_lowercase();
            let value = match first_number(&lower) {
                Some(v) => v,
                None => continue,
            };
            // kill switch lines usually also mention "margin", check them first
            if lower.contains("kill") {
                set_pct(&mut policy.kill_switch_margin_pct, value, "kill_switch_margin_pct");
            } else if lower.contains("margin") && lower.contains("min") {
                set_pct(&mut policy.min_margin_pct, value, "min_margin_pct");
            } else if lower.contains("discount") && lower.contains("max") {
                set_pct(&mut policy.max_discount_pct, value, "max_discount_pct");
            }
        }

        let lower = text.to_lowercase();
        if lower.contains("aggressive") {
            policy.strategy = Strategy::Aggressive;
        } else if lower.contains("conservative") {
            policy.strategy = Strategy::Conservative;
        }

        if policy.kill_switch_margin_pct > policy.min_margin_pct {
            warn!(
                kill_switch = policy.kill_switch_margin_pct,
                min_margin = policy.min_margin_pct,
                "kill switch margin above minimum margin, using defaults for both"
            );
            let defaults = Self::default();
            policy.kill_switch_margin_pct = defaults.kill_switch_margin_pct;
            policy.min_margin_pct = defaults.min_margin_pct;
        }

        debug!(?policy, "pricing policy parsed");
        policy
    }
}

fn set_pct(field: &mut f64, value: f64, name: &str) {
    if (0.0..100.0).contains(&value) {
        *field = value;
    } else {
        warn!(field = name, value, "policy value out of range, ignored");
    }
}

/// First decimal number in `s`, e.g. `12.5` from "min margin: 12.5%".
fn first_number(s: &str) -> Option<f64> {
    let start = s.find(|c: char| c.is_ascii_digit())?;
    let rest = &s[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    rest[..end].trim_end_matches('.').parse().ok()
}
