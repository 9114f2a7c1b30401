//! Global pricing kill switch.
//!
//! A single process-wide flag. Once tripped it blocks every pricing write
//! until [`KillSwitch::reset`] is called; nothing clears it automatically,
//! including a restart, since the state is persisted to `kill_switch.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::store;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub active: bool,
    pub reason: Option<String>,
    pub tripped_at: Option<DateTime<Utc>>,
}

pub struct KillSwitch {
    path: PathBuf,
    state: Mutex<KillSwitchState>,
}

impl KillSwitch {
    pub fn open(state_dir: &Path) -> Self {
        let path = state_dir.join("kill_switch.json");
        let state = match store::read_json::<KillSwitchState>(&path) {
            Ok(Some(state)) => {
                if state.active {
                    warn!(
                        reason = state.reason.as_deref().unwrap_or(""),
                        "kill switch still active from previous run"
                    );
                }
                state
            }
            Ok(None) => KillSwitchState::default(),
            // An unreadable file must not silently re-enable pricing
            Err(e) => {
                warn!(error = %e, "kill switch state unreadable, starting tripped");
                KillSwitchState {
                    active: true,
                    reason: Some(format!("unreadable kill switch state: {}", e)),
                    tripped_at: Some(Utc::now()),
                }
            }
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Activate the switch. Returns `false` if it was already active, in
    /// which case the original reason is kept.
    pub fn trip(&self, reason: &str) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if state.active {
            return Ok(false);
        }
        *state = KillSwitchState {
            active: true,
            reason: Some(reason.to_string()),
            tripped_at: Some(Utc::now()),
        };
        warn!(reason = %reason, "KILL SWITCH tripped, pricing writes blocked");
        store::write_json_atomic(&self.path, &*state)?;
        Ok(true)
    }

    /// Manual reset; the only way back to normal pricing.
    pub fn reset(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        let was_active = state.active;
        *state = KillSwitchState::default();
        store::write_json_atomic(&self.path, &*state)?;
        if was_active {
            info!("kill switch reset");
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn state(&self) -> KillSwitchState {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KillSwitchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
