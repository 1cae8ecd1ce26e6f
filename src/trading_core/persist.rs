//! Engine state persisted across restarts
//!
//! Only daily figures and recovery mode survive a restart. Cycles do not:
//! the broker's open positions are the source of truth for legs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::limiter::DailyLimitState;
use super::recovery::RecoveryState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub daily: DailyLimitState,
    pub recovery: RecoveryState,
    pub saved_at: DateTime<Utc>,
}

impl EngineSnapshot {
    /// Write as JSON through a temporary file so a crash never leaves half a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// `Ok(None)` when there is no state file yet
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let snapshot: Self =
            serde_json::from_str(&json).with_context(|| format!("Failed to parse state file {}", path.display()))?;

        info!("Loaded engine state saved at {}", snapshot.saved_at);
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("rangeflow-state-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_missing_file_is_none() {
        assert!(EngineSnapshot::load(&temp_path()).unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_path();
        let mut daily = DailyLimitState::new(1_800.0, true);
        daily.day_key = NaiveDate::from_ymd_opt(2024, 3, 1);
        daily.profit_accumulated = 250.0;
        let snapshot = EngineSnapshot {
            daily,
            recovery: RecoveryState {
                active: true,
                entry_loss_reference: 80.0,
                target_recovery_amount: 80.0,
                recovered_amount: 12.5,
                started_at: Some(Utc::now()),
                ..Default::default()
            },
            saved_at: Utc::now(),
        };

        snapshot.save(&path).unwrap();
        let loaded = EngineSnapshot::load(&path).unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let path = temp_path();
        std::fs::write(&path, "{ not json").unwrap();
        let err = EngineSnapshot::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse state file"));
        std::fs::remove_file(&path).unwrap();
    }
}
