//! Feature flags for gradual remote rollout
//!
//! Each flag carries an enabled switch and a rollout percentage. Callers are
//! placed into one of 100 buckets by hashing `flag:caller` with SHA-256, so a
//! caller keeps landing on the same path for as long as the flag is unchanged.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of rollout buckets
const BUCKETS: u64 = 100;

/// State of one flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlag {
    /// Unique flag name
    pub name: String,

    /// Master switch; false short-circuits to ineligible
    pub enabled: bool,

    /// Share of callers eligible for the remote path, 0..=100
    pub rollout_percentage: u8,

    /// Last administrative change
    pub updated_at: DateTime<Utc>,
}

impl FeatureFlag {
    /// Create a flag, clamping the percentage
    pub fn new(name: impl Into<String>, enabled: bool, rollout_percentage: i64) -> Self {
        Self {
            name: name.into(),
            enabled,
            rollout_percentage: clamp_percentage(rollout_percentage),
            updated_at: Utc::now(),
        }
    }

    /// Whether `caller_identity` falls inside this flag's rollout
    pub fn admits(&self, caller_identity: &str) -> bool {
        if !self.enabled {
            return false;
        }
        rollout_bucket(&self.name, caller_identity) < u64::from(self.rollout_percentage)
    }
}

/// Stable bucket in `0..100` for a flag/caller pair
pub fn rollout_bucket(flag_name: &str, caller_identity: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(flag_name.as_bytes());
    hasher.update(b":");
    hasher.update(caller_identity.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) % BUCKETS
}

fn clamp_percentage(value: i64) -> u8 {
    // Lossless: the value is clamped into 0..=100 first
    value.clamp(0, 100) as u8
}

/// In-memory flag store.
///
/// Reads take a shared lock and never do I/O. Updates are rare administrative
/// operations and take the write lock briefly.
#[derive(Debug, Default)]
pub struct FeatureFlagEngine {
    flags: RwLock<HashMap<String, FeatureFlag>>,
}

impl FeatureFlagEngine {
    /// Create an empty engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an engine seeded with flags
    pub fn with_flags(flags: impl IntoIterator<Item = FeatureFlag>) -> Self {
        let engine = Self::new();
        engine.load_flags(flags);
        engine
    }

    /// Whether the remote path is eligible for this caller under `flag_name`.
    /// Unknown flags are never eligible.
    pub fn is_remote_eligible(&self, flag_name: &str, caller_identity: &str) -> bool {
        let flags = self.flags.read().unwrap_or_else(PoisonError::into_inner);
        flags
            .get(flag_name)
            .map(|flag| flag.admits(caller_identity))
            .unwrap_or(false)
    }

    /// Create or update a flag. The percentage is clamped to 0..=100.
    pub fn update_flag(&self, name: &str, enabled: bool, rollout_percentage: i64) -> FeatureFlag {
        let flag = FeatureFlag::new(name, enabled, rollout_percentage);
        if i64::from(flag.rollout_percentage) != rollout_percentage {
            log::warn!(
                "Rollout percentage {} for flag {} clamped to {}",
                rollout_percentage,
                name,
                flag.rollout_percentage
            );
        }

        let mut flags = self.flags.write().unwrap_or_else(PoisonError::into_inner);
        flags.insert(name.to_string(), flag.clone());
        log::info!(
            "Flag {} updated: enabled={}, rollout={}%",
            name,
            flag.enabled,
            flag.rollout_percentage
        );
        flag
    }

    /// Administrative alias of [`update_flag`](Self::update_flag)
    pub fn set_flag(&self, name: &str, enabled: bool, rollout_percentage: i64) -> FeatureFlag {
        self.update_flag(name, enabled, rollout_percentage)
    }

    /// Disable a flag, keeping its percentage. Flags are never deleted.
    pub fn disable_flag(&self, name: &str) -> Option<FeatureFlag> {
        let mut flags = self.flags.write().unwrap_or_else(PoisonError::into_inner);
        flags.get_mut(name).map(|flag| {
            flag.enabled = false;
            flag.updated_at = Utc::now();
            log::info!("Flag {} disabled", name);
            flag.clone()
        })
    }

    /// Current state of a flag
    pub fn get_flag(&self, name: &str) -> Option<FeatureFlag> {
        let flags = self.flags.read().unwrap_or_else(PoisonError::into_inner);
        flags.get(name).cloned()
    }

    /// All flags, sorted by name
    pub fn list_flags(&self) -> Vec<FeatureFlag> {
        let flags = self.flags.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<FeatureFlag> = flags.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Bulk refresh from an out-of-band source. Existing flags not in the
    /// batch are left as they are.
    pub fn load_flags(&self, batch: impl IntoIterator<Item = FeatureFlag>) {
        let mut flags = self.flags.write().unwrap_or_else(PoisonError::into_inner);
        for mut flag in batch {
            flag.rollout_percentage = flag.rollout_percentage.min(100);
            flags.insert(flag.name.clone(), flag);
        }
        log::debug!("Flag store now holds {} flags", flags.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callers() -> impl Iterator<Item = String> {
        (0..500).map(|i| format!("user-{}", i))
    }

    #[test]
    fn test_disabled_flag_never_eligible() {
        let engine = FeatureFlagEngine::new();
        engine.update_flag("remote_execution", false, 100);

        for caller in callers() {
            assert!(!engine.is_remote_eligible("remote_execution", &caller));
        }
    }

    #[test]
    fn test_full_and_zero_rollout() {
        let engine = FeatureFlagEngine::new();
        engine.update_flag("all", true, 100);
        engine.update_flag("none", true, 0);

        for caller in callers() {
            assert!(engine.is_remote_eligible("all", &caller));
            assert!(!engine.is_remote_eligible("none", &caller));
        }
    }

    #[test]
    fn test_eligibility_is_deterministic() {
        let engine = FeatureFlagEngine::new();
        engine.update_flag("remote_execution", true, 37);

        for caller in callers() {
            let first = engine.is_remote_eligible("remote_execution", &caller);
            for _ in 0..5 {
                assert_eq!(engine.is_remote_eligible("remote_execution", &caller), first);
            }
        }
    }

    #[test]
    fn test_partial_rollout_splits_callers() {
        let engine = FeatureFlagEngine::new();
        engine.update_flag("remote_execution", true, 50);

        let eligible = callers()
            .filter(|c| engine.is_remote_eligible("remote_execution", c))
            .count();

        // 500 callers at 50%: anything wildly off means the bucketing is broken
        assert!(eligible > 150 && eligible < 350, "eligible = {}", eligible);
    }

    #[test]
    fn test_raising_rollout_keeps_existing_callers() {
        let engine = FeatureFlagEngine::new();
        engine.update_flag("remote_execution", true, 20);
        let before: Vec<String> = callers()
            .filter(|c| engine.is_remote_eligible("remote_execution", c))
            .collect();

        engine.update_flag("remote_execution", true, 60);
        for caller in before {
            assert!(engine.is_remote_eligible("remote_execution", &caller));
        }
    }

    #[test]
    fn test_percentage_clamped() {
        let engine = FeatureFlagEngine::new();
        assert_eq!(engine.update_flag("high", true, 250).rollout_percentage, 100);
        assert_eq!(engine.update_flag("low", true, -5).rollout_percentage, 0);
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let engine = FeatureFlagEngine::new();
        engine.set_flag("x", true, 100);

        let flag = engine.get_flag("x").unwrap();
        assert!(flag.enabled);
        assert_eq!(flag.rollout_percentage, 100);
    }

    #[test]
    fn test_unknown_flag_not_eligible() {
        let engine = FeatureFlagEngine::new();
        assert!(!engine.is_remote_eligible("missing", "user-1"));
        assert!(engine.get_flag("missing").is_none());
    }

    #[test]
    fn test_disable_keeps_flag() {
        let engine = FeatureFlagEngine::new();
        engine.update_flag("remote_execution", true, 80);
        let flag = engine.disable_flag("remote_execution").unwrap();

        assert!(!flag.enabled);
        assert_eq!(flag.rollout_percentage, 80);
        assert_eq!(engine.list_flags().len(), 1);
        assert!(engine.disable_flag("missing").is_none());
    }

    #[test]
    fn test_load_flags() {
        let engine = FeatureFlagEngine::with_flags(vec![FeatureFlag::new("a", true, 100)]);
        engine.load_flags(vec![FeatureFlag::new("b", false, 10)]);

        let names: Vec<String> = engine.list_flags().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
