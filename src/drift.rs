use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::projector::TuningObservation;

/* ============================= TYPES ============================= */

/// Drift tracker status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    #[default]
    Inactive,
    DriftActive,
}

/// Trip conditions for the drift tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftConfig {
    /// Minimum recommendation confidence for a mismatch to count.
    pub min_confidence: f64,
    /// Consecutive mismatches required before drift activates.
    pub required_streak: u32,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self { min_confidence: 0.7, required_streak: 3 }
    }
}

/// Persisted drift artifact for one loop.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DriftState {
    pub status: DriftStatus,

    #[serde(default)]
    pub mismatch_streak: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
}

/// Outcome of one drift observation.
#[derive(Debug, Clone)]
pub struct DriftObservation {
    pub state: DriftState,
    /// True only on the inactive → drift_active transition.
    pub rising_edge: bool,
}

/* ============================= OBSERVATION ============================= */

/// Returns true when the tuning observation counts as a mismatch:
/// applied and recommended both present and different, with the
/// recommendation confidence at or above the floor.
pub fn is_mismatch(tuning: &TuningObservation, config: &DriftConfig) -> bool {
    let (Some(applied), Some(recommended)) = (&tuning.applied, &tuning.recommended) else {
        return false;
    };
    if applied == recommended {
        return false;
    }
    tuning
        .recommendation_confidence
        .is_some_and(|confidence| confidence >= config.min_confidence)
}

/// Fold one tuning observation into the drift state.
///
/// A mismatch extends the streak; anything else resets it and deactivates
/// drift. The rising edge fires exactly once per activation.
pub fn observe(
    prior: &DriftState,
    tuning: &TuningObservation,
    config: &DriftConfig,
    now: DateTime<Utc>,
) -> DriftObservation {
    let mut state = prior.clone();
    state.last_observed_at = Some(now);
    state.applied = tuning.applied.clone();
    state.recommended = tuning.recommended.clone();

    if is_mismatch(tuning, config) {
        state.mismatch_streak = state.mismatch_streak.saturating_add(1);
    } else {
        state.mismatch_streak = 0;
        state.status = DriftStatus::Inactive;
        state.activated_at = None;
        return DriftObservation { state, rising_edge: false };
    }

    let was_active = prior.status == DriftStatus::DriftActive;
    if state.mismatch_streak >= config.required_streak {
        state.status = DriftStatus::DriftActive;
        if !was_active {
            state.activated_at = Some(now);
            return DriftObservation { state, rising_edge: true };
        }
    }

    DriftObservation { state, rising_edge: false }
}

/* ============================= TESTS ============================= */
