use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::context::Context;
use crate::promotion::PromotionDecision;
use crate::registry::{FleetRegistry, Governance, validate_registry};
use crate::store::{self, Layout};

pub const SCHEMA_VERSION: &str = "v1";

/* ============================= REQUEST TYPES ============================= */

/// Apply driver mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    DryRun,
    Apply,
    Rollback,
}

/// What the apply mutates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromotionIntent {
    /// Raise canaryPercent by the configured expand step, capped at 100.
    Expand,
    /// Clear the manual pause.
    Resume,
    /// Set the manual pause.
    Rollback,
}

impl PromotionIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromotionIntent::Expand => "expand",
            PromotionIntent::Resume => "resume",
            PromotionIntent::Rollback => "rollback",
        }
    }
}

/// Operator-supplied governance for an apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceInput {
    pub by: String,
    pub approval_ref: String,
    pub rationale: String,
    pub review_by: DateTime<Utc>,
}

impl GovernanceInput {
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.by.trim().is_empty() {
            bail!("governance 'by' must not be empty");
        }
        if self.approval_ref.trim().is_empty() {
            bail!("governance 'approval-ref' must not be empty");
        }
        if self.rationale.trim().is_empty() {
            bail!("governance 'rationale' must not be empty");
        }
        if self.review_by <= now {
            bail!("governance 'review-by' must be in the future");
        }
        Ok(())
    }
}

/// One apply request.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub mode: ApplyMode,
    pub intent: PromotionIntent,
    pub governance: Option<GovernanceInput>,
    pub idempotency_key: Option<String>,
}

/* ============================= RECORD TYPES ============================= */

/// Rollout fields captured before and after a mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutSnapshot {
    pub canary_percent: u32,
    pub manual_pause: bool,
}

/// Per-field change flags.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChangedFlags {
    pub canary_percent: bool,
    pub manual_pause: bool,
}

/// The per-run apply record, also the replay payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRecord {
    pub schema_version: String,
    pub stage: String,
    pub at: DateTime<Utc>,
    pub trace_id: String,
    pub mode: ApplyMode,
    pub intent: PromotionIntent,
    pub decision: String,
    pub applied: bool,
    pub before: RolloutSnapshot,
    pub after: RolloutSnapshot,
    pub changed: ChangedFlags,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand_step: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub governance: Option<GovernanceInput>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replayed: bool,
}

/* ============================= MUTATION ============================= */

fn snapshot_rollout(registry: &FleetRegistry) -> RolloutSnapshot {
    RolloutSnapshot {
        canary_percent: registry.policy.autonomous.rollout.canary_percent,
        manual_pause: registry.policy.autonomous.rollout.pause.manual,
    }
}

/// Apply the intent to a cloned registry. Returns the mutated clone.
pub fn mutate_registry(registry: &FleetRegistry, intent: PromotionIntent) -> FleetRegistry {
    let mut mutated = registry.clone();
    let rollout = &mut mutated.policy.autonomous.rollout;
    match intent {
        PromotionIntent::Expand => {
            rollout.canary_percent = (rollout.canary_percent + rollout.expand_step).min(100);
        }
        PromotionIntent::Resume => {
            rollout.pause.manual = false;
        }
        PromotionIntent::Rollback => {
            rollout.pause.manual = true;
        }
    }
    mutated
}

/* ============================= REPLAY ============================= */

/// Find a prior apply record with the same idempotency key.
pub fn find_replay(layout: &Layout, key: &str) -> Result<Option<ApplyRecord>> {
    let lines = store::read_lines(&layout.fleet_telemetry("promotion"))?;
    for line in lines.iter().rev() {
        let Ok(value) = serde_json::from_str::<Value>(line) else { continue };
        if value["stage"] == "fleet_promotion_apply" && value["idempotencyKey"] == key {
            let record: ApplyRecord = serde_json::from_value(value)?;
            return Ok(Some(record));
        }
    }
    Ok(None)
}

/* ============================= RUN ============================= */

/// Drive one dry_run/apply/rollback invocation over a CI decision.
///
/// Apply requires complete governance and a promote decision; rollback is
/// permitted regardless of the decision. The mutated registry is
/// revalidated end-to-end and persisted only on success.
pub fn run_apply(
    ctx: &Context,
    registry: &FleetRegistry,
    decision: &PromotionDecision,
    request: &ApplyRequest,
) -> Result<ApplyRecord> {
    let layout = Layout::new(ctx.repo_root());
    let now = ctx.now();

    // Idempotency replay bypasses every side effect
    if let Some(key) = &request.idempotency_key
        && let Some(mut prior) = find_replay(&layout, key)?
    {
        info!(idempotency_key = %key, "promotion_apply_replayed");
        prior.replayed = true;
        return Ok(prior);
    }

    let intent = match request.mode {
        ApplyMode::Rollback => PromotionIntent::Rollback,
        _ => request.intent,
    };

    let before = snapshot_rollout(registry);
    let mutated = mutate_registry(registry, intent);
    let after = snapshot_rollout(&mutated);
    let changed = ChangedFlags {
        canary_percent: before.canary_percent != after.canary_percent,
        manual_pause: before.manual_pause != after.manual_pause,
    };
    let expand_step = match intent {
        PromotionIntent::Expand => Some(registry.policy.autonomous.rollout.expand_step),
        _ => None,
    };

    let mut record = ApplyRecord {
        schema_version: SCHEMA_VERSION.to_string(),
        stage: "fleet_promotion_apply".to_string(),
        at: now,
        trace_id: ctx.trace_id().to_string(),
        mode: request.mode,
        intent,
        decision: decision.summary.decision.clone(),
        applied: false,
        before,
        after,
        changed,
        expand_step,
        governance: request.governance.clone(),
        idempotency_key: request.idempotency_key.clone(),
        replayed: false,
    };

    if request.mode == ApplyMode::DryRun {
        store::append_jsonl(&layout.fleet_telemetry("promotion"), &record)?;
        info!(intent = intent.as_str(), "promotion_apply_preview");
        return Ok(record);
    }

    // ── mutation path ──
    if request.mode == ApplyMode::Apply
        && intent != PromotionIntent::Rollback
        && !decision.promoted()
    {
        bail!("promotion decision is '{}'; apply requires promote", decision.summary.decision);
    }

    let mut persisted = mutated;
    match &request.governance {
        Some(input) => {
            input.validate(now)?;
            persisted.policy.autonomous.governance = Some(Governance {
                by: input.by.clone(),
                approval_ref: input.approval_ref.clone(),
                rationale: input.rationale.clone(),
                changed_at: now,
                review_by: input.review_by,
            });
        }
        None if request.mode == ApplyMode::Apply => {
            bail!("apply requires governance: --by, --approval-ref, --rationale, --review-by");
        }
        // Rollback without explicit governance keeps the existing record
        None => {}
    }

    validate_registry(&persisted, now)?;
    store::write_json(&layout.fleet_registry(), &persisted)?;

    record.applied = true;
    store::append_jsonl(&layout.fleet_telemetry("promotion"), &record)?;
    info!(
        intent = intent.as_str(),
        canary_before = record.before.canary_percent,
        canary_after = record.after.canary_percent,
        "promotion_apply_done"
    );
    Ok(record)
}

/* ============================= TESTS ============================= */
