use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::context::Context;
use crate::fleet::FleetState;
use crate::policy::{self, ExecutionSample, PolicyState, execution_rates};
use crate::registry::{FleetRegistry, PolicyMode, governance_missing_reasons};
use crate::store::{self, Layout};

pub const SCHEMA_VERSION: &str = "v1";

/* ============================= CONFIG ============================= */

/// Thresholds for the promotion readiness gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionConfig {
    /// Rolling window of autonomous handoff executions to inspect.
    pub window_executions: usize,
    /// Minimum number of runs in the window.
    pub min_sample_size: u64,
    pub max_ambiguity_rate: f64,
    pub max_failure_rate: f64,
    pub max_manual_backlog: u64,
    pub max_drill_age_hours: i64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            window_executions: 5,
            min_sample_size: 3,
            max_ambiguity_rate: 0.2,
            max_failure_rate: 0.2,
            max_manual_backlog: 5,
            max_drill_age_hours: 168,
        }
    }
}

/* ============================= DRILLS ============================= */

pub const REQUIRED_DRILLS: &[&str] =
    &["kill_switch", "sprite_service_outage", "ambiguous_retry_guard"];

/// One recorded drill exercise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrillRecord {
    pub result: String,
    pub at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
}

/// The persisted drill state artifact.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DrillState {
    #[serde(default)]
    pub drills: BTreeMap<String, DrillRecord>,
}

/// Record a drill outcome into the drill state artifact.
pub fn record_drill(ctx: &Context, name: &str, result: &str, by: Option<&str>) -> Result<DrillState> {
    let layout = Layout::new(ctx.repo_root());
    let mut state: DrillState = store::read_json(&layout.fleet_drills())?.unwrap_or_default();
    state.drills.insert(
        name.to_string(),
        DrillRecord {
            result: result.to_string(),
            at: ctx.now(),
            by: by.map(str::to_string),
        },
    );
    store::write_json(&layout.fleet_drills(), &state)?;
    Ok(state)
}

/* ============================= GATE TYPES ============================= */

/// One gate's verdict.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GateReport {
    pub passed: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reason_codes: Vec<String>,
}

impl GateReport {
    fn pass() -> Self {
        Self { passed: true, reason_codes: Vec::new() }
    }

    fn fail(reasons: Vec<String>) -> Self {
        Self { passed: false, reason_codes: reasons }
    }
}

/// All five gates.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PromotionGates {
    pub governance: GateReport,
    pub outcome_reliability: GateReport,
    pub manual_backlog: GateReport,
    pub safety_suppression: GateReport,
    pub drill_recency: GateReport,
}

/// Summary decision.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PromotionSummary {
    pub decision: String,
    pub failed_gates: Vec<String>,
    pub reason_codes: Vec<String>,
}

/// The persisted promotion decision artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionDecision {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub trace_id: String,
    pub summary: PromotionSummary,
    pub gates: PromotionGates,
    pub window: policy::ExecutionRates,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fleet_status: Option<String>,
}

impl PromotionDecision {
    pub fn promoted(&self) -> bool {
        self.summary.decision == "promote"
    }
}

/* ============================= GATES ============================= */

/// Gate 1, governance: guarded_auto mode, active posture, complete record.
pub fn evaluate_governance_gate(registry: &FleetRegistry, now: DateTime<Utc>) -> GateReport {
    let mut reasons = Vec::new();
    if registry.policy.mode != PolicyMode::GuardedAuto {
        reasons.push("promotion_mode_not_guarded_auto".to_string());
    }
    match &registry.policy.autonomous.governance {
        None => reasons.push("promotion_governance_missing".to_string()),
        Some(governance) => {
            reasons.extend(governance_missing_reasons(governance));
            if governance.review_by <= now {
                reasons.push("promotion_governance_expired".to_string());
            } else if governance.changed_at >= governance.review_by {
                reasons.push("promotion_governance_review_not_after_change".to_string());
            }
        }
    }
    if reasons.is_empty() { GateReport::pass() } else { GateReport::fail(reasons) }
}

/// Gate 2, outcome reliability over the execution window.
pub fn evaluate_outcome_reliability_gate(
    telemetry_present: bool,
    window: &[ExecutionSample],
    config: &PromotionConfig,
) -> GateReport {
    if !telemetry_present {
        return GateReport::fail(vec!["promotion_handoff_telemetry_missing".to_string()]);
    }
    let rates = execution_rates(window);
    let mut reasons = Vec::new();
    if rates.runs < config.min_sample_size {
        reasons.push("promotion_sample_size_insufficient".to_string());
    }
    if rates.attempted > 0 {
        if rates.ambiguity_rate > config.max_ambiguity_rate {
            reasons.push("promotion_autonomous_ambiguity_rate_exceeded".to_string());
        }
        if rates.failure_rate > config.max_failure_rate {
            reasons.push("promotion_autonomous_failure_rate_exceeded".to_string());
        }
    }
    if reasons.is_empty() { GateReport::pass() } else { GateReport::fail(reasons) }
}

/// Gate 3, manual backlog: unsuppressed candidates stuck on manual review.
pub fn evaluate_manual_backlog_gate(
    policy_state: Option<&PolicyState>,
    config: &PromotionConfig,
) -> GateReport {
    let backlog = policy_state
        .map(|state| {
            state
                .candidates
                .iter()
                .filter(|c| !c.suppressed && c.autonomous.manual_only)
                .count() as u64
        })
        .unwrap_or(0);
    if backlog > config.max_manual_backlog {
        GateReport::fail(vec!["promotion_manual_backlog_exceeded".to_string()])
    } else {
        GateReport::pass()
    }
}

/// Gate 4, safety suppression: no autopause, and every gating path wired.
///
/// The four paths: policy allow-lists configured, rollout selector
/// configured, governance record present, and complete transport config
/// on every sprite_service loop.
pub fn evaluate_safety_suppression_gate(
    registry: &FleetRegistry,
    policy_state: Option<&PolicyState>,
) -> GateReport {
    let mut reasons = Vec::new();

    let autopause_active = policy_state.is_some_and(|s| s.autopause.active)
        || registry.policy.autonomous.rollout.pause.auto.active;
    if autopause_active {
        reasons.push("promotion_autopause_active".to_string());
    }

    let autonomous = &registry.policy.autonomous;
    if autonomous.allow.categories.is_empty() || autonomous.allow.intents.is_empty() {
        reasons.push("promotion_safety_path_policy_gated_missing".to_string());
    }
    if autonomous.rollout.salt.trim().is_empty() {
        reasons.push("promotion_safety_path_rollout_gated_missing".to_string());
    }
    if autonomous.governance.is_none() {
        reasons.push("promotion_safety_path_governance_gated_missing".to_string());
    }
    let transport_incomplete = registry
        .loops
        .iter()
        .any(|l| crate::fleet::service_config_failure(l).is_some());
    if transport_incomplete {
        reasons.push("promotion_safety_path_transport_gated_missing".to_string());
    }

    if reasons.is_empty() { GateReport::pass() } else { GateReport::fail(reasons) }
}

/// Gate 5, drill recency: every required drill passed recently.
pub fn evaluate_drill_recency_gate(
    drills: &DrillState,
    config: &PromotionConfig,
    now: DateTime<Utc>,
) -> GateReport {
    let mut reasons = Vec::new();
    for name in REQUIRED_DRILLS {
        match drills.drills.get(*name) {
            None => reasons.push(format!("promotion_drill_{name}_missing")),
            Some(record) if record.result != "pass" => {
                reasons.push(format!("promotion_drill_{name}_failed"));
            }
            Some(record) => {
                let age_hours = (now - record.at).num_hours();
                if age_hours > config.max_drill_age_hours {
                    reasons.push(format!("promotion_drill_{name}_stale"));
                }
            }
        }
    }
    if reasons.is_empty() { GateReport::pass() } else { GateReport::fail(reasons) }
}

/* ============================= EVALUATION ============================= */

/// Inputs to one CI evaluation. Pure given these.
pub struct PromotionInputs<'a> {
    pub registry: &'a FleetRegistry,
    pub fleet: Option<&'a FleetState>,
    pub policy_state: Option<&'a PolicyState>,
    pub telemetry_present: bool,
    pub window: &'a [ExecutionSample],
    pub drills: &'a DrillState,
    pub config: &'a PromotionConfig,
    pub now: DateTime<Utc>,
    pub trace_id: &'a str,
}

/// Evaluate all five gates: the decision is promote iff every gate passes.
pub fn evaluate_promotion(inputs: &PromotionInputs<'_>) -> PromotionDecision {
    let gates = PromotionGates {
        governance: evaluate_governance_gate(inputs.registry, inputs.now),
        outcome_reliability: evaluate_outcome_reliability_gate(
            inputs.telemetry_present,
            inputs.window,
            inputs.config,
        ),
        manual_backlog: evaluate_manual_backlog_gate(inputs.policy_state, inputs.config),
        safety_suppression: evaluate_safety_suppression_gate(inputs.registry, inputs.policy_state),
        drill_recency: evaluate_drill_recency_gate(inputs.drills, inputs.config, inputs.now),
    };

    let named: [(&str, &GateReport); 5] = [
        ("governance", &gates.governance),
        ("outcome_reliability", &gates.outcome_reliability),
        ("manual_backlog", &gates.manual_backlog),
        ("safety_suppression", &gates.safety_suppression),
        ("drill_recency", &gates.drill_recency),
    ];

    let failed_gates: Vec<String> = named
        .iter()
        .filter(|(_, gate)| !gate.passed)
        .map(|(name, _)| name.to_string())
        .collect();
    let mut reason_codes = Vec::new();
    for (_, gate) in &named {
        for reason in &gate.reason_codes {
            if !reason_codes.contains(reason) {
                reason_codes.push(reason.clone());
            }
        }
    }

    let decision = if failed_gates.is_empty() { "promote" } else { "hold" };
    PromotionDecision {
        schema_version: SCHEMA_VERSION.to_string(),
        generated_at: inputs.now,
        trace_id: inputs.trace_id.to_string(),
        summary: PromotionSummary {
            decision: decision.to_string(),
            failed_gates,
            reason_codes,
        },
        gates,
        window: execution_rates(inputs.window),
        fleet_status: inputs.fleet.and_then(|f| {
            serde_json::to_value(f.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
        }),
    }
}

/* ============================= RUN ============================= */

/// Run the CI over the persisted artifacts and write the decision.
pub fn run_promotion_ci(
    ctx: &Context,
    registry: &FleetRegistry,
    config: &PromotionConfig,
) -> Result<PromotionDecision> {
    let layout = Layout::new(ctx.repo_root());
    let fleet: Option<FleetState> = store::read_json(&layout.fleet_state())?;
    let policy_state: Option<PolicyState> = store::read_json(&layout.fleet_policy_state())?;
    let telemetry_present = layout.fleet_telemetry("handoff").exists();
    let window = policy::load_execution_window(&layout, config.window_executions)?;
    let drills: DrillState = store::read_json(&layout.fleet_drills())?.unwrap_or_default();

    let decision = evaluate_promotion(&PromotionInputs {
        registry,
        fleet: fleet.as_ref(),
        policy_state: policy_state.as_ref(),
        telemetry_present,
        window: &window,
        drills: &drills,
        config,
        now: ctx.now(),
        trace_id: ctx.trace_id(),
    });

    store::write_json(&layout.fleet_promotion_state(), &decision)?;
    store::append_jsonl(
        &layout.fleet_telemetry("promotion"),
        &json!({
            "schemaVersion": SCHEMA_VERSION,
            "stage": "fleet_promotion_ci",
            "at": decision.generated_at.to_rfc3339(),
            "traceId": &decision.trace_id,
            "decision": &decision.summary.decision,
            "failedGates": &decision.summary.failed_gates,
            "reasonCodes": &decision.summary.reason_codes,
        }),
    )?;

    info!(
        decision = %decision.summary.decision,
        failed = decision.summary.failed_gates.len(),
        "fleet_promotion_ci_done"
    );
    Ok(decision)
}

/* ============================= TESTS ============================= */
