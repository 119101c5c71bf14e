use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::context::Context;
use crate::fleet::FleetState;
use crate::health::HealthStatus;
use crate::registry::{
    AutopauseConfig, Category, Confidence, FleetRegistry, Intent, PolicyMode, RolloutConfig,
    Severity,
};
use crate::store::{self, Layout};

pub const SCHEMA_VERSION: &str = "v1";

/* ============================= ROLLOUT BUCKET ============================= */

/// FNV-1a 64-bit over UTF-8 bytes. Pinned as the stable rollout hash.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Deterministic canary bucket in 0..100 for a loop id under a salt.
pub fn rollout_bucket(loop_id: &str, salt: &str) -> u32 {
    let key = format!("{loop_id}|{salt}");
    (fnv1a64(key.as_bytes()) % 100) as u32
}

/// Canary selector outcome for one loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutSelector {
    pub bucket: u32,
    pub in_scope: bool,
    pub in_cohort: bool,
}

/// Evaluate the canary selector: empty scope means every loop is in scope;
/// `canaryPercent == 100` admits every in-scope loop, `0` admits none.
pub fn select_rollout(loop_id: &str, rollout: &RolloutConfig) -> RolloutSelector {
    let bucket = rollout_bucket(loop_id, &rollout.salt);
    let in_scope = rollout.scope.is_empty() || rollout.scope.contains(loop_id);
    let in_cohort = in_scope && bucket < rollout.canary_percent;
    RolloutSelector { bucket, in_scope, in_cohort }
}

/* ============================= EXECUTION WINDOW ============================= */

/// One autonomous handoff execution parsed from handoff telemetry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSample {
    pub at: Option<DateTime<Utc>>,
    pub attempted: u64,
    pub ambiguous: u64,
    pub failed: u64,
}

/// Load the last `n` autonomous execution records from the handoff
/// telemetry stream, oldest first.
pub fn load_execution_window(layout: &Layout, n: usize) -> Result<Vec<ExecutionSample>> {
    let values = store::tail_values(&layout.fleet_telemetry("handoff"), n * 4)?;
    let mut samples: Vec<ExecutionSample> = values
        .iter()
        .filter(|v| v["stage"] == "fleet_handoff_execute" && v["autonomous"] == true)
        .map(|v| ExecutionSample {
            at: v["at"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
            attempted: v["attempted"].as_u64().unwrap_or(0),
            ambiguous: v["ambiguous"].as_u64().unwrap_or(0),
            failed: v["failed"].as_u64().unwrap_or(0),
        })
        .collect();
    let start = samples.len().saturating_sub(n);
    Ok(samples.split_off(start))
}

/// Rolled-up rates over an execution window.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRates {
    pub runs: u64,
    pub attempted: u64,
    pub ambiguous: u64,
    pub failed: u64,
    pub ambiguity_rate: f64,
    pub failure_rate: f64,
}

pub fn execution_rates(samples: &[ExecutionSample]) -> ExecutionRates {
    let attempted: u64 = samples.iter().map(|s| s.attempted).sum();
    let ambiguous: u64 = samples.iter().map(|s| s.ambiguous).sum();
    let failed: u64 = samples.iter().map(|s| s.failed).sum();
    let (ambiguity_rate, failure_rate) = if attempted > 0 {
        (ambiguous as f64 / attempted as f64, failed as f64 / attempted as f64)
    } else {
        (0.0, 0.0)
    };
    ExecutionRates {
        runs: samples.len() as u64,
        attempted,
        ambiguous,
        failed,
        ambiguity_rate,
        failure_rate,
    }
}

/// Autopause evaluation over the lookback window.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AutopauseEvaluation {
    pub active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub rates: ExecutionRates,
}

/// Autopause trips when the sample is large enough and either rate
/// crosses its threshold.
pub fn evaluate_autopause(
    samples: &[ExecutionSample],
    config: &AutopauseConfig,
) -> AutopauseEvaluation {
    let window = &samples[samples.len().saturating_sub(config.lookback_executions)..];
    let rates = execution_rates(window);
    if rates.attempted >= config.min_sample_size {
        if rates.ambiguity_rate >= config.ambiguity_rate_threshold {
            return AutopauseEvaluation {
                active: true,
                reason: Some("autonomous_autopause_ambiguity_rate".to_string()),
                rates,
            };
        }
        if rates.failure_rate >= config.failure_rate_threshold {
            return AutopauseEvaluation {
                active: true,
                reason: Some("autonomous_autopause_failure_rate".to_string()),
                rates,
            };
        }
    }
    AutopauseEvaluation { active: false, reason: None, rates }
}

/* ============================= CANDIDATE TYPES ============================= */

/// Intent recommended for a category. Presently everything maps to cancel.
pub fn recommended_intent(_category: Category) -> Intent {
    Intent::Cancel
}

/// Cooldown evaluation for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CandidateCooldown {
    pub active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_unsuppressed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

/// Gate families recorded per candidate.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GateResults {
    pub policy: bool,
    pub rollout: bool,
    pub autopause: bool,
    pub safety: bool,
}

/// Safety allocation recorded per candidate.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SafetyAllocation {
    pub selected_total_before: u32,
    pub selected_by_loop_before: u32,
}

/// Autonomy decision for one candidate. Eligible iff `reasons` is empty.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AutonomyDecision {
    pub eligible: bool,
    pub manual_only: bool,
    pub reasons: Vec<String>,
    pub gates: GateResults,
    pub safety: SafetyAllocation,
    pub rollout: RolloutDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RolloutDecision {
    pub selector: Option<RolloutSelector>,
    pub pause: PauseDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PauseDecision {
    pub manual: bool,
    pub auto: bool,
}

/// One remediation candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyCandidate {
    pub candidate_id: String,
    pub loop_id: String,
    pub category: Category,
    pub severity: Severity,
    pub confidence: Confidence,
    pub recommended_intent: Intent,
    pub suppressed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppression_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppression_scope: Option<String>,

    pub cooldown: CandidateCooldown,
    pub autonomous: AutonomyDecision,
}

/// Roll-up counters by facet.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyCounters {
    pub by_severity: BTreeMap<String, u32>,
    pub by_confidence: BTreeMap<String, u32>,
    pub by_category: BTreeMap<String, u32>,
    pub by_suppression_reason: BTreeMap<String, u32>,
    pub by_autonomy_reason: BTreeMap<String, u32>,
}

/// The persisted policy state artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyState {
    pub schema_version: String,
    pub fleet_id: String,
    pub mode: PolicyMode,
    pub generated_at: DateTime<Utc>,
    pub trace_id: String,
    pub candidates: Vec<PolicyCandidate>,
    pub counters: PolicyCounters,
    pub reason_codes: Vec<String>,
    pub autopause: AutopauseEvaluation,
    pub eligible_count: u32,
}

/* ============================= SYNTHESIS ============================= */

/// Derive one candidate per (loop, observed category) from the fleet state,
/// sorted by (loopId, category) so the safety budget allocation is stable.
pub fn synthesize_candidates(fleet: &FleetState) -> Vec<(String, Category, Severity, Confidence)> {
    let mut raw = Vec::new();
    for result in &fleet.results {
        if result.status == "failed" {
            raw.push((
                result.loop_id.clone(),
                Category::ReconcileFailed,
                Severity::Critical,
                Confidence::High,
            ));
        }
        match result.health_status {
            Some(HealthStatus::Critical) => raw.push((
                result.loop_id.clone(),
                Category::HealthCritical,
                Severity::Critical,
                Confidence::High,
            )),
            Some(HealthStatus::Degraded) => raw.push((
                result.loop_id.clone(),
                Category::HealthDegraded,
                Severity::Warning,
                Confidence::Medium,
            )),
            _ => {}
        }
    }
    raw.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.as_str().cmp(b.1.as_str())));
    raw.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1);
    raw
}

/* ============================= SUPPRESSION ============================= */

struct SuppressionOutcome {
    suppressed: bool,
    reason: Option<String>,
    scope: Option<String>,
    cooldown: CandidateCooldown,
}

/// Suppression precedence: loop match, then global, then cooldown.
fn evaluate_suppression(
    registry: &FleetRegistry,
    history: &[Value],
    loop_id: &str,
    category: Category,
    candidate_id: &str,
    now: DateTime<Utc>,
) -> SuppressionOutcome {
    let suppressions = &registry.policy.suppressions;
    if suppressions.get(loop_id).is_some_and(|set| set.contains(&category)) {
        return SuppressionOutcome {
            suppressed: true,
            reason: Some(format!("suppressed_category_{}", category.as_str())),
            scope: Some("loop".to_string()),
            cooldown: CandidateCooldown::default(),
        };
    }
    if suppressions.get("*").is_some_and(|set| set.contains(&category)) {
        return SuppressionOutcome {
            suppressed: true,
            reason: Some(format!("suppressed_category_{}", category.as_str())),
            scope: Some("global".to_string()),
            cooldown: CandidateCooldown::default(),
        };
    }

    let window = registry.policy.noise_controls.dedupe_window_seconds;
    let last_unsuppressed = history
        .iter()
        .filter(|entry| {
            entry["candidateId"] == candidate_id && entry["suppressed"] == false
        })
        .filter_map(|entry| {
            entry["at"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
        })
        .max();

    if window > 0
        && let Some(at) = last_unsuppressed
    {
        let until = at + chrono::Duration::seconds(window);
        if now < until {
            return SuppressionOutcome {
                suppressed: true,
                reason: Some("cooldown_active".to_string()),
                scope: Some("cooldown".to_string()),
                cooldown: CandidateCooldown {
                    active: true,
                    last_unsuppressed_at: Some(at),
                    until: Some(until),
                },
            };
        }
        return SuppressionOutcome {
            suppressed: false,
            reason: None,
            scope: None,
            cooldown: CandidateCooldown {
                active: false,
                last_unsuppressed_at: Some(at),
                until: None,
            },
        };
    }

    SuppressionOutcome {
        suppressed: false,
        reason: None,
        scope: None,
        cooldown: CandidateCooldown::default(),
    }
}

/* ============================= GATE CASCADE ============================= */

/// Inputs to one policy evaluation. The evaluation itself is pure.
pub struct PolicyInputs<'a> {
    pub registry: &'a FleetRegistry,
    pub fleet: &'a FleetState,
    /// Prior `fleet_policy_candidate` history lines, oldest first.
    pub history: &'a [Value],
    /// Autonomous handoff executions, oldest first.
    pub executions: &'a [ExecutionSample],
    pub now: DateTime<Utc>,
    pub trace_id: &'a str,
}

/// Evaluate the full gate cascade and produce the policy state.
pub fn evaluate_policy(inputs: &PolicyInputs<'_>) -> PolicyState {
    let registry = inputs.registry;
    let policy = &registry.policy;
    let autonomous = &policy.autonomous;
    let rollout = &autonomous.rollout;
    let safety = &autonomous.safety;

    let autopause = evaluate_autopause(inputs.executions, &rollout.autopause);
    let auto_paused = autopause.active || rollout.pause.auto.active;

    let last_execution_at = inputs.executions.iter().filter_map(|s| s.at).max();
    let safety_cooldown_active = safety.cooldown_seconds > 0
        && last_execution_at.is_some_and(|at| {
            inputs.now < at + chrono::Duration::seconds(safety.cooldown_seconds)
        });

    let mut candidates = Vec::new();
    let mut selected_total: u32 = 0;
    let mut selected_by_loop: BTreeMap<String, u32> = BTreeMap::new();

    for (loop_id, category, severity, confidence) in synthesize_candidates(inputs.fleet) {
        let candidate_id = format!("{loop_id}:{}", category.as_str());
        let suppression = evaluate_suppression(
            registry,
            inputs.history,
            &loop_id,
            category,
            &candidate_id,
            inputs.now,
        );
        let intent = recommended_intent(category);

        let mut reasons: Vec<String> = Vec::new();
        let mut gates = GateResults::default();

        // ── policy gates ──
        if policy.mode != PolicyMode::GuardedAuto {
            reasons.push("autonomous_mode_not_guarded_auto".to_string());
        }
        if suppression.suppressed {
            reasons.push("autonomous_candidate_suppressed".to_string());
        }
        if !autonomous.allow.categories.contains(&category) {
            reasons.push("autonomous_category_not_allowed".to_string());
        }
        if !autonomous.allow.intents.contains(&intent) {
            reasons.push("autonomous_intent_not_allowed".to_string());
        }
        if !severity.at_least(&autonomous.thresholds.min_severity) {
            reasons.push("autonomous_severity_below_minimum".to_string());
        }
        if !confidence.at_least(&autonomous.thresholds.min_confidence) {
            reasons.push("autonomous_confidence_below_minimum".to_string());
        }
        gates.policy = reasons.is_empty();

        // ── rollout gates ──
        let selector = select_rollout(&loop_id, rollout);
        let rollout_reasons_before = reasons.len();
        if !selector.in_scope {
            reasons.push("autonomous_rollout_out_of_scope".to_string());
        } else if !selector.in_cohort {
            reasons.push("autonomous_rollout_not_in_cohort".to_string());
        }
        if rollout.pause.manual {
            reasons.push("autonomous_rollout_manual_pause".to_string());
        }
        gates.rollout = reasons.len() == rollout_reasons_before;

        // ── autopause gate ──
        let autopause_reasons_before = reasons.len();
        if auto_paused {
            reasons.push(
                autopause
                    .reason
                    .clone()
                    .unwrap_or_else(|| "autonomous_rollout_auto_paused".to_string()),
            );
        }
        gates.autopause = reasons.len() == autopause_reasons_before;

        // ── safety gates, in order, with greedy budget allocation ──
        let safety_reasons_before = reasons.len();
        let by_loop = selected_by_loop.get(&loop_id).copied().unwrap_or(0);
        let allocation = SafetyAllocation {
            selected_total_before: selected_total,
            selected_by_loop_before: by_loop,
        };
        if safety.kill_switch {
            reasons.push("autonomous_kill_switch_engaged".to_string());
        } else if safety_cooldown_active {
            reasons.push("autonomous_cooldown_active".to_string());
        } else if reasons.is_empty() {
            if selected_total >= safety.max_actions_per_run {
                reasons.push("autonomous_max_actions_per_run_exceeded".to_string());
            } else if by_loop >= safety.max_actions_per_loop {
                reasons.push("autonomous_max_actions_per_loop_exceeded".to_string());
            } else {
                // Candidate survives every gate: consume budget
                selected_total += 1;
                *selected_by_loop.entry(loop_id.clone()).or_insert(0) += 1;
            }
        }
        gates.safety = reasons.len() == safety_reasons_before;

        let eligible = reasons.is_empty();
        candidates.push(PolicyCandidate {
            candidate_id,
            loop_id: loop_id.clone(),
            category,
            severity,
            confidence,
            recommended_intent: intent,
            suppressed: suppression.suppressed,
            suppression_reason: suppression.reason,
            suppression_scope: suppression.scope,
            cooldown: suppression.cooldown,
            autonomous: AutonomyDecision {
                eligible,
                manual_only: !eligible,
                reasons,
                gates,
                safety: allocation,
                rollout: RolloutDecision {
                    selector: Some(selector),
                    pause: PauseDecision {
                        manual: rollout.pause.manual,
                        auto: auto_paused,
                    },
                },
            },
        });
    }

    // ── roll-ups ──
    let mut counters = PolicyCounters::default();
    for candidate in &candidates {
        *counters
            .by_severity
            .entry(format!("{:?}", candidate.severity).to_lowercase())
            .or_insert(0) += 1;
        *counters
            .by_confidence
            .entry(format!("{:?}", candidate.confidence).to_lowercase())
            .or_insert(0) += 1;
        *counters
            .by_category
            .entry(candidate.category.as_str().to_string())
            .or_insert(0) += 1;
        if let Some(reason) = &candidate.suppression_reason {
            *counters.by_suppression_reason.entry(reason.clone()).or_insert(0) += 1;
        }
        for reason in &candidate.autonomous.reasons {
            *counters.by_autonomy_reason.entry(reason.clone()).or_insert(0) += 1;
        }
    }

    let mut reason_codes = Vec::new();
    if candidates.iter().any(|c| !c.suppressed) {
        reason_codes.push("fleet_action_required".to_string());
    }
    if candidates.iter().any(|c| {
        c.autonomous.reasons.iter().any(|r| {
            r == "autonomous_rollout_manual_pause" || r.starts_with("autonomous_autopause")
        })
    }) {
        reason_codes.push("fleet_auto_candidates_paused".to_string());
    }
    if candidates.iter().any(|c| {
        c.autonomous.reasons.iter().any(|r| {
            r == "autonomous_kill_switch_engaged"
                || r == "autonomous_cooldown_active"
                || r == "autonomous_max_actions_per_run_exceeded"
                || r == "autonomous_max_actions_per_loop_exceeded"
        })
    }) {
        reason_codes.push("fleet_auto_candidates_safety_blocked".to_string());
    }

    let eligible_count = candidates.iter().filter(|c| c.autonomous.eligible).count() as u32;

    PolicyState {
        schema_version: SCHEMA_VERSION.to_string(),
        fleet_id: inputs.fleet.fleet_id.clone(),
        mode: policy.mode,
        generated_at: inputs.now,
        trace_id: inputs.trace_id.to_string(),
        candidates,
        counters,
        reason_codes,
        autopause,
        eligible_count,
    }
}

/* ============================= RUN ============================= */

const HISTORY_LOOKBACK_LINES: usize = 500;

/// Run the policy engine against the persisted fleet state, then write the
/// policy state, the per-candidate history lines, and the run telemetry.
pub fn run_policy(ctx: &Context, registry: &FleetRegistry) -> Result<PolicyState> {
    let layout = Layout::new(ctx.repo_root());
    let fleet: FleetState = store::read_json(&layout.fleet_state())?
        .ok_or_else(|| anyhow::anyhow!("fleet state not found; run a fleet reconcile first"))?;

    let history = store::tail_values(
        &layout.fleet_telemetry("policy-history"),
        HISTORY_LOOKBACK_LINES,
    )?;
    let executions = load_execution_window(
        &layout,
        registry.policy.autonomous.rollout.autopause.lookback_executions,
    )?;

    let state = evaluate_policy(&PolicyInputs {
        registry,
        fleet: &fleet,
        history: &history,
        executions: &executions,
        now: ctx.now(),
        trace_id: ctx.trace_id(),
    });

    store::write_json(&layout.fleet_policy_state(), &state)?;
    for candidate in &state.candidates {
        store::append_jsonl(
            &layout.fleet_telemetry("policy-history"),
            &json!({
                "schemaVersion": SCHEMA_VERSION,
                "stage": "fleet_policy_candidate",
                "at": state.generated_at.to_rfc3339(),
                "traceId": &state.trace_id,
                "candidateId": &candidate.candidate_id,
                "loopId": &candidate.loop_id,
                "category": candidate.category,
                "severity": candidate.severity,
                "suppressed": candidate.suppressed,
                "suppressionScope": &candidate.suppression_scope,
                "eligible": candidate.autonomous.eligible,
                "reasons": &candidate.autonomous.reasons,
            }),
        )?;
    }
    store::append_jsonl(
        &layout.fleet_telemetry("policy"),
        &json!({
            "schemaVersion": SCHEMA_VERSION,
            "stage": "fleet_policy",
            "at": state.generated_at.to_rfc3339(),
            "traceId": &state.trace_id,
            "fleetId": &state.fleet_id,
            "mode": state.mode,
            "candidates": state.candidates.len(),
            "eligible": state.eligible_count,
            "reasonCodes": &state.reason_codes,
            "autopauseActive": state.autopause.active,
        }),
    )?;

    info!(
        fleet_id = %state.fleet_id,
        candidates = state.candidates.len(),
        eligible = state.eligible_count,
        "fleet_policy_done"
    );
    Ok(state)
}

/* ============================= TESTS ============================= */
