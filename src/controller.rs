use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::apply::{self, ApplyMode, ApplyRecord, ApplyRequest, GovernanceInput, PromotionIntent};
use crate::context::Context;
use crate::promotion::{self, PromotionConfig, PromotionDecision};
use crate::registry::FleetRegistry;
use crate::store::{self, Layout};

pub const SCHEMA_VERSION: &str = "v1";

/* ============================= CONFIG ============================= */

/// A scheduled window during which applies are frozen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreezeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub reason: String,
}

/// Controller operating mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControllerMode {
    #[default]
    ProposeOnly,
    GuardedApply,
}

/// Operational safeguards around the CI + apply pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    #[serde(default)]
    pub mode: ControllerMode,

    pub decision_ttl_minutes: i64,
    pub budget_window_hours: i64,
    pub max_applies_per_window: u32,
    pub max_expand_step_per_window: u32,
    pub cooldown_minutes: i64,

    #[serde(default)]
    pub freeze_windows: Vec<FreezeWindow>,

    #[serde(default)]
    pub promotion: PromotionConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: ControllerMode::ProposeOnly,
            decision_ttl_minutes: 30,
            budget_window_hours: 24,
            max_applies_per_window: 4,
            max_expand_step_per_window: 40,
            cooldown_minutes: 60,
            freeze_windows: Vec::new(),
            promotion: PromotionConfig::default(),
        }
    }
}

/* ============================= CHECK RESULTS ============================= */

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessCheck {
    pub fresh: bool,
    pub age_minutes: i64,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetCheck {
    pub pass: bool,
    pub applies_in_window: u32,
    pub expand_steps_in_window: u32,
    pub max_applies_per_window: u32,
    pub max_expand_step_per_window: u32,
    pub cooldown_ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_apply_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreezeCheck {
    pub active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The single record one controller invocation emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerRun {
    pub schema_version: String,
    pub stage: String,
    pub at: DateTime<Utc>,
    pub trace_id: String,
    pub mode: ControllerMode,
    pub decision: String,
    pub freshness: FreshnessCheck,
    pub budget: BudgetCheck,
    pub freeze: FreezeCheck,
    pub planned_action: String,
    pub status: String,
    pub reason_codes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply: Option<ApplyRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_decision: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<ApplyRecord>,
}

/* ============================= CHECKS ============================= */

/// The decision artifact must be younger than the TTL.
pub fn check_freshness(
    generated_at: DateTime<Utc>,
    ttl_minutes: i64,
    now: DateTime<Utc>,
) -> FreshnessCheck {
    let age_minutes = (now - generated_at).num_minutes();
    FreshnessCheck { fresh: age_minutes <= ttl_minutes, age_minutes, ttl_minutes }
}

/// Count prior mutations inside the budget window and enforce the caps
/// and the cooldown.
pub fn check_budget(
    layout: &Layout,
    config: &ControllerConfig,
    now: DateTime<Utc>,
) -> Result<BudgetCheck> {
    let window_start = now - chrono::Duration::hours(config.budget_window_hours);
    let lines = store::read_lines(&layout.fleet_telemetry("promotion"))?;

    let mut applies_in_window: u32 = 0;
    let mut expand_steps_in_window: u32 = 0;
    let mut last_apply_at: Option<DateTime<Utc>> = None;

    for line in &lines {
        let Ok(value) = serde_json::from_str::<Value>(line) else { continue };
        if value["stage"] != "fleet_promotion_apply" || value["applied"] != true {
            continue;
        }
        let Some(at) = value["at"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
        else {
            continue;
        };
        if last_apply_at.is_none_or(|prev| at > prev) {
            last_apply_at = Some(at);
        }
        if at < window_start {
            continue;
        }
        applies_in_window += 1;
        let before = value["before"]["canaryPercent"].as_u64().unwrap_or(0);
        let after = value["after"]["canaryPercent"].as_u64().unwrap_or(0);
        if after > before {
            expand_steps_in_window += (after - before) as u32;
        }
    }

    let cooldown_ok = last_apply_at.is_none_or(|at| {
        now >= at + chrono::Duration::minutes(config.cooldown_minutes)
    });
    let pass = applies_in_window < config.max_applies_per_window
        && expand_steps_in_window < config.max_expand_step_per_window
        && cooldown_ok;

    Ok(BudgetCheck {
        pass,
        applies_in_window,
        expand_steps_in_window,
        max_applies_per_window: config.max_applies_per_window,
        max_expand_step_per_window: config.max_expand_step_per_window,
        cooldown_ok,
        last_apply_at,
    })
}

/// A freeze is active when `start <= now <= end` for any window.
pub fn check_freeze(windows: &[FreezeWindow], now: DateTime<Utc>) -> FreezeCheck {
    for window in windows {
        if window.start <= now && now <= window.end {
            return FreezeCheck { active: true, reason: Some(window.reason.clone()) };
        }
    }
    FreezeCheck { active: false, reason: None }
}

/* ============================= CI SEAM ============================= */

/// Seam so the verify pass can be driven in tests.
pub trait PromotionCi {
    fn run(
        &self,
        ctx: &Context,
        registry: &FleetRegistry,
        config: &PromotionConfig,
    ) -> Result<PromotionDecision>;
}

/// Production CI: the five-gate evaluator over persisted artifacts.
pub struct DefaultCi;

impl PromotionCi for DefaultCi {
    fn run(
        &self,
        ctx: &Context,
        registry: &FleetRegistry,
        config: &PromotionConfig,
    ) -> Result<PromotionDecision> {
        promotion::run_promotion_ci(ctx, registry, config)
    }
}

/* ============================= CONTROLLER ============================= */

/// Inputs for one controller invocation.
#[derive(Debug, Clone, Default)]
pub struct ControllerOptions {
    pub governance: Option<GovernanceInput>,
    pub intent: Option<PromotionIntent>,
}

/// Run one preview → gate → apply → verify cycle.
pub fn run_controller<C: PromotionCi>(
    ctx: &Context,
    config: &ControllerConfig,
    options: &ControllerOptions,
    ci: &C,
) -> Result<ControllerRun> {
    let layout = Layout::new(ctx.repo_root());
    let now = ctx.now();
    let mut reason_codes: Vec<String> = Vec::new();

    let registry: FleetRegistry = store::read_json(&layout.fleet_registry())?
        .ok_or_else(|| anyhow::anyhow!("fleet registry not found"))?;

    // 1. Preview
    let decision = ci.run(ctx, &registry, &config.promotion)?;
    if !decision.promoted() {
        reason_codes.push("controller_decision_hold".to_string());
    }

    // 2. Freshness
    let freshness = check_freshness(decision.generated_at, config.decision_ttl_minutes, now);
    if !freshness.fresh {
        reason_codes.push("controller_decision_stale".to_string());
    }

    // 3. Budget and cooldown
    let budget = check_budget(&layout, config, now)?;
    if !budget.cooldown_ok {
        reason_codes.push("controller_cooldown_active".to_string());
    }
    if !budget.pass && budget.cooldown_ok {
        reason_codes.push("controller_budget_exhausted".to_string());
    }

    // 4. Freeze windows
    let freeze = check_freeze(&config.freeze_windows, now);
    if freeze.active {
        reason_codes.push("controller_freeze_active".to_string());
    }

    // 5. Planned action
    let can_apply =
        decision.promoted() && freshness.fresh && budget.pass && !freeze.active;
    let planned_action = if config.mode == ControllerMode::ProposeOnly {
        "propose".to_string()
    } else if can_apply {
        "apply".to_string()
    } else {
        "hold".to_string()
    };

    let mut run = ControllerRun {
        schema_version: SCHEMA_VERSION.to_string(),
        stage: "promotion_controller_run".to_string(),
        at: now,
        trace_id: ctx.trace_id().to_string(),
        mode: config.mode,
        decision: decision.summary.decision.clone(),
        freshness,
        budget,
        freeze,
        planned_action: planned_action.clone(),
        status: match planned_action.as_str() {
            "propose" => "proposed".to_string(),
            "hold" => "held".to_string(),
            _ => "applied".to_string(),
        },
        reason_codes,
        apply: None,
        verify_decision: None,
        rollback: None,
    };

    // 6. Apply + verify
    if planned_action == "apply" {
        let intent = options.intent.unwrap_or(PromotionIntent::Expand);
        let record = apply::run_apply(
            ctx,
            &registry,
            &decision,
            &ApplyRequest {
                mode: ApplyMode::Apply,
                intent,
                governance: options.governance.clone(),
                idempotency_key: None,
            },
        )?;
        run.apply = Some(record);

        let mutated: FleetRegistry = store::read_json(&layout.fleet_registry())?
            .ok_or_else(|| anyhow::anyhow!("fleet registry missing after apply"))?;
        let verify = ci.run(ctx, &mutated, &config.promotion)?;
        run.verify_decision = Some(verify.summary.decision.clone());

        if !verify.promoted() {
            warn!(
                verify = %verify.summary.decision,
                "controller_verify_failed_rolling_back"
            );
            let rollback = apply::run_apply(
                ctx,
                &mutated,
                &verify,
                &ApplyRequest {
                    mode: ApplyMode::Rollback,
                    intent: PromotionIntent::Rollback,
                    governance: options.governance.clone(),
                    idempotency_key: None,
                },
            )?;
            run.rollback = Some(rollback);
            run.status = "rolled_back".to_string();
            run.reason_codes.push("controller_rollback_triggered".to_string());
        }
    }

    store::append_jsonl(&layout.fleet_telemetry("promotion-controller"), &run)?;
    write_summary(&layout, &run)?;

    info!(
        status = %run.status,
        planned = %run.planned_action,
        decision = %run.decision,
        "promotion_controller_done"
    );
    Ok(run)
}

/// Human-readable summary. Not authoritative; the telemetry record is.
fn write_summary(layout: &Layout, run: &ControllerRun) -> Result<()> {
    let mut lines = vec![
        "# Promotion controller run".to_string(),
        String::new(),
        format!("- At: {}", run.at.to_rfc3339()),
        format!("- Decision: {}", run.decision),
        format!("- Planned action: {}", run.planned_action),
        format!("- Status: {}", run.status),
    ];
    if !run.reason_codes.is_empty() {
        lines.push(format!("- Reasons: {}", run.reason_codes.join(", ")));
    }
    if let Some(apply) = &run.apply {
        lines.push(format!(
            "- Apply: {} canary {} -> {}",
            apply.intent.as_str(),
            apply.before.canary_percent,
            apply.after.canary_percent
        ));
    }
    if let Some(verify) = &run.verify_decision {
        lines.push(format!("- Verify: {verify}"));
    }
    let path = layout.fleet_summary("promotion-controller");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", lines.join("\n")))?;
    Ok(())
}

/* ============================= TESTS ============================= */
