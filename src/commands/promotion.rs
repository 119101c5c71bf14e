use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use loop_ops::apply::{ApplyMode, ApplyRequest, GovernanceInput, PromotionIntent, run_apply};
use loop_ops::context::Context;
use loop_ops::controller::{
    ControllerConfig, ControllerMode, ControllerOptions, DefaultCi, run_controller,
};
use loop_ops::promotion::{PromotionConfig, record_drill, run_promotion_ci};
use loop_ops::store;

use crate::cli::{GovernanceArgs, PromotionAction};

fn parse_intent(raw: &str) -> Result<PromotionIntent> {
    match raw {
        "expand" => Ok(PromotionIntent::Expand),
        "resume" => Ok(PromotionIntent::Resume),
        "rollback" => Ok(PromotionIntent::Rollback),
        _ => bail!("unknown promotion intent '{raw}' (expected expand, resume, or rollback)"),
    }
}

fn parse_governance(args: &GovernanceArgs) -> Result<Option<GovernanceInput>> {
    let any = args.by.is_some()
        || args.approval_ref.is_some()
        || args.rationale.is_some()
        || args.review_by.is_some();
    if !any {
        return Ok(None);
    }
    let review_by: DateTime<Utc> = args
        .review_by
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("--review-by is required with governance flags"))?
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid --review-by timestamp: {e}"))?;
    Ok(Some(GovernanceInput {
        by: args.by.clone().unwrap_or_default(),
        approval_ref: args.approval_ref.clone().unwrap_or_default(),
        rationale: args.rationale.clone().unwrap_or_default(),
        review_by,
    }))
}

fn load_promotion_config(path: Option<&str>) -> Result<PromotionConfig> {
    match path {
        Some(path) => Ok(store::read_json(std::path::Path::new(path))?
            .ok_or_else(|| anyhow::anyhow!("promotion config not found: {path}"))?),
        None => Ok(PromotionConfig::default()),
    }
}

pub fn run(ctx: &Context, action: PromotionAction) -> Result<i32> {
    match action {
        PromotionAction::Ci { config } => {
            let registry = super::load_registry(ctx)?;
            let config = load_promotion_config(config.as_deref())?;
            let decision = run_promotion_ci(ctx, &registry, &config)?;
            let code = if decision.promoted() { 0 } else { 1 };
            super::print_json(&decision)?;
            Ok(code)
        }
        PromotionAction::Apply { intent, dry_run, idempotency_key, governance, config } => {
            let registry = super::load_registry(ctx)?;
            let gate_config = load_promotion_config(config.as_deref())?;
            let decision = run_promotion_ci(ctx, &registry, &gate_config)?;
            let record = run_apply(
                ctx,
                &registry,
                &decision,
                &ApplyRequest {
                    mode: if dry_run { ApplyMode::DryRun } else { ApplyMode::Apply },
                    intent: parse_intent(&intent)?,
                    governance: parse_governance(&governance)?,
                    idempotency_key,
                },
            )?;
            super::print_json(&record)?;
            Ok(0)
        }
        PromotionAction::Rollback { governance, config } => {
            let registry = super::load_registry(ctx)?;
            let gate_config = load_promotion_config(config.as_deref())?;
            let decision = run_promotion_ci(ctx, &registry, &gate_config)?;
            let record = run_apply(
                ctx,
                &registry,
                &decision,
                &ApplyRequest {
                    mode: ApplyMode::Rollback,
                    intent: PromotionIntent::Rollback,
                    governance: parse_governance(&governance)?,
                    idempotency_key: None,
                },
            )?;
            super::print_json(&record)?;
            Ok(0)
        }
        PromotionAction::Controller { config, apply, governance } => {
            let mut controller_config: ControllerConfig = match config.as_deref() {
                Some(path) => store::read_json(std::path::Path::new(path))?
                    .ok_or_else(|| anyhow::anyhow!("controller config not found: {path}"))?,
                None => ControllerConfig::default(),
            };
            if apply {
                controller_config.mode = ControllerMode::GuardedApply;
            }
            let options = ControllerOptions {
                governance: parse_governance(&governance)?,
                intent: None,
            };
            let run = run_controller(ctx, &controller_config, &options, &DefaultCi)?;
            let code = match run.status.as_str() {
                "rolled_back" => 2,
                _ => 0,
            };
            super::print_json(&run)?;
            Ok(code)
        }
    }
}

pub fn drill(ctx: &Context, name: &str, result: &str, by: Option<&str>) -> Result<i32> {
    if result != "pass" && result != "fail" {
        bail!("drill result must be 'pass' or 'fail'");
    }
    let state = record_drill(ctx, name, result, by)?;
    super::print_json(&state)?;
    Ok(0)
}
