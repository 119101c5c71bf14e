mod common;

use common::{
    fixed_now, guarded_registry, make_context, seed_execution_record, seed_passing_drills,
    write_registry,
};
use loop_ops::apply::{ApplyMode, ApplyRequest, GovernanceInput, PromotionIntent, run_apply};
use loop_ops::context::Context;
use loop_ops::controller::{
    ControllerConfig, ControllerMode, ControllerOptions, PromotionCi, run_controller,
};
use loop_ops::promotion::{PromotionConfig, PromotionDecision, run_promotion_ci};
use loop_ops::registry::FleetRegistry;
use loop_ops::store::{self, Layout};
use std::cell::RefCell;
use tempfile::TempDir;

// ══════════════════════════════════════════════════════════════════
// Promotion integration tests
//
// Exercises the five-gate CI over real telemetry artifacts, the apply
// path with idempotency replay, and the controller's verify-rollback
// loop.
// ══════════════════════════════════════════════════════════════════

fn governance_input() -> GovernanceInput {
    GovernanceInput {
        by: "ops@example.com".to_string(),
        approval_ref: "APPROVAL-IT-2".to_string(),
        rationale: "expand canary after clean window".to_string(),
        review_by: fixed_now() + chrono::Duration::days(14),
    }
}

fn seed_clean_window(ctx: &Context) {
    for hours_ago in 1..=5 {
        seed_execution_record(ctx, hours_ago, 4, 0, 0);
    }
}

#[test]
fn test_ci_promotes_when_everything_is_green() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir);
    let registry = guarded_registry(&["loop-a"]);
    write_registry(&ctx, &registry);
    seed_clean_window(&ctx);
    seed_passing_drills(&ctx);

    let decision = run_promotion_ci(&ctx, &registry, &PromotionConfig::default()).unwrap();
    assert_eq!(decision.summary.decision, "promote");
    assert!(decision.summary.failed_gates.is_empty());

    // Decision artifact and telemetry persisted
    let layout = Layout::new(ctx.repo_root());
    assert!(layout.fleet_promotion_state().exists());
    let telemetry = common::read_fleet_telemetry(&ctx, "promotion");
    assert_eq!(telemetry.len(), 1);
    assert_eq!(telemetry[0]["decision"], "promote");
}

#[test]
fn test_ci_holds_on_ambiguity_rate() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir);
    let registry = guarded_registry(&["loop-a"]);
    write_registry(&ctx, &registry);
    seed_passing_drills(&ctx);
    // 5 runs, attempted 20 with 6 ambiguous: 0.30 > 0.20
    for hours_ago in 1..=5 {
        let ambiguous = if hours_ago <= 3 { 2 } else { 0 };
        seed_execution_record(&ctx, hours_ago, 4, ambiguous, 0);
    }

    let decision = run_promotion_ci(&ctx, &registry, &PromotionConfig::default()).unwrap();
    assert_eq!(decision.summary.decision, "hold");
    assert_eq!(decision.summary.failed_gates, vec!["outcome_reliability".to_string()]);
    assert!(decision
        .summary
        .reason_codes
        .contains(&"promotion_autonomous_ambiguity_rate_exceeded".to_string()));
    assert_eq!(decision.window.attempted, 20);
    assert_eq!(decision.window.ambiguous, 6);
}

#[test]
fn test_ci_holds_on_missing_drills() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir);
    let registry = guarded_registry(&["loop-a"]);
    write_registry(&ctx, &registry);
    seed_clean_window(&ctx);

    let decision = run_promotion_ci(&ctx, &registry, &PromotionConfig::default()).unwrap();
    assert!(decision.summary.failed_gates.contains(&"drill_recency".to_string()));
    for name in loop_ops::promotion::REQUIRED_DRILLS {
        assert!(decision
            .summary
            .reason_codes
            .contains(&format!("promotion_drill_{name}_missing")));
    }
}

#[test]
fn test_apply_then_replay_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir);
    let mut registry = guarded_registry(&["loop-a"]);
    registry.policy.autonomous.rollout.canary_percent = 10;
    write_registry(&ctx, &registry);
    seed_clean_window(&ctx);
    seed_passing_drills(&ctx);

    let decision = run_promotion_ci(&ctx, &registry, &PromotionConfig::default()).unwrap();
    let request = ApplyRequest {
        mode: ApplyMode::Apply,
        intent: PromotionIntent::Expand,
        governance: Some(governance_input()),
        idempotency_key: Some("it-apply-1".to_string()),
    };
    let first = run_apply(&ctx, &registry, &decision, &request).unwrap();
    assert!(first.applied);
    assert_eq!(first.before.canary_percent, 10);
    assert_eq!(first.after.canary_percent, 20);

    let layout = Layout::new(ctx.repo_root());
    let after_first: FleetRegistry =
        store::read_json(&layout.fleet_registry()).unwrap().unwrap();
    let bytes_first = serde_json::to_string(&after_first).unwrap();

    let second = run_apply(&ctx, &after_first, &decision, &request).unwrap();
    assert!(second.replayed);
    let after_second: FleetRegistry =
        store::read_json(&layout.fleet_registry()).unwrap().unwrap();
    assert_eq!(bytes_first, serde_json::to_string(&after_second).unwrap());
}

#[test]
fn test_controller_rolls_back_on_verify_failure() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir);
    let registry = guarded_registry(&["loop-a"]);
    write_registry(&ctx, &registry);

    // Scripted CI: the preview promotes, the verify holds
    struct FlakyCi {
        decisions: RefCell<Vec<&'static str>>,
    }
    impl PromotionCi for FlakyCi {
        fn run(
            &self,
            ctx: &Context,
            _registry: &FleetRegistry,
            _config: &PromotionConfig,
        ) -> anyhow::Result<PromotionDecision> {
            let kind = self.decisions.borrow_mut().remove(0);
            Ok(PromotionDecision {
                schema_version: "v1".to_string(),
                generated_at: ctx.now(),
                trace_id: ctx.trace_id().to_string(),
                summary: loop_ops::promotion::PromotionSummary {
                    decision: kind.to_string(),
                    failed_gates: if kind == "hold" {
                        vec!["outcome_reliability".to_string()]
                    } else {
                        vec![]
                    },
                    reason_codes: vec![],
                },
                gates: Default::default(),
                window: Default::default(),
                fleet_status: None,
            })
        }
    }

    let ci = FlakyCi { decisions: RefCell::new(vec!["promote", "hold"]) };
    let config = ControllerConfig {
        mode: ControllerMode::GuardedApply,
        ..Default::default()
    };
    let run = run_controller(
        &ctx,
        &config,
        &ControllerOptions {
            governance: Some(governance_input()),
            intent: Some(PromotionIntent::Expand),
        },
        &ci,
    )
    .unwrap();

    assert_eq!(run.status, "rolled_back");
    assert!(run.reason_codes.contains(&"controller_rollback_triggered".to_string()));
    assert!(run.apply.is_some());
    assert!(run.rollback.is_some());

    // The registry carries the rollback's manual pause
    let layout = Layout::new(ctx.repo_root());
    let persisted: FleetRegistry =
        store::read_json(&layout.fleet_registry()).unwrap().unwrap();
    assert!(persisted.policy.autonomous.rollout.pause.manual);

    // One controller record with the full story
    let lines = store::read_lines(&layout.fleet_telemetry("promotion-controller")).unwrap();
    assert_eq!(lines.len(), 1);
    let record: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(record["stage"], "promotion_controller_run");
    assert_eq!(record["status"], "rolled_back");
}

#[test]
fn test_controller_budget_blocks_repeat_applies() {
    let dir = TempDir::new().unwrap();
    let ctx = make_context(&dir);
    let registry = guarded_registry(&["loop-a"]);
    write_registry(&ctx, &registry);

    struct AlwaysPromote;
    impl PromotionCi for AlwaysPromote {
        fn run(
            &self,
            ctx: &Context,
            _registry: &FleetRegistry,
            _config: &PromotionConfig,
        ) -> anyhow::Result<PromotionDecision> {
            Ok(PromotionDecision {
                schema_version: "v1".to_string(),
                generated_at: ctx.now(),
                trace_id: ctx.trace_id().to_string(),
                summary: loop_ops::promotion::PromotionSummary {
                    decision: "promote".to_string(),
                    failed_gates: vec![],
                    reason_codes: vec![],
                },
                gates: Default::default(),
                window: Default::default(),
                fleet_status: None,
            })
        }
    }

    let config = ControllerConfig {
        mode: ControllerMode::GuardedApply,
        cooldown_minutes: 60,
        ..Default::default()
    };
    let options = ControllerOptions {
        governance: Some(governance_input()),
        intent: Some(PromotionIntent::Expand),
    };

    let first = run_controller(&ctx, &config, &options, &AlwaysPromote).unwrap();
    assert_eq!(first.status, "applied");

    // Same fixed clock: the cooldown since the first apply is active
    let second = run_controller(&ctx, &config, &options, &AlwaysPromote).unwrap();
    assert_eq!(second.status, "held");
    assert!(second.reason_codes.contains(&"controller_cooldown_active".to_string()));
}
