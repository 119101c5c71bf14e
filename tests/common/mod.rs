#![allow(dead_code)]

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use loop_ops::context::{Clock, Context};
use loop_ops::registry::{
    AutonomousAllow, AutonomousThresholds, Category, Confidence, FleetRegistry, Governance,
    Intent, LoopConfig, PolicyConfig, PolicyMode, Severity, Transport,
};
use loop_ops::store::{self, Layout};
use loop_ops::thresholds::{ThresholdProfile, builtin_catalog};
use serde_json::{Value, json};
use tempfile::TempDir;

/// Fixed instant every integration suite pins its clock to.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn make_context(dir: &TempDir) -> Context {
    Context::new(dir.path(), "trace-it").with_clock(Clock::Fixed(fixed_now()))
}

pub fn baseline_thresholds() -> ThresholdProfile {
    builtin_catalog().profiles["baseline"].clone()
}

pub fn make_loop(loop_id: &str) -> LoopConfig {
    LoopConfig {
        loop_id: loop_id.to_string(),
        enabled: true,
        transport: Transport::Local,
        sprite: None,
        service: None,
        metadata: Default::default(),
    }
}

/// A guarded_auto registry with wide-open allow-lists and caps, valid
/// governance, and a full canary.
pub fn guarded_registry(loop_ids: &[&str]) -> FleetRegistry {
    let mut registry = FleetRegistry {
        schema_version: "v1".to_string(),
        fleet_id: "fleet-it".to_string(),
        loops: loop_ids.iter().map(|id| make_loop(id)).collect(),
        policy: PolicyConfig::default(),
    };
    registry.policy.mode = PolicyMode::GuardedAuto;
    registry.policy.autonomous.governance = Some(Governance {
        by: "ops@example.com".to_string(),
        approval_ref: "APPROVAL-IT".to_string(),
        rationale: "integration baseline".to_string(),
        changed_at: fixed_now() - chrono::Duration::days(1),
        review_by: fixed_now() + chrono::Duration::days(30),
    });
    registry.policy.autonomous.allow = AutonomousAllow {
        categories: BTreeSet::from([
            Category::ReconcileFailed,
            Category::HealthCritical,
            Category::HealthDegraded,
        ]),
        intents: vec![Intent::Cancel],
    };
    registry.policy.autonomous.thresholds = AutonomousThresholds {
        min_severity: Severity::Warning,
        min_confidence: Confidence::Medium,
    };
    registry.policy.autonomous.safety.max_actions_per_run = 10;
    registry.policy.autonomous.safety.max_actions_per_loop = 10;
    registry.policy.autonomous.rollout.canary_percent = 100;
    registry
}

pub fn write_registry(ctx: &Context, registry: &FleetRegistry) {
    let layout = Layout::new(ctx.repo_root());
    store::write_json(&layout.fleet_registry(), registry).unwrap();
}

/// Seed a loop's runtime artifacts: a snapshot plus heartbeat events.
pub fn seed_healthy_runtime(ctx: &Context, loop_id: &str) {
    let layout = Layout::new(ctx.repo_root());
    store::write_json(
        &layout.loop_runtime_snapshot(loop_id),
        &json!({
            "schemaVersion": "v1",
            "loopId": loop_id,
            "state": "running",
            "status": "active",
            "lastEventAt": "2026-03-01T11:55:00Z",
            "lastHeartbeatAt": "2026-03-01T11:55:00Z",
        }),
    )
    .unwrap();
    store::append_jsonl(
        &layout.loop_runtime_events(loop_id),
        &json!({"type": "heartbeat", "at": "2026-03-01T11:58:00Z"}),
    )
    .unwrap();
}

/// Seed a runtime whose events are far older than the critical ingest
/// lag so the loop classifies critical.
pub fn seed_stale_runtime(ctx: &Context, loop_id: &str) {
    let layout = Layout::new(ctx.repo_root());
    store::write_json(
        &layout.loop_runtime_snapshot(loop_id),
        &json!({
            "schemaVersion": "v1",
            "loopId": loop_id,
            "state": "running",
            "status": "active",
            "lastEventAt": "2026-02-28T00:00:00Z",
            "lastHeartbeatAt": "2026-02-28T00:00:00Z",
        }),
    )
    .unwrap();
    store::append_jsonl(
        &layout.loop_runtime_events(loop_id),
        &json!({"type": "heartbeat", "at": "2026-02-28T00:00:00Z"}),
    )
    .unwrap();
}

/// Append an autonomous handoff execution record to the telemetry stream.
pub fn seed_execution_record(
    ctx: &Context,
    hours_ago: i64,
    attempted: u64,
    ambiguous: u64,
    failed: u64,
) {
    let layout = Layout::new(ctx.repo_root());
    store::append_jsonl(
        &layout.fleet_telemetry("handoff"),
        &json!({
            "schemaVersion": "v1",
            "stage": "fleet_handoff_execute",
            "at": (fixed_now() - chrono::Duration::hours(hours_ago)).to_rfc3339(),
            "traceId": "trace-seed",
            "autonomous": true,
            "attempted": attempted,
            "executed": attempted - ambiguous - failed,
            "ambiguous": ambiguous,
            "failed": failed,
        }),
    )
    .unwrap();
}

/// Record passing drills for every required drill name.
pub fn seed_passing_drills(ctx: &Context) {
    for name in loop_ops::promotion::REQUIRED_DRILLS {
        loop_ops::promotion::record_drill(ctx, name, "pass", Some("ops@example.com")).unwrap();
    }
}

pub fn read_fleet_telemetry(ctx: &Context, stage: &str) -> Vec<Value> {
    let layout = Layout::new(ctx.repo_root());
    store::read_lines(&layout.fleet_telemetry(stage))
        .unwrap()
        .iter()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}
