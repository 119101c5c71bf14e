use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::context::Context;
use crate::drift::DriftConfig;
use crate::health::HealthStatus;
use crate::reconcile::{ReconcileEngine, ReconcileOptions, SCHEMA_VERSION};
use crate::registry::{FleetRegistry, LoopConfig, Transport};
use crate::store::{self, Layout};
use crate::thresholds::ThresholdProfile;

/* ============================= OPTIONS ============================= */

pub const DEFAULT_MAX_PARALLEL: usize = 2;

/// Fleet fan-out options.
#[derive(Debug, Clone)]
pub struct FleetOptions {
    pub max_parallel: usize,
    /// When set, loops are processed sorted by loopId instead of
    /// registry insertion order.
    pub deterministic_order: bool,
    pub max_events: Option<usize>,
    pub drift_config: DriftConfig,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            deterministic_order: false,
            max_events: None,
            drift_config: DriftConfig::default(),
        }
    }
}

/* ============================= RESULT TYPES ============================= */

/// Aggregate fleet status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FleetStatus {
    Success,
    PartialFailure,
    Failed,
}

/// Per-loop entry in the fleet state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopResult {
    pub loop_id: String,
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_status: Option<HealthStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reason_codes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,

    #[serde(default)]
    pub events_ingested: u64,
}

/// Roll-up counters.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FleetCounts {
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// The persisted fleet state artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetState {
    pub schema_version: String,
    pub fleet_id: String,
    pub status: FleetStatus,
    pub reason_codes: Vec<String>,
    pub counts: FleetCounts,
    pub results: Vec<LoopResult>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub trace_id: String,
}

/* ============================= CLASSIFICATION ============================= */

const FAILURE_CODES: &[&str] = &[
    "missing_runtime_artifacts",
    "transport_unreachable",
    "invalid_transport_payload",
    "reconcile_failed",
];

/// Substring fallback classification for unstructured failure text.
pub fn classify_failure_text(text: &str) -> &'static str {
    for code in FAILURE_CODES {
        if text.contains(code) {
            return code;
        }
    }
    "reconcile_failed"
}

/// Pre-flight validation of a sprite_service loop's connection config.
pub fn service_config_failure(loop_config: &LoopConfig) -> Option<&'static str> {
    if loop_config.transport != Transport::SpriteService {
        return None;
    }
    let service = loop_config.service.as_ref();
    let base_url = service.and_then(|s| s.base_url.as_deref()).unwrap_or("");
    if base_url.trim().is_empty() {
        return Some("missing_service_base_url");
    }
    let token_env = service.and_then(|s| s.token_env.as_deref()).unwrap_or("");
    if token_env.trim().is_empty() {
        return Some("missing_service_token_env");
    }
    None
}

/// Aggregate per-loop outcomes into the fleet status.
pub fn aggregate_status(counts: &FleetCounts) -> FleetStatus {
    if counts.failed == 0 {
        FleetStatus::Success
    } else if counts.succeeded == 0 {
        FleetStatus::Failed
    } else {
        FleetStatus::PartialFailure
    }
}

/* ============================= RECONCILER ============================= */

/// Run the per-loop reconcile across every enabled loop with bounded
/// parallelism, then aggregate and persist the fleet state.
pub async fn reconcile_fleet(
    ctx: &Context,
    registry: &FleetRegistry,
    thresholds: &ThresholdProfile,
    options: &FleetOptions,
) -> Result<FleetState> {
    let started_at = ctx.now();
    let layout = Layout::new(ctx.repo_root());

    let mut loops: Vec<&LoopConfig> = registry.loops.iter().collect();
    if options.deterministic_order {
        loops.sort_by(|a, b| a.loop_id.cmp(&b.loop_id));
    }

    info!(
        fleet_id = %registry.fleet_id,
        loops = loops.len(),
        max_parallel = options.max_parallel,
        "fleet_reconcile_start"
    );

    let reconcile_options = ReconcileOptions { max_events: options.max_events };
    let max_parallel = options.max_parallel.max(1);

    let results: Vec<LoopResult> = futures::stream::iter(loops.into_iter().map(|loop_config| {
        let reconcile_options = reconcile_options.clone();
        let drift_config = options.drift_config.clone();
        let thresholds = thresholds.clone();
        async move {
            run_one(ctx, loop_config, thresholds, drift_config, &reconcile_options).await
        }
    }))
    .buffered(max_parallel)
    .collect()
    .await;

    let mut counts = FleetCounts::default();
    let mut reason_codes: Vec<String> = Vec::new();
    for result in &results {
        match result.status.as_str() {
            "success" => counts.succeeded += 1,
            "failed" => {
                counts.failed += 1;
                if let Some(code) = &result.failure_code
                    && !reason_codes.contains(code)
                {
                    reason_codes.push(code.clone());
                }
            }
            _ => counts.skipped += 1,
        }
    }

    let updated_at = ctx.now();
    let state = FleetState {
        schema_version: SCHEMA_VERSION.to_string(),
        fleet_id: registry.fleet_id.clone(),
        status: aggregate_status(&counts),
        reason_codes,
        counts,
        results,
        started_at,
        updated_at,
        duration_seconds: (updated_at - started_at).num_seconds(),
        trace_id: ctx.trace_id().to_string(),
    };

    store::write_json(&layout.fleet_state(), &state)?;
    store::append_jsonl(
        &layout.fleet_telemetry("reconcile"),
        &json!({
            "schemaVersion": SCHEMA_VERSION,
            "stage": "fleet_reconcile",
            "at": updated_at.to_rfc3339(),
            "traceId": ctx.trace_id(),
            "fleetId": &registry.fleet_id,
            "status": state.status,
            "counts": &state.counts,
            "reasonCodes": &state.reason_codes,
            "durationSeconds": state.duration_seconds,
        }),
    )?;

    info!(
        fleet_id = %registry.fleet_id,
        status = ?state.status,
        succeeded = state.counts.succeeded,
        failed = state.counts.failed,
        skipped = state.counts.skipped,
        "fleet_reconcile_done"
    );
    Ok(state)
}

async fn run_one(
    ctx: &Context,
    loop_config: &LoopConfig,
    thresholds: ThresholdProfile,
    drift_config: DriftConfig,
    options: &ReconcileOptions,
) -> LoopResult {
    if !loop_config.enabled {
        return LoopResult {
            loop_id: loop_config.loop_id.clone(),
            status: "skipped".to_string(),
            failure_code: None,
            health_status: None,
            reason_codes: Vec::new(),
            skipped_reason: Some("loop_disabled".to_string()),
            events_ingested: 0,
        };
    }

    if let Some(code) = service_config_failure(loop_config) {
        warn!(loop_id = %loop_config.loop_id, code, "fleet_loop_config_incomplete");
        return LoopResult {
            loop_id: loop_config.loop_id.clone(),
            status: "failed".to_string(),
            failure_code: Some(code.to_string()),
            health_status: None,
            reason_codes: vec![code.to_string()],
            skipped_reason: None,
            events_ingested: 0,
        };
    }

    let engine = ReconcileEngine::new(ctx, thresholds).with_drift_config(drift_config);
    match engine.reconcile_loop(loop_config, options).await {
        Ok(outcome) => LoopResult {
            loop_id: loop_config.loop_id.clone(),
            status: outcome.status.clone(),
            failure_code: outcome.failure_code.clone(),
            health_status: Some(outcome.health_status),
            reason_codes: outcome.reason_codes.clone(),
            skipped_reason: None,
            events_ingested: outcome.events_ingested,
        },
        Err(error) => {
            // No structured outcome came back: classify from the error text
            let code = classify_failure_text(&error.to_string());
            warn!(loop_id = %loop_config.loop_id, error = %error, code, "fleet_loop_errored");
            LoopResult {
                loop_id: loop_config.loop_id.clone(),
                status: "failed".to_string(),
                failure_code: Some(code.to_string()),
                health_status: None,
                reason_codes: vec![code.to_string()],
                skipped_reason: None,
                events_ingested: 0,
            }
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Clock;
    use crate::registry::{PolicyConfig, ServiceConfig};
    use crate::thresholds::builtin_catalog;
    use chrono::TimeZone;
    use serde_json::{Value, json};
    use tempfile::TempDir;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn make_ctx(dir: &TempDir) -> Context {
        Context::new(dir.path(), "trace-fleet").with_clock(Clock::Fixed(fixed_now()))
    }

    fn thresholds() -> ThresholdProfile {
        builtin_catalog().profiles["baseline"].clone()
    }

    fn make_loop(loop_id: &str) -> LoopConfig {
        LoopConfig {
            loop_id: loop_id.to_string(),
            enabled: true,
            transport: Transport::Local,
            sprite: None,
            service: None,
            metadata: Default::default(),
        }
    }

    fn make_registry(loops: Vec<LoopConfig>) -> FleetRegistry {
        FleetRegistry {
            schema_version: "v1".to_string(),
            fleet_id: "fleet-main".to_string(),
            loops,
            policy: PolicyConfig::default(),
        }
    }

    fn seed_runtime(layout: &Layout, loop_id: &str) {
        store::write_json(
            &layout.loop_runtime_snapshot(loop_id),
            &json!({
                "schemaVersion": "v1",
                "state": "running",
                "status": "active",
                "lastEventAt": "2026-03-01T11:58:00Z",
                "lastHeartbeatAt": "2026-03-01T11:58:00Z",
            }),
        )
        .unwrap();
        store::append_jsonl(
            &layout.loop_runtime_events(loop_id),
            &json!({"type": "heartbeat", "at": "2026-03-01T11:59:00Z"}),
        )
        .unwrap();
    }

    // ── classification ──

    #[test]
    fn test_classify_failure_text_known_codes() {
        assert_eq!(
            classify_failure_text("error: missing_runtime_artifacts for loop"),
            "missing_runtime_artifacts"
        );
        assert_eq!(
            classify_failure_text("transport_unreachable after 3 attempts"),
            "transport_unreachable"
        );
        assert_eq!(
            classify_failure_text("body was invalid_transport_payload"),
            "invalid_transport_payload"
        );
    }

    #[test]
    fn test_classify_failure_text_fallback() {
        assert_eq!(classify_failure_text("something else entirely"), "reconcile_failed");
    }

    #[test]
    fn test_service_config_failure_detection() {
        let mut loop_config = make_loop("a");
        loop_config.transport = Transport::SpriteService;
        assert_eq!(service_config_failure(&loop_config), Some("missing_service_base_url"));

        loop_config.service = Some(ServiceConfig {
            base_url: Some("http://localhost:9000".to_string()),
            token_env: None,
            retry_attempts: 1,
            retry_backoff_seconds: 0.0,
        });
        assert_eq!(service_config_failure(&loop_config), Some("missing_service_token_env"));

        loop_config.service.as_mut().unwrap().token_env =
            Some("OPS_MANAGER_SERVICE_TOKEN".to_string());
        assert_eq!(service_config_failure(&loop_config), None);
    }

    #[test]
    fn test_local_loop_never_config_fails() {
        assert_eq!(service_config_failure(&make_loop("a")), None);
    }

    // ── aggregation ──

    #[test]
    fn test_aggregate_all_success() {
        let counts = FleetCounts { succeeded: 3, failed: 0, skipped: 1 };
        assert_eq!(aggregate_status(&counts), FleetStatus::Success);
    }

    #[test]
    fn test_aggregate_mixed_is_partial() {
        let counts = FleetCounts { succeeded: 2, failed: 1, skipped: 0 };
        assert_eq!(aggregate_status(&counts), FleetStatus::PartialFailure);
    }

    #[test]
    fn test_aggregate_all_failed() {
        let counts = FleetCounts { succeeded: 0, failed: 2, skipped: 1 };
        assert_eq!(aggregate_status(&counts), FleetStatus::Failed);
    }

    #[test]
    fn test_aggregate_only_skips_is_success() {
        let counts = FleetCounts { succeeded: 0, failed: 0, skipped: 2 };
        assert_eq!(aggregate_status(&counts), FleetStatus::Success);
    }

    // ── fan-out ──

    #[tokio::test]
    async fn test_fleet_reconcile_success_path() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let layout = Layout::new(ctx.repo_root());
        for id in ["loop-a", "loop-b"] {
            seed_runtime(&layout, id);
        }
        let registry = make_registry(vec![make_loop("loop-a"), make_loop("loop-b")]);

        let state =
            reconcile_fleet(&ctx, &registry, &thresholds(), &FleetOptions::default())
                .await
                .unwrap();
        assert_eq!(state.status, FleetStatus::Success);
        assert_eq!(state.counts.succeeded, 2);
        assert_eq!(state.results.len(), 2);
        assert!(layout.fleet_state().exists());
        let lines = store::read_lines(&layout.fleet_telemetry("reconcile")).unwrap();
        assert_eq!(lines.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_loop_skipped() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let layout = Layout::new(ctx.repo_root());
        seed_runtime(&layout, "loop-a");
        let mut disabled = make_loop("loop-b");
        disabled.enabled = false;
        let registry = make_registry(vec![make_loop("loop-a"), disabled]);

        let state =
            reconcile_fleet(&ctx, &registry, &thresholds(), &FleetOptions::default())
                .await
                .unwrap();
        assert_eq!(state.status, FleetStatus::Success);
        assert_eq!(state.counts.skipped, 1);
        let skipped = state.results.iter().find(|r| r.loop_id == "loop-b").unwrap();
        assert_eq!(skipped.status, "skipped");
        assert_eq!(skipped.skipped_reason.as_deref(), Some("loop_disabled"));
    }

    #[tokio::test]
    async fn test_partial_failure_on_missing_artifacts() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let layout = Layout::new(ctx.repo_root());
        seed_runtime(&layout, "loop-a");
        // loop-b has no runtime artifacts
        let registry = make_registry(vec![make_loop("loop-a"), make_loop("loop-b")]);

        let state =
            reconcile_fleet(&ctx, &registry, &thresholds(), &FleetOptions::default())
                .await
                .unwrap();
        assert_eq!(state.status, FleetStatus::PartialFailure);
        assert!(state.reason_codes.contains(&"missing_runtime_artifacts".to_string()));
        let failed = state.results.iter().find(|r| r.loop_id == "loop-b").unwrap();
        assert_eq!(failed.failure_code.as_deref(), Some("missing_runtime_artifacts"));
    }

    #[tokio::test]
    async fn test_incomplete_sprite_config_classified() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let mut sprite_loop = make_loop("loop-s");
        sprite_loop.transport = Transport::SpriteService;
        let registry = make_registry(vec![sprite_loop]);

        let state =
            reconcile_fleet(&ctx, &registry, &thresholds(), &FleetOptions::default())
                .await
                .unwrap();
        assert_eq!(state.status, FleetStatus::Failed);
        assert_eq!(
            state.results[0].failure_code.as_deref(),
            Some("missing_service_base_url")
        );
    }

    #[tokio::test]
    async fn test_deterministic_order_sorts_results() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let layout = Layout::new(ctx.repo_root());
        for id in ["loop-c", "loop-a", "loop-b"] {
            seed_runtime(&layout, id);
        }
        let registry =
            make_registry(vec![make_loop("loop-c"), make_loop("loop-a"), make_loop("loop-b")]);

        let options = FleetOptions { deterministic_order: true, ..Default::default() };
        let state = reconcile_fleet(&ctx, &registry, &thresholds(), &options).await.unwrap();
        let ids: Vec<&str> = state.results.iter().map(|r| r.loop_id.as_str()).collect();
        assert_eq!(ids, vec!["loop-a", "loop-b", "loop-c"]);
    }

    #[tokio::test]
    async fn test_insertion_order_preserved_by_default() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let layout = Layout::new(ctx.repo_root());
        for id in ["loop-c", "loop-a"] {
            seed_runtime(&layout, id);
        }
        let registry = make_registry(vec![make_loop("loop-c"), make_loop("loop-a")]);

        let state =
            reconcile_fleet(&ctx, &registry, &thresholds(), &FleetOptions::default())
                .await
                .unwrap();
        let ids: Vec<&str> = state.results.iter().map(|r| r.loop_id.as_str()).collect();
        assert_eq!(ids, vec!["loop-c", "loop-a"]);
    }

    #[tokio::test]
    async fn test_deterministic_state_byte_identical_modulo_timestamps() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let layout = Layout::new(ctx.repo_root());
        for id in ["loop-a", "loop-b"] {
            seed_runtime(&layout, id);
        }
        let registry = make_registry(vec![make_loop("loop-a"), make_loop("loop-b")]);
        let options = FleetOptions { deterministic_order: true, ..Default::default() };

        let first = reconcile_fleet(&ctx, &registry, &thresholds(), &options).await.unwrap();
        // Identical inputs: rewind the cursors so the second run replays
        for id in ["loop-a", "loop-b"] {
            store::write_json(&layout.loop_cursor(id), &crate::reconcile::Cursor::default())
                .unwrap();
        }
        let second = reconcile_fleet(&ctx, &registry, &thresholds(), &options).await.unwrap();
        // Fixed clock: the whole state serializes identically
        let a: Value = serde_json::to_value(&first).unwrap();
        let b: Value = serde_json::to_value(&second).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_max_parallel_one_still_completes() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let layout = Layout::new(ctx.repo_root());
        for id in ["loop-a", "loop-b", "loop-c"] {
            seed_runtime(&layout, id);
        }
        let registry =
            make_registry(vec![make_loop("loop-a"), make_loop("loop-b"), make_loop("loop-c")]);
        let options = FleetOptions { max_parallel: 1, ..Default::default() };

        let state = reconcile_fleet(&ctx, &registry, &thresholds(), &options).await.unwrap();
        assert_eq!(state.counts.succeeded, 3);
    }
}
