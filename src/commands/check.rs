use anyhow::Result;
use loop_ops::context::Context;
use loop_ops::registry::{FleetRegistry, validate_registry};
use loop_ops::store::{self, Layout};
use loop_ops::thresholds;
use serde_json::json;

/// Walk the configuration surface: registry parse + validation, threshold
/// catalog, and artifact tree presence.
pub fn run(ctx: &Context) -> Result<i32> {
    let layout = Layout::new(ctx.repo_root());
    let mut checks = Vec::new();
    let mut failed = false;

    // 1. Registry parse + validation
    let registry_result: Result<Option<FleetRegistry>> =
        store::read_json(&layout.fleet_registry());
    let (registry_status, registry_detail, registry) = match registry_result {
        Ok(Some(registry)) => match validate_registry(&registry, ctx.now()) {
            Ok(()) => ("ok".to_string(), format!("fleet '{}'", registry.fleet_id), Some(registry)),
            Err(error) => {
                failed = true;
                ("fail".to_string(), error.to_string(), None)
            }
        },
        Ok(None) => {
            failed = true;
            ("fail".to_string(), "registry file not found".to_string(), None)
        }
        Err(error) => {
            failed = true;
            ("fail".to_string(), error.to_string(), None)
        }
    };
    checks.push(json!({"name": "registry", "status": registry_status, "detail": registry_detail}));

    // 2. Threshold catalog resolution
    match thresholds::load_catalog(None)
        .and_then(|catalog| thresholds::resolve_profile(&catalog, None))
    {
        Ok(profile) => checks.push(json!({
            "name": "thresholds",
            "status": "ok",
            "detail": format!(
                "ingest lag degraded/critical {}s/{}s",
                profile.degraded_ingest_lag_seconds, profile.critical_ingest_lag_seconds
            ),
        })),
        Err(error) => {
            failed = true;
            checks.push(json!({"name": "thresholds", "status": "fail", "detail": error.to_string()}));
        }
    }

    // 3. Per-loop artifact presence (informational)
    if let Some(registry) = &registry {
        for loop_config in registry.enabled_loops() {
            let has_state = layout.loop_state(&loop_config.loop_id).exists();
            checks.push(json!({
                "name": format!("loop:{}", loop_config.loop_id),
                "status": if has_state { "ok" } else { "pending" },
                "detail": if has_state { "state artifact present" } else { "not yet reconciled" },
            }));
        }
    }

    super::print_json(&json!({
        "status": if failed { "fail" } else { "ok" },
        "traceId": ctx.trace_id(),
        "checks": checks,
    }))?;
    Ok(if failed { 1 } else { 0 })
}
