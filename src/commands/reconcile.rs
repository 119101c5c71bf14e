use anyhow::Result;
use loop_ops::alerts;
use loop_ops::context::Context;
use loop_ops::reconcile::{ReconcileEngine, ReconcileOptions};

use crate::cli::ThresholdArgs;

/// Reconcile one loop, then fan pending escalations out to the alert
/// sinks when alerting is enabled.
pub async fn run(
    ctx: &Context,
    loop_id: &str,
    max_events: Option<usize>,
    threshold_args: &ThresholdArgs,
) -> Result<i32> {
    let registry = super::load_registry(ctx)?;
    let loop_config = registry
        .find_loop(loop_id)
        .ok_or_else(|| anyhow::anyhow!("loop '{loop_id}' is not in the registry"))?;
    if !loop_config.enabled {
        anyhow::bail!("loop '{loop_id}' is disabled");
    }

    let thresholds = super::resolve_thresholds(threshold_args)?;
    let engine = ReconcileEngine::new(ctx, thresholds);
    let outcome = engine
        .reconcile_loop(loop_config, &ReconcileOptions { max_events })
        .await?;

    if alerts_enabled() {
        let roster = alerts::load_roster(None)?;
        alerts::dispatch_pending(ctx, loop_id, &roster).await?;
    }

    super::print_json(&outcome)?;
    Ok(if outcome.status == "success" { 0 } else { 1 })
}

fn alerts_enabled() -> bool {
    std::env::var("OPS_MANAGER_ALERTS_ENABLED")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
