use anyhow::Result;
use loop_ops::context::Context;
use loop_ops::fleet::{FleetOptions, FleetStatus, reconcile_fleet};

use crate::cli::FleetAction;

pub async fn run(ctx: &Context, action: FleetAction) -> Result<i32> {
    match action {
        FleetAction::Reconcile {
            max_parallel,
            deterministic_order,
            max_events,
            thresholds,
        } => {
            let registry = super::load_registry(ctx)?;
            let profile = super::resolve_thresholds(&thresholds)?;
            let options = FleetOptions {
                max_parallel,
                deterministic_order,
                max_events,
                ..Default::default()
            };
            let state = reconcile_fleet(ctx, &registry, &profile, &options).await?;
            super::print_json(&state)?;
            Ok(match state.status {
                FleetStatus::Success => 0,
                FleetStatus::PartialFailure => 2,
                FleetStatus::Failed => 1,
            })
        }
    }
}
