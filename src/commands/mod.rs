pub mod check;
pub mod fleet;
pub mod handoff;
pub mod horizon;
pub mod policy;
pub mod promotion;
pub mod reconcile;
pub mod version;

use anyhow::Result;
use loop_ops::context::Context;
use loop_ops::registry::{FleetRegistry, validate_registry};
use loop_ops::store::{self, Layout};
use loop_ops::thresholds::{self, ThresholdProfile};

use crate::cli::ThresholdArgs;

/// Load and validate the fleet registry from the artifact tree.
pub fn load_registry(ctx: &Context) -> Result<FleetRegistry> {
    let layout = Layout::new(ctx.repo_root());
    let registry: FleetRegistry = store::read_json(&layout.fleet_registry())?.ok_or_else(|| {
        anyhow::anyhow!(
            "fleet registry not found at {}",
            layout.fleet_registry().display()
        )
    })?;
    validate_registry(&registry, ctx.now())?;
    Ok(registry)
}

/// Resolve the threshold profile from flags, env, and catalog default.
pub fn resolve_thresholds(args: &ThresholdArgs) -> Result<ThresholdProfile> {
    let catalog = thresholds::load_catalog(
        args.thresholds_file.as_deref().map(std::path::Path::new),
    )?;
    thresholds::resolve_profile(&catalog, args.threshold_profile.as_deref())
}

/// Print the pipeline's single JSON object on stdout.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
