use anyhow::Result;
use loop_ops::context::Context;
use loop_ops::policy::run_policy;

pub fn run(ctx: &Context) -> Result<i32> {
    let registry = super::load_registry(ctx)?;
    let state = run_policy(ctx, &registry)?;
    super::print_json(&state)?;
    Ok(0)
}
