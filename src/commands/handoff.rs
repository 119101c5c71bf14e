use anyhow::Result;
use loop_ops::context::Context;
use loop_ops::handoff::{
    ConfirmationConfig, ControlOutcome, ControlRunner, ExecuteOptions, HandoffIntent,
    HandoffState, LocalProcessRunner, SpriteServiceRunner, execute_handoff, plan_handoff,
};
use loop_ops::policy::PolicyState;
use loop_ops::registry::Transport;
use loop_ops::store::{self, Layout};

use crate::cli::HandoffAction;

/// Routes each intent to the control transport its loop uses.
struct RoutedRunner<'a> {
    local: LocalProcessRunner,
    sprite: SpriteServiceRunner<'a>,
}

impl ControlRunner for RoutedRunner<'_> {
    async fn invoke(&self, intent: &HandoffIntent) -> Result<ControlOutcome> {
        match intent.transport {
            Transport::Local => self.local.invoke(intent).await,
            Transport::SpriteService => self.sprite.invoke(intent).await,
        }
    }
}

pub async fn run(ctx: &Context, action: HandoffAction) -> Result<i32> {
    let layout = Layout::new(ctx.repo_root());
    match action {
        HandoffAction::Plan => {
            let registry = super::load_registry(ctx)?;
            let policy_state: PolicyState = store::read_json(&layout.fleet_policy_state())?
                .ok_or_else(|| {
                    anyhow::anyhow!("policy state not found; run the policy engine first")
                })?;
            let state = plan_handoff(ctx, &registry, &policy_state)?;
            super::print_json(&state)?;
            Ok(0)
        }
        HandoffAction::Execute {
            confirm,
            loop_id,
            intent,
            autonomous,
            control_command,
            timeout_seconds,
            interval_seconds,
        } => {
            let mut state: HandoffState = store::read_json(&layout.fleet_handoff_state())?
                .ok_or_else(|| {
                    anyhow::anyhow!("handoff state not found; run a handoff plan first")
                })?;
            let runner = RoutedRunner {
                local: LocalProcessRunner { command: control_command },
                sprite: SpriteServiceRunner {
                    ctx,
                    confirmation: ConfirmationConfig { timeout_seconds, interval_seconds },
                },
            };
            let options = ExecuteOptions {
                confirm,
                autonomous,
                loop_filter: loop_id,
                intent_filter: intent,
            };
            let summary = execute_handoff(ctx, &mut state, &runner, &options).await?;
            super::print_json(&summary)?;
            Ok(summary.exit_code())
        }
    }
}
