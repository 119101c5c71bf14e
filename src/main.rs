mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use loop_ops::context::{Context, resolve_trace_id};
use serde_json::json;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = Context::new(cli.repo_root.clone(), resolve_trace_id(cli.trace_id.as_deref()));

    let result = match cli.command {
        Commands::Version => commands::version::run(),
        Commands::Check => commands::check::run(&ctx),
        Commands::Reconcile { loop_id, max_events, thresholds } => {
            commands::reconcile::run(&ctx, &loop_id, max_events, &thresholds).await
        }
        Commands::Fleet { action } => commands::fleet::run(&ctx, action).await,
        Commands::Policy => commands::policy::run(&ctx),
        Commands::Handoff { action } => commands::handoff::run(&ctx, action).await,
        Commands::Promotion { action } => commands::promotion::run(&ctx, action),
        Commands::Drill { name, result, by } => {
            commands::promotion::drill(&ctx, &name, &result, by.as_deref())
        }
        Commands::Horizon { action } => commands::horizon::run(&ctx, action),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            // Nonzero exits still carry a structured failure object
            let failure = json!({
                "status": "error",
                "message": error.to_string(),
                "traceId": ctx.trace_id(),
            });
            println!("{failure}");
            std::process::exit(1);
        }
    }
}
