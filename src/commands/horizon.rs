use std::path::PathBuf;

use anyhow::Result;
use loop_ops::context::Context;
use loop_ops::dispatch::{OrchestratorMode, OrchestratorOptions, run_orchestrator};
use loop_ops::packets::{CreatePacketRequest, Recipient, create_packet};
use loop_ops::receipts::ingest_receipts_file;
use loop_ops::redelivery::{RetryConfig, reconcile_retries};

use crate::cli::{HorizonAction, HorizonSelectionArgs};

fn selection_options(selection: HorizonSelectionArgs, dry_run: bool) -> OrchestratorOptions {
    OrchestratorOptions {
        horizon_filter: selection.horizon,
        recipient_filter: selection.recipient,
        limit: selection.limit,
        dry_run,
        directory_path: selection.directory.map(PathBuf::from),
    }
}

pub fn run(ctx: &Context, action: HorizonAction) -> Result<i32> {
    match action {
        HorizonAction::Create {
            packet_id,
            horizon_ref,
            sender,
            recipient_type,
            recipient_id,
            intent,
            ttl_seconds,
        } => {
            let packet = create_packet(
                ctx,
                &CreatePacketRequest {
                    packet_id,
                    horizon_ref,
                    sender,
                    recipient: Recipient { recipient_type, id: recipient_id },
                    intent,
                    ttl_seconds,
                },
            )?;
            super::print_json(&packet)?;
            Ok(0)
        }
        HorizonAction::Plan { selection } => {
            let report =
                run_orchestrator(ctx, OrchestratorMode::Plan, &selection_options(selection, false))?;
            super::print_json(&report)?;
            Ok(0)
        }
        HorizonAction::Dispatch { selection, dry_run } => {
            let report = run_orchestrator(
                ctx,
                OrchestratorMode::Dispatch,
                &selection_options(selection, dry_run),
            )?;
            let code = if report.failed > 0 { 1 } else { 0 };
            super::print_json(&report)?;
            Ok(code)
        }
        HorizonAction::Ack { file } => {
            let report = ingest_receipts_file(ctx, std::path::Path::new(&file))?;
            let code = if report.invalid > 0 { 1 } else { 0 };
            super::print_json(&report)?;
            Ok(code)
        }
        HorizonAction::Retry {
            ack_timeout_seconds,
            max_retries,
            retry_backoff_seconds,
            directory,
        } => {
            let config = RetryConfig {
                ack_timeout_seconds,
                max_retries,
                retry_backoff_seconds,
                directory_path: directory.map(PathBuf::from),
            };
            let report = reconcile_retries(ctx, &config)?;
            let code = if report.failed > 0 { 1 } else { 0 };
            super::print_json(&report)?;
            Ok(code)
        }
    }
}
