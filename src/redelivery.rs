use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::context::Context;
use crate::dispatch::{self, BlockReason, Route};
use crate::packets::{self, Packet, PacketStatus, RetryEntry, RetryState};
use crate::store::{self, Layout};

pub const SCHEMA_VERSION: &str = "v1";

/* ============================= CONFIG ============================= */

/// Retry reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Age of `updatedAt` beyond which a dispatched packet is owed a retry.
    pub ack_timeout_seconds: i64,
    pub max_retries: u32,
    /// The n-th retry waits `retry_backoff_seconds * n` after the previous.
    pub retry_backoff_seconds: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory_path: Option<PathBuf>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            ack_timeout_seconds: 600,
            max_retries: 3,
            retry_backoff_seconds: 300,
            directory_path: None,
        }
    }
}

/// Whether the backoff before the next retry attempt has elapsed.
pub fn backoff_elapsed(
    entry: &RetryEntry,
    backoff_seconds: i64,
    now: DateTime<Utc>,
) -> bool {
    match entry.last_retry_at {
        None => true,
        Some(at) => {
            let wait = backoff_seconds * (entry.retry_count as i64 + 1);
            now >= at + chrono::Duration::seconds(wait)
        }
    }
}

/* ============================= REPORT ============================= */

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAction {
    pub packet_id: String,
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempt: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The single JSON object a retry reconcile prints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryReport {
    pub schema_version: String,
    pub at: DateTime<Utc>,
    pub trace_id: String,
    pub scanned: usize,
    pub retried: usize,
    pub escalated: usize,
    pub failed: usize,
    pub waiting: usize,
    pub actions: Vec<RetryAction>,
}

/* ============================= RECONCILER ============================= */

/// Scan dispatched packets past the ack timeout: re-deliver while retry
/// budget remains, dead-letter and escalate once it is spent.
pub fn reconcile_retries(ctx: &Context, config: &RetryConfig) -> Result<RetryReport> {
    let layout = Layout::new(ctx.repo_root());
    let now = ctx.now();
    let directory = dispatch::load_directory(config.directory_path.as_deref())?;
    let mut retry_state = packets::load_retry_state(&layout)?;

    let overdue: Vec<Packet> = packets::list_packets(&layout)?
        .into_iter()
        .filter(|p| p.status == PacketStatus::Dispatched)
        .filter(|p| now >= p.updated_at + chrono::Duration::seconds(config.ack_timeout_seconds))
        .collect();

    let mut actions = Vec::new();
    let mut retried = 0usize;
    let mut escalated = 0usize;
    let mut failed = 0usize;
    let mut waiting = 0usize;
    let scanned = overdue.len();

    for mut packet in overdue {
        let entry = retry_state.packets.entry(packet.packet_id.clone()).or_default().clone();

        if entry.retry_count >= config.max_retries {
            // Budget spent: dead-letter and escalate
            packet.transition(PacketStatus::Escalated, now, Some("ack_timeout_exhausted"))?;
            packets::save_packet(&layout, &packet)?;
            retry_state.packets.remove(&packet.packet_id);
            store::append_jsonl(
                &layout.horizon_telemetry("dead-letter"),
                &json!({
                    "schemaVersion": SCHEMA_VERSION,
                    "stage": "horizon_dead_letter",
                    "at": now.to_rfc3339(),
                    "traceId": ctx.trace_id(),
                    "packetId": &packet.packet_id,
                    "horizonRef": &packet.horizon_ref,
                    "recipient": {
                        "type": &packet.recipient.recipient_type,
                        "id": &packet.recipient.id,
                    },
                    "retryCount": entry.retry_count,
                    "reason": "ack_timeout_exhausted",
                }),
            )?;
            warn!(packet_id = %packet.packet_id, "horizon_packet_dead_lettered");
            escalated += 1;
            actions.push(RetryAction {
                packet_id: packet.packet_id.clone(),
                action: "escalated".to_string(),
                retry_attempt: None,
                reason: Some("ack_timeout_exhausted".to_string()),
            });
            continue;
        }

        if !backoff_elapsed(&entry, config.retry_backoff_seconds, now) {
            waiting += 1;
            actions.push(RetryAction {
                packet_id: packet.packet_id.clone(),
                action: "waiting".to_string(),
                retry_attempt: None,
                reason: Some("backoff_pending".to_string()),
            });
            continue;
        }

        let retry_attempt = entry.retry_count + 1;
        let route: Route = match dispatch::resolve_route(&layout, &packet, directory.as_ref(), now)
        {
            Ok(route) => route,
            Err(reason) => {
                // Unroutable on retry behaves like an adapter failure
                retry_route_failure(&layout, ctx, &mut packet, &mut retry_state, now, reason)?;
                failed += 1;
                actions.push(RetryAction {
                    packet_id: packet.packet_id.clone(),
                    action: "failed".to_string(),
                    retry_attempt: Some(retry_attempt),
                    reason: Some(format!("{reason:?}")),
                });
                continue;
            }
        };

        let mut envelope = dispatch::build_envelope(&packet, &route, "horizon_dispatch_retry", now);
        envelope["retryAttempt"] = json!(retry_attempt);

        match dispatch::write_envelope(&route, &envelope) {
            Ok(_) => {
                let state_entry = retry_state.packets.entry(packet.packet_id.clone()).or_default();
                state_entry.retry_count = retry_attempt;
                state_entry.last_retry_at = Some(now);
                store::append_jsonl(
                    &layout.horizon_telemetry("retry"),
                    &json!({
                        "schemaVersion": SCHEMA_VERSION,
                        "stage": "horizon_retry",
                        "at": now.to_rfc3339(),
                        "traceId": ctx.trace_id(),
                        "packetId": &packet.packet_id,
                        "retryAttempt": retry_attempt,
                        "route": &route,
                    }),
                )?;
                retried += 1;
                actions.push(RetryAction {
                    packet_id: packet.packet_id.clone(),
                    action: "retried".to_string(),
                    retry_attempt: Some(retry_attempt),
                    reason: None,
                });
            }
            Err(error) => {
                warn!(packet_id = %packet.packet_id, error = %error, "retry_adapter_write_failed");
                packet.transition(PacketStatus::Failed, now, Some("adapter_write_failed"))?;
                packets::save_packet(&layout, &packet)?;
                retry_state.packets.remove(&packet.packet_id);
                failed += 1;
                actions.push(RetryAction {
                    packet_id: packet.packet_id.clone(),
                    action: "failed".to_string(),
                    retry_attempt: Some(retry_attempt),
                    reason: Some("adapter_write_failed".to_string()),
                });
            }
        }
    }

    packets::save_retry_state(&layout, &retry_state)?;

    let report = RetryReport {
        schema_version: SCHEMA_VERSION.to_string(),
        at: now,
        trace_id: ctx.trace_id().to_string(),
        scanned,
        retried,
        escalated,
        failed,
        waiting,
        actions,
    };
    info!(
        scanned = report.scanned,
        retried = report.retried,
        escalated = report.escalated,
        "horizon_retry_done"
    );
    Ok(report)
}

fn retry_route_failure(
    layout: &Layout,
    _ctx: &Context,
    packet: &mut Packet,
    retry_state: &mut RetryState,
    now: DateTime<Utc>,
    reason: BlockReason,
) -> Result<()> {
    packet.transition(PacketStatus::Failed, now, Some(&format!("{reason:?}")))?;
    packets::save_packet(layout, packet)?;
    retry_state.packets.remove(&packet.packet_id);
    Ok(())
}

/* ============================= TESTS ============================= */
