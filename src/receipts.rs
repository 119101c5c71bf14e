use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::context::Context;
use crate::packets::{self, PacketStatus};
use crate::store::{self, Layout};

pub const SCHEMA_VERSION: &str = "v1";

/* ============================= RECEIPT SHAPE ============================= */

/// A validated receipt line.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub schema_version: String,
    pub packet_id: String,
    pub trace_id: String,
    pub status: String,

    #[serde(default)]
    pub receipt_id: Option<String>,

    #[serde(default)]
    pub by: Option<String>,

    #[serde(default)]
    pub reason: Option<String>,
}

const RECEIPT_STATUSES: &[&str] = &["acknowledged", "failed", "escalated", "cancelled"];

/// Parse and shape-check one receipt line.
pub fn parse_receipt(line: &str) -> Result<Receipt, String> {
    let receipt: Receipt = serde_json::from_str(line).map_err(|e| format!("unparseable: {e}"))?;
    if receipt.schema_version != SCHEMA_VERSION {
        return Err(format!("unsupported schemaVersion '{}'", receipt.schema_version));
    }
    if receipt.packet_id.trim().is_empty() {
        return Err("packetId missing".to_string());
    }
    if receipt.trace_id.trim().is_empty() {
        return Err("traceId missing".to_string());
    }
    if !RECEIPT_STATUSES.contains(&receipt.status.as_str()) {
        return Err(format!("unsupported status '{}'", receipt.status));
    }
    Ok(receipt)
}

/// Derive the receipt id: explicit, or a content hash of the raw line.
pub fn derive_receipt_id(receipt: &Receipt, line: &str) -> String {
    match &receipt.receipt_id {
        Some(id) if !id.trim().is_empty() => id.clone(),
        _ => {
            let digest = Sha256::digest(line.as_bytes());
            format!("ack-{digest:x}")
        }
    }
}

/// Map a receipt status to the packet status it drives toward.
pub fn target_status(receipt_status: &str) -> Option<PacketStatus> {
    match receipt_status {
        "acknowledged" => Some(PacketStatus::Acknowledged),
        "failed" => Some(PacketStatus::Failed),
        "escalated" => Some(PacketStatus::Escalated),
        "cancelled" => Some(PacketStatus::Cancelled),
        _ => None,
    }
}

/// Per-status noop rule: an `acknowledged` receipt is a noop once the
/// packet has reached that point of the lattice; failure-side receipts
/// are noops only when the packet already holds that exact status.
pub fn is_noop_for(packet_status: PacketStatus, target: PacketStatus) -> bool {
    if packet_status == target {
        return true;
    }
    if target == PacketStatus::Acknowledged
        && let (Some(have), Some(want)) = (packet_status.lattice_rank(), target.lattice_rank())
    {
        return have >= want;
    }
    false
}

/* ============================= INGEST ============================= */

/// Outcome of one receipt line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptResult {
    pub line: usize,
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_id: Option<String>,
}

/// The single JSON object an ack ingest run prints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckReport {
    pub schema_version: String,
    pub at: DateTime<Utc>,
    pub trace_id: String,
    pub processed: usize,
    pub applied: usize,
    pub noop: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub results: Vec<ReceiptResult>,
}

/// Ingest a stream of receipt lines.
///
/// Duplicate receipt ids are no-ops that surface a `duplicate` result; an
/// `acknowledged` receipt clears the packet's retry state.
pub fn ingest_receipts(ctx: &Context, lines: &[String]) -> Result<AckReport> {
    let layout = Layout::new(ctx.repo_root());
    let now = ctx.now();
    let mut ack_state = packets::load_ack_state(&layout)?;
    let mut retry_state = packets::load_retry_state(&layout)?;
    let mut retry_state_dirty = false;

    let mut results = Vec::new();
    let mut applied = 0usize;
    let mut noop = 0usize;
    let mut duplicates = 0usize;
    let mut invalid = 0usize;

    for (index, line) in lines.iter().enumerate() {
        let line_number = index + 1;
        if line.trim().is_empty() {
            continue;
        }

        let receipt = match parse_receipt(line) {
            Ok(receipt) => receipt,
            Err(reason) => {
                invalid += 1;
                results.push(ReceiptResult {
                    line: line_number,
                    status: "invalid".to_string(),
                    reason: Some(reason),
                    receipt_id: None,
                    packet_id: None,
                });
                continue;
            }
        };
        let receipt_id = derive_receipt_id(&receipt, line);

        if ack_state.processed_keys.contains_key(&receipt_id) {
            duplicates += 1;
            results.push(ReceiptResult {
                line: line_number,
                status: "duplicate".to_string(),
                reason: Some("already_processed".to_string()),
                receipt_id: Some(receipt_id),
                packet_id: Some(receipt.packet_id.clone()),
            });
            continue;
        }

        let Some(mut packet) = packets::load_packet(&layout, &receipt.packet_id)? else {
            invalid += 1;
            results.push(ReceiptResult {
                line: line_number,
                status: "invalid".to_string(),
                reason: Some("packet_not_found".to_string()),
                receipt_id: Some(receipt_id),
                packet_id: Some(receipt.packet_id.clone()),
            });
            continue;
        };
        // Status already shape-checked by parse_receipt
        let Some(target) = target_status(&receipt.status) else {
            continue;
        };

        let outcome = if is_noop_for(packet.status, target) {
            noop += 1;
            "noop"
        } else {
            match packet.transition(target, now, receipt.reason.as_deref()) {
                Ok(_) => {
                    packets::save_packet(&layout, &packet)?;
                    applied += 1;
                    "applied"
                }
                Err(error) => {
                    warn!(
                        packet_id = %receipt.packet_id,
                        receipt_status = %receipt.status,
                        error = %error,
                        "ack_invalid_transition"
                    );
                    invalid += 1;
                    results.push(ReceiptResult {
                        line: line_number,
                        status: "invalid".to_string(),
                        reason: Some("invalid_transition".to_string()),
                        receipt_id: Some(receipt_id),
                        packet_id: Some(receipt.packet_id.clone()),
                    });
                    continue;
                }
            }
        };

        // An ack settles delivery: retries are no longer owed
        if target == PacketStatus::Acknowledged
            && retry_state.packets.remove(&receipt.packet_id).is_some()
        {
            retry_state_dirty = true;
        }

        ack_state.processed_keys.insert(
            receipt_id.clone(),
            packets::ProcessedReceipt {
                at: now,
                packet_id: receipt.packet_id.clone(),
                trace_id: receipt.trace_id.clone(),
                status: receipt.status.clone(),
            },
        );
        store::append_jsonl(
            &layout.horizon_telemetry("ack"),
            &json!({
                "schemaVersion": SCHEMA_VERSION,
                "stage": "horizon_ack",
                "at": now.to_rfc3339(),
                "traceId": ctx.trace_id(),
                "receiptId": &receipt_id,
                "packetId": &receipt.packet_id,
                "receiptStatus": &receipt.status,
                "outcome": outcome,
            }),
        )?;
        results.push(ReceiptResult {
            line: line_number,
            status: outcome.to_string(),
            reason: None,
            receipt_id: Some(receipt_id),
            packet_id: Some(receipt.packet_id),
        });
    }

    packets::save_ack_state(&layout, &ack_state)?;
    if retry_state_dirty {
        packets::save_retry_state(&layout, &retry_state)?;
    }

    let report = AckReport {
        schema_version: SCHEMA_VERSION.to_string(),
        at: now,
        trace_id: ctx.trace_id().to_string(),
        processed: results.len(),
        applied,
        noop,
        duplicates,
        invalid,
        results,
    };
    info!(
        processed = report.processed,
        applied = report.applied,
        duplicates = report.duplicates,
        "horizon_ack_done"
    );
    Ok(report)
}

/// Read a JSONL receipts file and ingest every line.
pub fn ingest_receipts_file(ctx: &Context, path: &std::path::Path) -> Result<AckReport> {
    let lines = store::read_lines(path)?;
    ingest_receipts(ctx, &lines)
}

/* ============================= TESTS ============================= */
