use std::collections::BTreeMap;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::store::{self, Layout};

pub const SCHEMA_VERSION: &str = "v1";

/* ============================= STATUS ============================= */

/// Packet lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PacketStatus {
    Queued,
    Dispatched,
    Acknowledged,
    InProgress,
    Completed,
    Failed,
    Escalated,
    Cancelled,
}

impl PacketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketStatus::Queued => "queued",
            PacketStatus::Dispatched => "dispatched",
            PacketStatus::Acknowledged => "acknowledged",
            PacketStatus::InProgress => "in_progress",
            PacketStatus::Completed => "completed",
            PacketStatus::Failed => "failed",
            PacketStatus::Escalated => "escalated",
            PacketStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states reject every outgoing edge except their self-edge.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PacketStatus::Completed | PacketStatus::Cancelled)
    }

    /// Progress rank along the delivery lattice, used by the ack ingest
    /// noop rules. Failure-side states have no rank.
    pub fn lattice_rank(&self) -> Option<u8> {
        match self {
            PacketStatus::Queued => Some(0),
            PacketStatus::Dispatched => Some(1),
            PacketStatus::Acknowledged => Some(2),
            PacketStatus::InProgress => Some(3),
            PacketStatus::Completed => Some(4),
            _ => None,
        }
    }
}

/* ============================= TRANSITIONS ============================= */

/// Outcome of asking for a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// Self-edge on a settled state: nothing to do.
    Noop,
}

/// The allowed transition digraph.
pub fn transition_allowed(from: PacketStatus, to: PacketStatus) -> bool {
    use PacketStatus::*;
    match (from, to) {
        (Queued, Dispatched) => true,
        (Dispatched, Acknowledged | InProgress | Failed | Escalated) => true,
        (Acknowledged, Completed | InProgress) => true,
        (InProgress, Completed | Failed | Escalated) => true,
        (Failed, Escalated) => true,
        (Escalated, Failed) => true,
        // Any non-terminal state may be cancelled
        (from, Cancelled) => !from.is_terminal(),
        _ => false,
    }
}

/// Self-edges that settle as no-ops rather than errors.
pub fn is_noop_edge(from: PacketStatus, to: PacketStatus) -> bool {
    from == to
        && matches!(
            from,
            PacketStatus::Acknowledged | PacketStatus::Completed | PacketStatus::Cancelled
        )
}

/* ============================= PACKET MODEL ============================= */

/// Packet recipient.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    #[serde(rename = "type")]
    pub recipient_type: String,
    pub id: String,
}

/// One entry in a packet's transition history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub from: PacketStatus,
    pub to: PacketStatus,
    pub at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A cross-loop delivery packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    pub schema_version: String,
    pub packet_id: String,
    pub horizon_ref: String,
    pub trace_id: String,
    pub sender: String,
    pub recipient: Recipient,
    pub intent: String,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,

    pub status: PacketStatus,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Packet {
    /// Attempt a transition. Invalid edges leave the packet untouched.
    pub fn transition(
        &mut self,
        to: PacketStatus,
        now: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<TransitionOutcome> {
        if is_noop_edge(self.status, to) {
            return Ok(TransitionOutcome::Noop);
        }
        if !transition_allowed(self.status, to) {
            bail!(
                "invalid_transition: {} -> {} for packet {}",
                self.status.as_str(),
                to.as_str(),
                self.packet_id
            );
        }
        self.history.push(HistoryEntry {
            from: self.status,
            to,
            at: now,
            reason: reason.map(str::to_string),
        });
        self.status = to;
        self.updated_at = now;
        Ok(TransitionOutcome::Applied)
    }

    /// TTL expiry relative to `now`. A packet without a TTL never expires.
    pub fn ttl_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_seconds
            .is_some_and(|ttl| now >= self.created_at + chrono::Duration::seconds(ttl))
    }
}

/* ============================= PACKET STORE ============================= */

/// Request to mint a new packet.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePacketRequest {
    pub packet_id: String,
    pub horizon_ref: String,
    pub sender: String,
    pub recipient: Recipient,
    pub intent: String,

    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

/// Create a packet in `queued` status. Refuses to overwrite.
pub fn create_packet(ctx: &Context, request: &CreatePacketRequest) -> Result<Packet> {
    let layout = Layout::new(ctx.repo_root());
    let path = layout.packet(&request.packet_id);
    if path.exists() {
        bail!("packet '{}' already exists", request.packet_id);
    }
    if request.packet_id.trim().is_empty() {
        bail!("packetId must not be empty");
    }
    let now = ctx.now();
    let packet = Packet {
        schema_version: SCHEMA_VERSION.to_string(),
        packet_id: request.packet_id.clone(),
        horizon_ref: request.horizon_ref.clone(),
        trace_id: ctx.trace_id().to_string(),
        sender: request.sender.clone(),
        recipient: request.recipient.clone(),
        intent: request.intent.clone(),
        created_at: now,
        ttl_seconds: request.ttl_seconds,
        status: PacketStatus::Queued,
        updated_at: now,
        history: Vec::new(),
    };
    store::write_json(&path, &packet)?;
    Ok(packet)
}

pub fn load_packet(layout: &Layout, packet_id: &str) -> Result<Option<Packet>> {
    store::read_json(&layout.packet(packet_id))
}

pub fn save_packet(layout: &Layout, packet: &Packet) -> Result<()> {
    store::write_json(&layout.packet(&packet.packet_id), packet)
}

/// List every packet on disk, sorted by (createdAt, packetId).
pub fn list_packets(layout: &Layout) -> Result<Vec<Packet>> {
    let dir = layout.packets_dir();
    let mut packets = Vec::new();
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(packets),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(packet) = store::read_json::<Packet>(&path)? {
            packets.push(packet);
        }
    }
    packets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.packet_id.cmp(&b.packet_id)));
    Ok(packets)
}

/* ============================= ACK / RETRY STATE ============================= */

/// One processed receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedReceipt {
    pub at: DateTime<Utc>,
    pub packet_id: String,
    pub trace_id: String,
    pub status: String,
}

/// Idempotent dedupe set over receipt ids. Grows monotonically.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AckState {
    #[serde(default)]
    pub processed_keys: BTreeMap<String, ProcessedReceipt>,
}

/// Retry bookkeeping for one packet.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RetryEntry {
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
}

/// Retry state across all packets.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RetryState {
    #[serde(default)]
    pub packets: BTreeMap<String, RetryEntry>,
}

pub fn load_ack_state(layout: &Layout) -> Result<AckState> {
    Ok(store::read_json(&layout.ack_state())?.unwrap_or_default())
}

pub fn save_ack_state(layout: &Layout, state: &AckState) -> Result<()> {
    store::write_json(&layout.ack_state(), state)
}

pub fn load_retry_state(layout: &Layout) -> Result<RetryState> {
    Ok(store::read_json(&layout.retry_state())?.unwrap_or_default())
}

pub fn save_retry_state(layout: &Layout, state: &RetryState) -> Result<()> {
    store::write_json(&layout.retry_state(), state)
}

/* ============================= TESTS ============================= */
