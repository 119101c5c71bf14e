use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::context::Context;
use crate::packets::{self, Packet, PacketStatus};
use crate::store::{self, Layout};

pub const SCHEMA_VERSION: &str = "v1";

/* ============================= DIRECTORY ============================= */

/// One routing contact: which adapter delivers to this recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub adapter: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Optional routing directory keyed by `type|id`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    /// When set, recipients without a contact are blocked instead of
    /// falling back to the default outbox route.
    #[serde(default)]
    pub strict: bool,

    #[serde(default)]
    pub contacts: BTreeMap<String, Contact>,
}

pub fn load_directory(path: Option<&Path>) -> Result<Option<Directory>> {
    match path {
        Some(path) => Ok(store::read_json(path)?),
        None => Ok(None),
    }
}

/// A resolved delivery route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub adapter: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

pub const ADAPTER_FILESYSTEM_OUTBOX: &str = "filesystem_outbox";
pub const ADAPTER_STDOUT: &str = "stdout";

/* ============================= PRECONDITIONS ============================= */

/// Why a packet was blocked from dispatch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    PacketCreatedAtInvalid,
    PacketTtlExpired,
    PacketRecipientTypeMissing,
    PacketRecipientIdMissing,
    DirectoryContactNotFound,
    DispatchAdapterInvalid,
    DispatchTargetMissing,
}

/// Resolve the route for one packet, checking every dispatch precondition.
pub fn resolve_route(
    layout: &Layout,
    packet: &Packet,
    directory: Option<&Directory>,
    now: DateTime<Utc>,
) -> Result<Route, BlockReason> {
    if packet.created_at > now {
        return Err(BlockReason::PacketCreatedAtInvalid);
    }
    if packet.ttl_expired(now) {
        return Err(BlockReason::PacketTtlExpired);
    }
    if packet.recipient.recipient_type.trim().is_empty() {
        return Err(BlockReason::PacketRecipientTypeMissing);
    }
    if packet.recipient.id.trim().is_empty() {
        return Err(BlockReason::PacketRecipientIdMissing);
    }

    let key = format!("{}|{}", packet.recipient.recipient_type, packet.recipient.id);
    if let Some(directory) = directory {
        if let Some(contact) = directory.contacts.get(&key) {
            match contact.adapter.as_str() {
                ADAPTER_STDOUT => return Ok(Route { adapter: ADAPTER_STDOUT.to_string(), target: None }),
                ADAPTER_FILESYSTEM_OUTBOX => {
                    let target = contact.target.clone().filter(|t| !t.trim().is_empty());
                    return match target {
                        Some(target) => Ok(Route {
                            adapter: ADAPTER_FILESYSTEM_OUTBOX.to_string(),
                            target: Some(target),
                        }),
                        None => Err(BlockReason::DispatchTargetMissing),
                    };
                }
                _ => return Err(BlockReason::DispatchAdapterInvalid),
            }
        }
        if directory.strict {
            return Err(BlockReason::DirectoryContactNotFound);
        }
    }

    // Default route: filesystem outbox with a synthetic per-recipient path
    let target: PathBuf = layout.outbox(&packet.recipient.recipient_type, &packet.recipient.id);
    Ok(Route {
        adapter: ADAPTER_FILESYSTEM_OUTBOX.to_string(),
        target: Some(target.to_string_lossy().into_owned()),
    })
}

/* ============================= ENVELOPES ============================= */

/// Build the on-wire envelope for one packet dispatch.
pub fn build_envelope(packet: &Packet, route: &Route, category: &str, at: DateTime<Utc>) -> Value {
    json!({
        "schemaVersion": SCHEMA_VERSION,
        "category": category,
        "at": at.to_rfc3339(),
        "packetId": packet.packet_id,
        "horizonRef": packet.horizon_ref,
        "traceId": packet.trace_id,
        "sender": packet.sender,
        "recipient": {
            "type": packet.recipient.recipient_type,
            "id": packet.recipient.id,
        },
        "intent": packet.intent,
        "route": route,
    })
}

/// Write an envelope through its adapter. The stdout adapter returns the
/// envelope for the caller to print instead of persisting it.
pub fn write_envelope(route: &Route, envelope: &Value) -> Result<Option<Value>> {
    match route.adapter.as_str() {
        ADAPTER_STDOUT => Ok(Some(envelope.clone())),
        _ => {
            let target = route
                .target
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("dispatch route has no target"))?;
            store::append_jsonl(Path::new(target), envelope)?;
            Ok(None)
        }
    }
}

/* ============================= ORCHESTRATOR ============================= */

/// Orchestrator mode: plan reports, dispatch mutates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorMode {
    Plan,
    Dispatch,
}

/// Selection and mutation options.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    pub horizon_filter: Option<String>,
    pub recipient_filter: Option<String>,
    pub limit: Option<usize>,
    pub dry_run: bool,
    pub directory_path: Option<PathBuf>,
}

/// Per-packet action in the orchestrator report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketAction {
    pub packet_id: String,
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<BlockReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Value>,
}

/// The single JSON object an orchestrator run prints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorReport {
    pub schema_version: String,
    pub mode: OrchestratorMode,
    pub dry_run: bool,
    pub at: DateTime<Utc>,
    pub trace_id: String,
    pub selected: usize,
    pub dispatched: usize,
    pub blocked: usize,
    pub failed: usize,
    pub actions: Vec<PacketAction>,
}

/// Select queued packets and plan or dispatch them.
pub fn run_orchestrator(
    ctx: &Context,
    mode: OrchestratorMode,
    options: &OrchestratorOptions,
) -> Result<OrchestratorReport> {
    let layout = Layout::new(ctx.repo_root());
    let now = ctx.now();
    let directory = load_directory(options.directory_path.as_deref())?;

    let mut queued: Vec<Packet> = packets::list_packets(&layout)?
        .into_iter()
        .filter(|p| p.status == PacketStatus::Queued)
        .filter(|p| {
            options
                .horizon_filter
                .as_deref()
                .is_none_or(|h| p.horizon_ref == h)
        })
        .filter(|p| {
            options
                .recipient_filter
                .as_deref()
                .is_none_or(|r| p.recipient.id == r)
        })
        .collect();
    if let Some(limit) = options.limit {
        queued.truncate(limit);
    }

    let mut actions = Vec::new();
    let mut dispatched = 0usize;
    let mut blocked = 0usize;
    let mut failed = 0usize;

    for mut packet in queued {
        let route = match resolve_route(&layout, &packet, directory.as_ref(), now) {
            Ok(route) => route,
            Err(reason) => {
                blocked += 1;
                warn!(packet_id = %packet.packet_id, reason = ?reason, "horizon_dispatch_blocked");
                actions.push(PacketAction {
                    packet_id: packet.packet_id.clone(),
                    action: "blocked".to_string(),
                    block_reason: Some(reason),
                    route: None,
                    envelope: None,
                });
                continue;
            }
        };

        if mode == OrchestratorMode::Plan || options.dry_run {
            actions.push(PacketAction {
                packet_id: packet.packet_id.clone(),
                action: "planned".to_string(),
                block_reason: None,
                route: Some(route),
                envelope: None,
            });
            continue;
        }

        packet.transition(PacketStatus::Dispatched, now, Some("horizon_dispatch"))?;
        let envelope = build_envelope(&packet, &route, "horizon_dispatch", now);
        match write_envelope(&route, &envelope) {
            Ok(stdout_envelope) => {
                packets::save_packet(&layout, &packet)?;
                dispatched += 1;
                actions.push(PacketAction {
                    packet_id: packet.packet_id.clone(),
                    action: "dispatched".to_string(),
                    block_reason: None,
                    route: Some(route),
                    envelope: stdout_envelope,
                });
            }
            Err(error) => {
                warn!(packet_id = %packet.packet_id, error = %error, "adapter_write_failed");
                packet.transition(PacketStatus::Failed, now, Some("adapter_write_failed"))?;
                packets::save_packet(&layout, &packet)?;
                failed += 1;
                actions.push(PacketAction {
                    packet_id: packet.packet_id.clone(),
                    action: "failed".to_string(),
                    block_reason: None,
                    route: Some(route),
                    envelope: None,
                });
            }
        }
    }

    let report = OrchestratorReport {
        schema_version: SCHEMA_VERSION.to_string(),
        mode,
        dry_run: options.dry_run,
        at: now,
        trace_id: ctx.trace_id().to_string(),
        selected: actions.len(),
        dispatched,
        blocked,
        failed,
        actions,
    };

    store::append_jsonl(
        &layout.horizon_telemetry("orchestrator"),
        &json!({
            "schemaVersion": SCHEMA_VERSION,
            "stage": "horizon_orchestrator",
            "at": now.to_rfc3339(),
            "traceId": ctx.trace_id(),
            "mode": report.mode,
            "dryRun": report.dry_run,
            "selected": report.selected,
            "dispatched": report.dispatched,
            "blocked": report.blocked,
            "failed": report.failed,
        }),
    )?;

    info!(
        mode = ?report.mode,
        selected = report.selected,
        dispatched = report.dispatched,
        blocked = report.blocked,
        "horizon_orchestrator_done"
    );
    Ok(report)
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Clock;
    use crate::packets::{CreatePacketRequest, Recipient, load_packet};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn make_ctx(dir: &TempDir) -> Context {
        Context::new(dir.path(), "trace-horizon").with_clock(Clock::Fixed(now()))
    }

    fn create(ctx: &Context, packet_id: &str, recipient_id: &str) {
        packets::create_packet(
            ctx,
            &CreatePacketRequest {
                packet_id: packet_id.to_string(),
                horizon_ref: "horizon-1".to_string(),
                sender: "loop-a".to_string(),
                recipient: Recipient {
                    recipient_type: "loop".to_string(),
                    id: recipient_id.to_string(),
                },
                intent: "sync".to_string(),
                ttl_seconds: None,
            },
        )
        .unwrap();
    }

    // ── routing ──

    #[test]
    fn test_default_route_synthetic_outbox() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        create(&ctx, "p1", "loop-b");
        let layout = Layout::new(ctx.repo_root());
        let packet = load_packet(&layout, "p1").unwrap().unwrap();

        let route = resolve_route(&layout, &packet, None, now()).unwrap();
        assert_eq!(route.adapter, ADAPTER_FILESYSTEM_OUTBOX);
        assert!(route.target.unwrap().ends_with("outbox/loop/loop-b.jsonl"));
    }

    #[test]
    fn test_directory_contact_overrides_route() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        create(&ctx, "p1", "loop-b");
        let layout = Layout::new(ctx.repo_root());
        let packet = load_packet(&layout, "p1").unwrap().unwrap();

        let mut directory = Directory::default();
        directory.contacts.insert(
            "loop|loop-b".to_string(),
            Contact { adapter: ADAPTER_STDOUT.to_string(), target: None },
        );
        let route = resolve_route(&layout, &packet, Some(&directory), now()).unwrap();
        assert_eq!(route.adapter, ADAPTER_STDOUT);
    }

    #[test]
    fn test_strict_directory_blocks_unknown_recipient() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        create(&ctx, "p1", "loop-b");
        let layout = Layout::new(ctx.repo_root());
        let packet = load_packet(&layout, "p1").unwrap().unwrap();

        let directory = Directory { strict: true, contacts: BTreeMap::new() };
        let result = resolve_route(&layout, &packet, Some(&directory), now());
        assert_eq!(result.unwrap_err(), BlockReason::DirectoryContactNotFound);
    }

    #[test]
    fn test_unknown_adapter_blocked() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        create(&ctx, "p1", "loop-b");
        let layout = Layout::new(ctx.repo_root());
        let packet = load_packet(&layout, "p1").unwrap().unwrap();

        let mut directory = Directory::default();
        directory.contacts.insert(
            "loop|loop-b".to_string(),
            Contact { adapter: "carrier_pigeon".to_string(), target: None },
        );
        let result = resolve_route(&layout, &packet, Some(&directory), now());
        assert_eq!(result.unwrap_err(), BlockReason::DispatchAdapterInvalid);
    }

    #[test]
    fn test_outbox_contact_without_target_blocked() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        create(&ctx, "p1", "loop-b");
        let layout = Layout::new(ctx.repo_root());
        let packet = load_packet(&layout, "p1").unwrap().unwrap();

        let mut directory = Directory::default();
        directory.contacts.insert(
            "loop|loop-b".to_string(),
            Contact { adapter: ADAPTER_FILESYSTEM_OUTBOX.to_string(), target: None },
        );
        let result = resolve_route(&layout, &packet, Some(&directory), now());
        assert_eq!(result.unwrap_err(), BlockReason::DispatchTargetMissing);
    }

    #[test]
    fn test_ttl_expired_blocked() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let layout = Layout::new(ctx.repo_root());
        packets::create_packet(
            &ctx,
            &CreatePacketRequest {
                packet_id: "p1".to_string(),
                horizon_ref: "h".to_string(),
                sender: "s".to_string(),
                recipient: Recipient { recipient_type: "loop".to_string(), id: "x".to_string() },
                intent: "sync".to_string(),
                ttl_seconds: Some(60),
            },
        )
        .unwrap();
        let packet = load_packet(&layout, "p1").unwrap().unwrap();
        let later = now() + chrono::Duration::seconds(120);
        assert_eq!(
            resolve_route(&layout, &packet, None, later).unwrap_err(),
            BlockReason::PacketTtlExpired
        );
    }

    #[test]
    fn test_missing_recipient_fields_blocked() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let layout = Layout::new(ctx.repo_root());
        create(&ctx, "p1", "loop-b");
        let mut packet = load_packet(&layout, "p1").unwrap().unwrap();
        packet.recipient.recipient_type = String::new();
        assert_eq!(
            resolve_route(&layout, &packet, None, now()).unwrap_err(),
            BlockReason::PacketRecipientTypeMissing
        );
        packet.recipient.recipient_type = "loop".to_string();
        packet.recipient.id = String::new();
        assert_eq!(
            resolve_route(&layout, &packet, None, now()).unwrap_err(),
            BlockReason::PacketRecipientIdMissing
        );
    }

    #[test]
    fn test_future_created_at_blocked() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let layout = Layout::new(ctx.repo_root());
        create(&ctx, "p1", "loop-b");
        let mut packet = load_packet(&layout, "p1").unwrap().unwrap();
        packet.created_at = now() + chrono::Duration::hours(1);
        assert_eq!(
            resolve_route(&layout, &packet, None, now()).unwrap_err(),
            BlockReason::PacketCreatedAtInvalid
        );
    }

    // ── plan / dispatch ──

    #[test]
    fn test_plan_does_not_mutate() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        create(&ctx, "p1", "loop-b");

        let report = run_orchestrator(
            &ctx,
            OrchestratorMode::Plan,
            &OrchestratorOptions::default(),
        )
        .unwrap();
        assert_eq!(report.selected, 1);
        assert_eq!(report.actions[0].action, "planned");

        let layout = Layout::new(ctx.repo_root());
        let packet = load_packet(&layout, "p1").unwrap().unwrap();
        assert_eq!(packet.status, PacketStatus::Queued);
    }

    #[test]
    fn test_dispatch_transitions_and_writes_outbox() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        create(&ctx, "p1", "loop-b");

        let report = run_orchestrator(
            &ctx,
            OrchestratorMode::Dispatch,
            &OrchestratorOptions::default(),
        )
        .unwrap();
        assert_eq!(report.dispatched, 1);

        let layout = Layout::new(ctx.repo_root());
        let packet = load_packet(&layout, "p1").unwrap().unwrap();
        assert_eq!(packet.status, PacketStatus::Dispatched);
        assert_eq!(packet.history.len(), 1);

        let outbox_lines = store::read_lines(&layout.outbox("loop", "loop-b")).unwrap();
        assert_eq!(outbox_lines.len(), 1);
        let envelope: Value = serde_json::from_str(&outbox_lines[0]).unwrap();
        assert_eq!(envelope["packetId"], "p1");
        assert_eq!(envelope["category"], "horizon_dispatch");
    }

    #[test]
    fn test_dry_run_skips_mutation() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        create(&ctx, "p1", "loop-b");

        let options = OrchestratorOptions { dry_run: true, ..Default::default() };
        let report =
            run_orchestrator(&ctx, OrchestratorMode::Dispatch, &options).unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.actions[0].action, "planned");

        let layout = Layout::new(ctx.repo_root());
        assert_eq!(
            load_packet(&layout, "p1").unwrap().unwrap().status,
            PacketStatus::Queued
        );
        assert!(!layout.outbox("loop", "loop-b").exists());
        // The preview run still records telemetry
        let lines = store::read_lines(&layout.horizon_telemetry("orchestrator")).unwrap();
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn test_filters_and_limit() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        create(&ctx, "p1", "loop-b");
        create(&ctx, "p2", "loop-c");
        create(&ctx, "p3", "loop-b");

        let options = OrchestratorOptions {
            recipient_filter: Some("loop-b".to_string()),
            limit: Some(1),
            ..Default::default()
        };
        let report = run_orchestrator(&ctx, OrchestratorMode::Plan, &options).unwrap();
        assert_eq!(report.selected, 1);
        assert_eq!(report.actions[0].packet_id, "p1");
    }

    #[test]
    fn test_stdout_adapter_returns_envelope() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        create(&ctx, "p1", "loop-b");
        let layout = Layout::new(ctx.repo_root());

        let directory_path = dir.path().join("directory.json");
        store::write_json(
            &directory_path,
            &Directory {
                strict: false,
                contacts: BTreeMap::from([(
                    "loop|loop-b".to_string(),
                    Contact { adapter: ADAPTER_STDOUT.to_string(), target: None },
                )]),
            },
        )
        .unwrap();

        let options = OrchestratorOptions {
            directory_path: Some(directory_path),
            ..Default::default()
        };
        let report =
            run_orchestrator(&ctx, OrchestratorMode::Dispatch, &options).unwrap();
        assert_eq!(report.dispatched, 1);
        let envelope = report.actions[0].envelope.as_ref().unwrap();
        assert_eq!(envelope["packetId"], "p1");
        // stdout adapter persists nothing
        assert!(!layout.outbox("loop", "loop-b").exists());
        assert_eq!(
            load_packet(&layout, "p1").unwrap().unwrap().status,
            PacketStatus::Dispatched
        );
    }

    #[test]
    fn test_blocked_packet_stays_queued() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let layout = Layout::new(ctx.repo_root());
        packets::create_packet(
            &ctx,
            &CreatePacketRequest {
                packet_id: "p1".to_string(),
                horizon_ref: "h".to_string(),
                sender: "s".to_string(),
                recipient: Recipient { recipient_type: "loop".to_string(), id: "x".to_string() },
                intent: "sync".to_string(),
                ttl_seconds: Some(0),
            },
        )
        .unwrap();

        let report = run_orchestrator(
            &ctx,
            OrchestratorMode::Dispatch,
            &OrchestratorOptions::default(),
        )
        .unwrap();
        assert_eq!(report.blocked, 1);
        assert_eq!(report.actions[0].block_reason, Some(BlockReason::PacketTtlExpired));
        assert_eq!(
            load_packet(&layout, "p1").unwrap().unwrap().status,
            PacketStatus::Queued
        );
    }
}
