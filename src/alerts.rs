use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::context::Context;
use crate::store::{self, Layout};
use crate::transport::{RequestConfig, TransportClient};

pub const SCHEMA_VERSION: &str = "v1";

/* ============================= SINK CONFIG ============================= */

/// Alert sink driver kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    FilesystemOutbox,
    Stdout,
    Webhook,
    Slack,
    PagerdutyEvents,
}

/// One configured sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkConfig {
    pub name: String,
    pub kind: SinkKind,

    /// Filesystem target for `filesystem_outbox` sinks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Endpoint for the HTTP-backed sinks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Escalation categories this sink receives. Empty means all.
    #[serde(default)]
    pub categories: BTreeSet<String>,
}

fn default_enabled() -> bool {
    true
}

/// The sink roster file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SinkRoster {
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

/// Load the roster: explicit path, else `OPS_MANAGER_ALERT_SINKS_FILE`,
/// else an empty roster.
pub fn load_roster(explicit: Option<&Path>) -> Result<SinkRoster> {
    let env_path = std::env::var("OPS_MANAGER_ALERT_SINKS_FILE").ok();
    let path = explicit
        .map(|p| p.to_path_buf())
        .or_else(|| env_path.as_deref().map(std::path::PathBuf::from));
    match path {
        Some(path) => Ok(store::read_json(&path)?.unwrap_or_default()),
        None => Ok(SinkRoster::default()),
    }
}

/// Resolve the sinks that should receive an escalation of this category.
pub fn resolve_sinks<'a>(roster: &'a SinkRoster, category: &str) -> Vec<&'a SinkConfig> {
    roster
        .sinks
        .iter()
        .filter(|sink| sink.enabled)
        .filter(|sink| sink.categories.is_empty() || sink.categories.contains(category))
        .collect()
}

/* ============================= DISPATCH ============================= */

/// Deliver one alert envelope through a sink driver.
pub async fn dispatch_to_sink(sink: &SinkConfig, envelope: &Value) -> Result<()> {
    match sink.kind {
        SinkKind::FilesystemOutbox => {
            let target = sink
                .target
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("sink '{}' has no target", sink.name))?;
            store::append_jsonl(Path::new(target), envelope)
        }
        SinkKind::Stdout => {
            println!("{envelope}");
            Ok(())
        }
        SinkKind::Webhook | SinkKind::Slack | SinkKind::PagerdutyEvents => {
            let url = sink
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("sink '{}' has no url", sink.name))?;
            let config = RequestConfig::default();
            let client = TransportClient::new(&config)?;
            client
                .request(Method::POST, url, Some(envelope), &config)
                .await
                .map_err(|failure| anyhow::anyhow!("sink '{}': {}", sink.name, failure))?;
            Ok(())
        }
    }
}

/* ============================= CURSOR & REPORT ============================= */

/// Byte-free line cursor over a loop's escalations stream.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AlertCursor {
    #[serde(default)]
    pub line_offset: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Per-escalation fan-out status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationDispatch {
    pub category: String,
    pub status: String,
    pub sinks: Vec<SinkOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkOutcome {
    pub name: String,
    pub ok: bool,
}

/// The report one alert dispatch run produces for a loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertReport {
    pub schema_version: String,
    pub loop_id: String,
    pub at: DateTime<Utc>,
    pub processed: usize,
    pub dispatched: usize,
    pub partial: usize,
    pub skipped: usize,
    pub failed: usize,
    pub new_offset: u64,
}

/* ============================= RUN ============================= */

/// Advance the alert cursor over a loop's escalations and fan each new
/// line out to the resolved sinks, with partial-failure accounting.
///
/// The cursor is written only after every line up to the new offset has
/// been handled.
pub async fn dispatch_pending(
    ctx: &Context,
    loop_id: &str,
    roster: &SinkRoster,
) -> Result<AlertReport> {
    let layout = Layout::new(ctx.repo_root());
    let now = ctx.now();
    let cursor_path = layout.loop_alerts_cursor(loop_id);
    let mut cursor: AlertCursor = store::read_json(&cursor_path)?.unwrap_or_default();

    let lines = store::read_lines(&layout.loop_escalations(loop_id))?;
    let start = (cursor.line_offset as usize).min(lines.len());
    let pending = &lines[start..];

    let mut dispatched = 0usize;
    let mut partial = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;

    for line in pending {
        let escalation: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        let category = escalation["category"].as_str().unwrap_or("unknown").to_string();
        let sinks = resolve_sinks(roster, &category);

        let status;
        let mut outcomes = Vec::new();
        if sinks.is_empty() {
            status = "skipped";
            skipped += 1;
        } else {
            let envelope = json!({
                "schemaVersion": SCHEMA_VERSION,
                "category": &category,
                "at": now.to_rfc3339(),
                "traceId": ctx.trace_id(),
                "loopId": loop_id,
                "escalation": &escalation,
            });
            let mut ok_count = 0usize;
            for sink in &sinks {
                match dispatch_to_sink(sink, &envelope).await {
                    Ok(()) => {
                        ok_count += 1;
                        outcomes.push(SinkOutcome { name: sink.name.clone(), ok: true });
                    }
                    Err(error) => {
                        warn!(sink = %sink.name, error = %error, "alert_sink_failed");
                        outcomes.push(SinkOutcome { name: sink.name.clone(), ok: false });
                    }
                }
            }
            status = if ok_count == sinks.len() {
                dispatched += 1;
                "dispatched"
            } else if ok_count > 0 {
                partial += 1;
                "partial"
            } else {
                failed += 1;
                "failed"
            };
        }

        store::append_jsonl(
            &layout.loop_telemetry(loop_id, "alerts"),
            &json!({
                "schemaVersion": SCHEMA_VERSION,
                "at": now.to_rfc3339(),
                "traceId": ctx.trace_id(),
                "loopId": loop_id,
                "category": &category,
                "status": status,
                "sinks": &outcomes,
            }),
        )?;
    }

    cursor.line_offset = lines.len() as u64;
    cursor.updated_at = Some(now);
    store::write_json(&cursor_path, &cursor)?;

    let report = AlertReport {
        schema_version: SCHEMA_VERSION.to_string(),
        loop_id: loop_id.to_string(),
        at: now,
        processed: pending.len(),
        dispatched,
        partial,
        skipped,
        failed,
        new_offset: cursor.line_offset,
    };
    info!(
        loop_id,
        processed = report.processed,
        dispatched = report.dispatched,
        "alert_dispatch_done"
    );
    Ok(report)
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Clock;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn make_ctx(dir: &TempDir) -> Context {
        Context::new(dir.path(), "trace-alerts").with_clock(Clock::Fixed(now()))
    }

    fn seed_escalation(layout: &Layout, loop_id: &str, category: &str) {
        store::append_jsonl(
            &layout.loop_escalations(loop_id),
            &json!({
                "schemaVersion": "v1",
                "at": now().to_rfc3339(),
                "loopId": loop_id,
                "category": category,
                "reasonCodes": ["ingest_stale"],
            }),
        )
        .unwrap();
    }

    fn file_sink(dir: &TempDir, name: &str, categories: &[&str]) -> SinkConfig {
        SinkConfig {
            name: name.to_string(),
            kind: SinkKind::FilesystemOutbox,
            target: Some(dir.path().join(format!("{name}.jsonl")).to_string_lossy().into_owned()),
            url: None,
            enabled: true,
            categories: categories.iter().map(|c| c.to_string()).collect(),
        }
    }

    // ── resolution ──

    #[test]
    fn test_resolve_sinks_category_filter() {
        let dir = TempDir::new().unwrap();
        let roster = SinkRoster {
            sinks: vec![
                file_sink(&dir, "all", &[]),
                file_sink(&dir, "critical-only", &["health_critical"]),
            ],
        };
        let for_critical = resolve_sinks(&roster, "health_critical");
        assert_eq!(for_critical.len(), 2);
        let for_drift = resolve_sinks(&roster, "drift_active");
        assert_eq!(for_drift.len(), 1);
        assert_eq!(for_drift[0].name, "all");
    }

    #[test]
    fn test_resolve_sinks_skips_disabled() {
        let dir = TempDir::new().unwrap();
        let mut sink = file_sink(&dir, "off", &[]);
        sink.enabled = false;
        let roster = SinkRoster { sinks: vec![sink] };
        assert!(resolve_sinks(&roster, "health_critical").is_empty());
    }

    // ── dispatch + cursor ──

    #[tokio::test]
    async fn test_dispatch_advances_cursor() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let layout = Layout::new(ctx.repo_root());
        seed_escalation(&layout, "loop-a", "health_critical");
        seed_escalation(&layout, "loop-a", "divergence_detected");
        let roster = SinkRoster { sinks: vec![file_sink(&dir, "ops", &[])] };

        let report = dispatch_pending(&ctx, "loop-a", &roster).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.new_offset, 2);

        let sink_lines =
            store::read_lines(Path::new(roster.sinks[0].target.as_ref().unwrap())).unwrap();
        assert_eq!(sink_lines.len(), 2);

        // Second run sees nothing new
        let report = dispatch_pending(&ctx, "loop-a", &roster).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.new_offset, 2);
    }

    #[tokio::test]
    async fn test_new_escalations_after_cursor_dispatched() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let layout = Layout::new(ctx.repo_root());
        let roster = SinkRoster { sinks: vec![file_sink(&dir, "ops", &[])] };

        seed_escalation(&layout, "loop-a", "health_critical");
        dispatch_pending(&ctx, "loop-a", &roster).await.unwrap();

        seed_escalation(&layout, "loop-a", "drift_active");
        let report = dispatch_pending(&ctx, "loop-a", &roster).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.new_offset, 2);
    }

    #[tokio::test]
    async fn test_no_matching_sink_is_skipped() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let layout = Layout::new(ctx.repo_root());
        seed_escalation(&layout, "loop-a", "drift_active");
        let roster = SinkRoster {
            sinks: vec![file_sink(&dir, "critical-only", &["health_critical"])],
        };

        let report = dispatch_pending(&ctx, "loop-a", &roster).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.dispatched, 0);
        // Cursor still advances past skipped lines
        assert_eq!(report.new_offset, 1);
    }

    #[tokio::test]
    async fn test_partial_failure_accounting() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let layout = Layout::new(ctx.repo_root());
        seed_escalation(&layout, "loop-a", "health_critical");

        // One good filesystem sink, one broken (no target)
        let broken = SinkConfig {
            name: "broken".to_string(),
            kind: SinkKind::FilesystemOutbox,
            target: None,
            url: None,
            enabled: true,
            categories: BTreeSet::new(),
        };
        let roster = SinkRoster { sinks: vec![file_sink(&dir, "ops", &[]), broken] };

        let report = dispatch_pending(&ctx, "loop-a", &roster).await.unwrap();
        assert_eq!(report.partial, 1);
        assert_eq!(report.dispatched, 0);

        let telemetry = store::read_lines(&layout.loop_telemetry("loop-a", "alerts")).unwrap();
        assert_eq!(telemetry.len(), 1);
        let record: Value = serde_json::from_str(&telemetry[0]).unwrap();
        assert_eq!(record["status"], "partial");
    }

    #[tokio::test]
    async fn test_all_sinks_failing_is_failed() {
        let dir = TempDir::new().unwrap();
        let ctx = make_ctx(&dir);
        let layout = Layout::new(ctx.repo_root());
        seed_escalation(&layout, "loop-a", "health_critical");

        let broken = SinkConfig {
            name: "broken".to_string(),
            kind: SinkKind::FilesystemOutbox,
            target: None,
            url: None,
            enabled: true,
            categories: BTreeSet::new(),
        };
        let roster = SinkRoster { sinks: vec![broken] };

        let report = dispatch_pending(&ctx, "loop-a", &roster).await.unwrap();
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn test_roster_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sinks.json");
        let roster = SinkRoster {
            sinks: vec![SinkConfig {
                name: "pd".to_string(),
                kind: SinkKind::PagerdutyEvents,
                target: None,
                url: Some("https://events.pagerduty.example/v2".to_string()),
                enabled: true,
                categories: BTreeSet::from(["health_critical".to_string()]),
            }],
        };
        store::write_json(&path, &roster).unwrap();
        let loaded = load_roster(Some(&path)).unwrap();
        assert_eq!(loaded.sinks.len(), 1);
        assert_eq!(loaded.sinks[0].kind, SinkKind::PagerdutyEvents);
    }
}
