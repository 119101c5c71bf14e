use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::drift::{self, DriftConfig, DriftState, DriftStatus};
use crate::health::{
    self, HealthState, HealthStatus, HeartbeatFreshness, HeartbeatState, IngestFailure,
    TransportHealth,
};
use crate::projector::{self, ProjectedState};
use crate::registry::{LoopConfig, Transport};
use crate::store::{self, Layout};
use crate::thresholds::ThresholdProfile;
use crate::transport::{RequestConfig, TransportClient};

pub const SCHEMA_VERSION: &str = "v1";

/* ============================= CURSOR ============================= */

/// Read cursor over a loop's append-only event stream.
///
/// The offset never regresses: replaying from offset `k` against a stream
/// of `n >= k` lines is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    #[serde(default)]
    pub event_line_offset: u64,

    #[serde(default)]
    pub event_line_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Cursor {
    /// Advance to a new offset, clamped so the cursor never moves backward.
    pub fn advance(&mut self, offset: u64, count: u64, at: DateTime<Utc>) {
        self.event_line_offset = self.event_line_offset.max(offset);
        self.event_line_count = self.event_line_count.max(count).max(self.event_line_offset);
        self.updated_at = Some(at);
    }
}

/* ============================= OPTIONS & OUTCOME ============================= */

/// Per-invocation reconcile options.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Cap on events ingested this cycle. None ingests everything pending.
    pub max_events: Option<usize>,
}

/// Fleet-level failure classification for a failed loop reconcile.
pub fn fleet_failure_code(failure: IngestFailure) -> &'static str {
    match failure {
        IngestFailure::SnapshotUnavailable | IngestFailure::EventsUnavailable => {
            "missing_runtime_artifacts"
        }
        IngestFailure::ServiceRequestFailed => "transport_unreachable",
        IngestFailure::ServiceResponseInvalid => "invalid_transport_payload",
        IngestFailure::ProjectionFailed => "reconcile_failed",
    }
}

/// Outcome of one per-loop reconcile cycle. Serialized as the single JSON
/// object the loop pipeline prints and the fleet reconciler parses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopReconcileOutcome {
    pub schema_version: String,
    pub loop_id: String,
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest_failure: Option<IngestFailure>,

    pub health_status: HealthStatus,

    #[serde(default)]
    pub reason_codes: Vec<String>,

    pub cursor: Cursor,

    #[serde(default)]
    pub events_ingested: u64,

    #[serde(default)]
    pub divergence: bool,

    #[serde(default)]
    pub escalations_emitted: u32,

    pub heartbeat_freshness: HeartbeatFreshness,

    pub drift_status: DriftStatus,

    pub at: DateTime<Utc>,

    pub trace_id: String,
}

/* ============================= INGEST ============================= */

struct IngestedArtifacts {
    snapshot: Value,
    events: Vec<Value>,
    new_offset: u64,
    new_count: u64,
}

/// Read snapshot + pending events from the loop's local runtime artifacts.
fn ingest_local(
    layout: &Layout,
    loop_id: &str,
    cursor: &Cursor,
    options: &ReconcileOptions,
) -> Result<IngestedArtifacts, IngestFailure> {
    let snapshot: Value = match store::read_json(&layout.loop_runtime_snapshot(loop_id)) {
        Ok(Some(value)) => value,
        Ok(None) => return Err(IngestFailure::SnapshotUnavailable),
        Err(_) => return Err(IngestFailure::ServiceResponseInvalid),
    };

    let events_path = layout.loop_runtime_events(loop_id);
    let lines = match store::read_lines(&events_path) {
        Ok(lines) => lines,
        Err(_) => return Err(IngestFailure::EventsUnavailable),
    };
    if lines.is_empty() && !events_path.exists() {
        return Err(IngestFailure::EventsUnavailable);
    }

    let total = lines.len() as u64;
    let start = (cursor.event_line_offset as usize).min(lines.len());
    let mut slice: Vec<&String> = lines[start..].iter().collect();
    if let Some(cap) = options.max_events {
        slice.truncate(cap);
    }

    let mut events = Vec::with_capacity(slice.len());
    for line in &slice {
        match serde_json::from_str::<Value>(line.as_str()) {
            Ok(value) => events.push(value),
            Err(_) => return Err(IngestFailure::ServiceResponseInvalid),
        }
    }

    let new_offset = start as u64 + events.len() as u64;
    Ok(IngestedArtifacts { snapshot, events, new_offset, new_count: total })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsEnvelope {
    ok: bool,
    #[serde(default)]
    events: Vec<Value>,
    cursor: Cursor,
}

/// Fetch snapshot + pending events from the sprite service.
async fn ingest_sprite(
    client: &TransportClient,
    config: &RequestConfig,
    base_url: &str,
    loop_id: &str,
    cursor: &Cursor,
    options: &ReconcileOptions,
) -> Result<IngestedArtifacts, IngestFailure> {
    let snapshot_url = format!("{base_url}/ops/snapshot?loopId={loop_id}");
    let snapshot = match client.request(Method::GET, &snapshot_url, None, config).await {
        Ok(response) => response.body,
        Err(failure) if failure.status == Some(404) => {
            return Err(IngestFailure::SnapshotUnavailable);
        }
        Err(failure) if failure.invalid_payload => {
            return Err(IngestFailure::ServiceResponseInvalid);
        }
        Err(_) => return Err(IngestFailure::ServiceRequestFailed),
    };

    let mut events_url = format!(
        "{base_url}/ops/events?loopId={loop_id}&cursor={}",
        cursor.event_line_offset
    );
    if let Some(cap) = options.max_events {
        events_url.push_str(&format!("&maxEvents={cap}"));
    }

    let body = match client.request(Method::GET, &events_url, None, config).await {
        Ok(response) => response.body,
        Err(failure) if failure.status == Some(404) => {
            return Err(IngestFailure::EventsUnavailable);
        }
        Err(failure) if failure.invalid_payload => {
            return Err(IngestFailure::ServiceResponseInvalid);
        }
        Err(_) => return Err(IngestFailure::ServiceRequestFailed),
    };

    let envelope: EventsEnvelope =
        serde_json::from_value(body).map_err(|_| IngestFailure::ServiceResponseInvalid)?;
    if !envelope.ok {
        return Err(IngestFailure::ServiceResponseInvalid);
    }

    Ok(IngestedArtifacts {
        snapshot,
        events: envelope.events,
        new_offset: envelope.cursor.event_line_offset,
        new_count: envelope.cursor.event_line_count,
    })
}

/* ============================= ESCALATIONS ============================= */

fn escalation_record(
    ctx: &Context,
    loop_id: &str,
    category: &str,
    reason_codes: &[String],
    details: Value,
) -> Value {
    json!({
        "schemaVersion": SCHEMA_VERSION,
        "at": ctx.now().to_rfc3339(),
        "traceId": ctx.trace_id(),
        "loopId": loop_id,
        "category": category,
        "reasonCodes": reason_codes,
        "details": details,
    })
}

/// Health escalations fire when the status or reason set changed and the
/// new status is away from healthy.
fn health_changed(prior: Option<&HealthState>, current: &HealthState) -> bool {
    if current.status == HealthStatus::Healthy {
        return false;
    }
    match prior {
        None => true,
        Some(prior) => {
            prior.status != current.status || prior.reason_codes != current.reason_codes
        }
    }
}

/* ============================= ENGINE ============================= */

/// Drives one loop's ingest → projection → health → escalation cycle.
pub struct ReconcileEngine<'a> {
    ctx: &'a Context,
    layout: Layout,
    thresholds: ThresholdProfile,
    drift_config: DriftConfig,
}

impl<'a> ReconcileEngine<'a> {
    pub fn new(ctx: &'a Context, thresholds: ThresholdProfile) -> Self {
        Self {
            ctx,
            layout: Layout::new(ctx.repo_root()),
            thresholds,
            drift_config: DriftConfig::default(),
        }
    }

    pub fn with_drift_config(mut self, config: DriftConfig) -> Self {
        self.drift_config = config;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Run one reconcile cycle for a single loop.
    pub async fn reconcile_loop(
        &self,
        loop_config: &LoopConfig,
        options: &ReconcileOptions,
    ) -> Result<LoopReconcileOutcome> {
        let loop_id = loop_config.loop_id.as_str();
        let now = self.ctx.now();
        info!(loop_id, "loop_reconcile_start");

        let cursor: Cursor = store::read_json(&self.layout.loop_cursor(loop_id))?.unwrap_or_default();
        let mut transport_health: TransportHealth =
            store::read_json(&self.layout.loop_health_transport(loop_id))?.unwrap_or_default();
        let prior_health: Option<HealthState> =
            store::read_json(&self.layout.loop_health(loop_id))?;

        let ingested = match loop_config.transport {
            Transport::Local => ingest_local(&self.layout, loop_id, &cursor, options),
            Transport::SpriteService => {
                let service = loop_config.service.clone().unwrap_or_default();
                let base_url = service.base_url.clone().unwrap_or_default();
                let token = service
                    .token_env
                    .as_deref()
                    .and_then(|name| std::env::var(name).ok());
                let request_config = RequestConfig {
                    token,
                    retry_attempts: service.retry_attempts,
                    retry_backoff_seconds: service.retry_backoff_seconds,
                    ..RequestConfig::default()
                };
                let client = TransportClient::new(&request_config)?;
                ingest_sprite(&client, &request_config, &base_url, loop_id, &cursor, options).await
            }
        };

        match ingested {
            Ok(artifacts) => {
                self.reconcile_ingested(loop_config, cursor, transport_health, prior_health, artifacts)
            }
            Err(failure) => {
                warn!(loop_id, code = failure.as_str(), "loop_ingest_failed");
                transport_health.record_failure(failure.as_str(), now);
                store::write_json(&self.layout.loop_health_transport(loop_id), &transport_health)?;

                let inputs = health::HealthInputs {
                    transport_failure_streak: transport_health.failure_streak,
                    ingest_failure: Some(failure),
                    ..Default::default()
                };
                let mut health_state = health::evaluate_health(&inputs, &self.thresholds);
                health_state.evaluated_at = Some(now);

                let mut escalations = 0;
                if health_changed(prior_health.as_ref(), &health_state) {
                    let category = format!("health_{}", health_state.status.as_str());
                    store::append_jsonl(
                        &self.layout.loop_escalations(loop_id),
                        &escalation_record(
                            self.ctx,
                            loop_id,
                            &category,
                            &health_state.reason_codes,
                            json!({"ingestFailure": failure.as_str()}),
                        ),
                    )?;
                    escalations += 1;
                }
                store::write_json(&self.layout.loop_health(loop_id), &health_state)?;

                let outcome = LoopReconcileOutcome {
                    schema_version: SCHEMA_VERSION.to_string(),
                    loop_id: loop_id.to_string(),
                    status: "failed".to_string(),
                    failure_code: Some(fleet_failure_code(failure).to_string()),
                    ingest_failure: Some(failure),
                    health_status: health_state.status,
                    reason_codes: health_state.reason_codes.clone(),
                    cursor,
                    events_ingested: 0,
                    divergence: false,
                    escalations_emitted: escalations,
                    heartbeat_freshness: HeartbeatFreshness::Critical,
                    drift_status: DriftStatus::Inactive,
                    at: now,
                    trace_id: self.ctx.trace_id().to_string(),
                };
                self.append_reconcile_telemetry(loop_id, &outcome)?;
                Ok(outcome)
            }
        }
    }

    fn reconcile_ingested(
        &self,
        loop_config: &LoopConfig,
        mut cursor: Cursor,
        mut transport_health: TransportHealth,
        prior_health: Option<HealthState>,
        artifacts: IngestedArtifacts,
    ) -> Result<LoopReconcileOutcome> {
        let loop_id = loop_config.loop_id.as_str();
        let now = self.ctx.now();
        let events_ingested = artifacts.events.len() as u64;

        let projected: ProjectedState =
            match projector::project(&artifacts.snapshot, &artifacts.events) {
                Ok(projected) => projected,
                Err(error) => {
                    debug!(loop_id, error = %error, "projection_rejected");
                    transport_health.record_failure(IngestFailure::ProjectionFailed.as_str(), now);
                    store::write_json(
                        &self.layout.loop_health_transport(loop_id),
                        &transport_health,
                    )?;

                    let inputs = health::HealthInputs {
                        transport_failure_streak: transport_health.failure_streak,
                        ingest_failure: Some(IngestFailure::ProjectionFailed),
                        ..Default::default()
                    };
                    let mut health_state = health::evaluate_health(&inputs, &self.thresholds);
                    health_state.evaluated_at = Some(now);

                    let mut escalations = 0;
                    if health_changed(prior_health.as_ref(), &health_state) {
                        let category = format!("health_{}", health_state.status.as_str());
                        store::append_jsonl(
                            &self.layout.loop_escalations(loop_id),
                            &escalation_record(
                                self.ctx,
                                loop_id,
                                &category,
                                &health_state.reason_codes,
                                json!({"ingestFailure": "projection_failed"}),
                            ),
                        )?;
                        escalations += 1;
                    }
                    store::write_json(&self.layout.loop_health(loop_id), &health_state)?;

                    let outcome = LoopReconcileOutcome {
                        schema_version: SCHEMA_VERSION.to_string(),
                        loop_id: loop_id.to_string(),
                        status: "failed".to_string(),
                        failure_code: Some(
                            fleet_failure_code(IngestFailure::ProjectionFailed).to_string(),
                        ),
                        ingest_failure: Some(IngestFailure::ProjectionFailed),
                        health_status: health_state.status,
                        reason_codes: health_state.reason_codes.clone(),
                        cursor,
                        events_ingested: 0,
                        divergence: false,
                        escalations_emitted: escalations,
                        heartbeat_freshness: HeartbeatFreshness::Critical,
                        drift_status: DriftStatus::Inactive,
                        at: now,
                        trace_id: self.ctx.trace_id().to_string(),
                    };
                    self.append_reconcile_telemetry(loop_id, &outcome)?;
                    return Ok(outcome);
                }
            };

        // Projection accepted: transport is healthy, cursor advances.
        transport_health.record_success(now);
        store::write_json(&self.layout.loop_health_transport(loop_id), &transport_health)?;

        cursor.advance(artifacts.new_offset, artifacts.new_count, now);
        store::write_json(&self.layout.loop_cursor(loop_id), &cursor)?;
        store::write_json(&self.layout.loop_state(loop_id), &projected)?;

        // Heartbeat freshness
        let heartbeat_lag = projected
            .projection
            .last_heartbeat_at
            .map(|at| (now - at).num_seconds());
        let freshness = health::classify_heartbeat(heartbeat_lag, &self.thresholds);
        let heartbeat = HeartbeatState {
            last_heartbeat_at: projected.projection.last_heartbeat_at,
            lag_seconds: heartbeat_lag,
            freshness,
            observed_at: Some(now),
        };
        store::write_json(&self.layout.loop_heartbeat(loop_id), &heartbeat)?;
        store::append_jsonl(
            &self.layout.loop_telemetry(loop_id, "heartbeat"),
            &json!({
                "schemaVersion": SCHEMA_VERSION,
                "at": now.to_rfc3339(),
                "traceId": self.ctx.trace_id(),
                "loopId": loop_id,
                "lagSeconds": heartbeat_lag,
                "freshness": freshness,
            }),
        )?;

        // Health
        let ingest_lag = projected
            .projection
            .last_event_at
            .map(|at| (now - at).num_seconds());
        let inputs = health::HealthInputs {
            divergence: projected.divergence.any,
            last_control_status: projected
                .projection
                .last_control
                .as_ref()
                .map(|c| c.status.clone()),
            ingest_lag_seconds: ingest_lag,
            transport_failure_streak: transport_health.failure_streak,
            ingest_failure: None,
        };
        let mut health_state = health::evaluate_health(&inputs, &self.thresholds);
        health_state.evaluated_at = Some(now);

        // Escalations
        let mut escalations = 0;
        if projected.divergence.any {
            store::append_jsonl(
                &self.layout.loop_escalations(loop_id),
                &escalation_record(
                    self.ctx,
                    loop_id,
                    "divergence_detected",
                    &health_state.reason_codes,
                    serde_json::to_value(&projected.divergence.flags)?,
                ),
            )?;
            escalations += 1;
        }
        if health_changed(prior_health.as_ref(), &health_state) {
            let category = format!("health_{}", health_state.status.as_str());
            store::append_jsonl(
                &self.layout.loop_escalations(loop_id),
                &escalation_record(
                    self.ctx,
                    loop_id,
                    &category,
                    &health_state.reason_codes,
                    json!({"priorStatus": prior_health.as_ref().map(|h| h.status)}),
                ),
            )?;
            escalations += 1;
        }
        store::write_json(&self.layout.loop_health(loop_id), &health_state)?;

        // Profile drift
        let prior_drift: DriftState =
            store::read_json(&self.layout.loop_profile_drift(loop_id))?.unwrap_or_default();
        let observation = drift::observe(
            &prior_drift,
            &projected.projection.tuning,
            &self.drift_config,
            now,
        );
        if observation.rising_edge {
            store::append_jsonl(
                &self.layout.loop_escalations(loop_id),
                &escalation_record(
                    self.ctx,
                    loop_id,
                    "drift_active",
                    &[],
                    json!({
                        "applied": &observation.state.applied,
                        "recommended": &observation.state.recommended,
                        "mismatchStreak": observation.state.mismatch_streak,
                    }),
                ),
            )?;
            escalations += 1;
        }
        store::write_json(&self.layout.loop_profile_drift(loop_id), &observation.state)?;
        store::append_jsonl(
            &self.layout.loop_telemetry(loop_id, "profile-drift"),
            &json!({
                "schemaVersion": SCHEMA_VERSION,
                "at": now.to_rfc3339(),
                "traceId": self.ctx.trace_id(),
                "loopId": loop_id,
                "status": observation.state.status,
                "mismatchStreak": observation.state.mismatch_streak,
                "risingEdge": observation.rising_edge,
            }),
        )?;

        let outcome = LoopReconcileOutcome {
            schema_version: SCHEMA_VERSION.to_string(),
            loop_id: loop_id.to_string(),
            status: "success".to_string(),
            failure_code: None,
            ingest_failure: None,
            health_status: health_state.status,
            reason_codes: health_state.reason_codes.clone(),
            cursor,
            events_ingested,
            divergence: projected.divergence.any,
            escalations_emitted: escalations,
            heartbeat_freshness: freshness,
            drift_status: observation.state.status,
            at: now,
            trace_id: self.ctx.trace_id().to_string(),
        };
        self.append_reconcile_telemetry(loop_id, &outcome)?;
        info!(
            loop_id,
            health = health_state.status.as_str(),
            events = events_ingested,
            "loop_reconcile_done"
        );
        Ok(outcome)
    }

    fn append_reconcile_telemetry(
        &self,
        loop_id: &str,
        outcome: &LoopReconcileOutcome,
    ) -> Result<()> {
        store::append_jsonl(&self.layout.loop_telemetry(loop_id, "reconcile"), outcome)
            .context("failed to append reconcile telemetry")
    }
}

/* ============================= TESTS ============================= */
