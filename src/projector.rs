use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/* ============================= OUTPUT TYPES ============================= */

/// State-machine view of the loop after folding the event slice.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub current_state: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub transition_count: u64,
}

/// Last control invocation observed in the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlObservation {
    pub intent: String,
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
}

/// Tuning profile observation used by the drift tracker.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TuningObservation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation_confidence: Option<f64>,
}

/// Rolled-up projection fields.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub event_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_control: Option<ControlObservation>,

    #[serde(default)]
    pub tuning: TuningObservation,
}

/// Divergence flags raised while folding.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Divergence {
    pub any: bool,
    pub flags: DivergenceFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DivergenceFlags {
    /// A transition event's `from` state did not match the folded state.
    #[serde(default)]
    pub state_mismatch: bool,

    /// The event slice is older than what the snapshot already incorporated.
    #[serde(default)]
    pub stale_snapshot: bool,
}

/// Full projector output.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectedState {
    pub transition: Transition,
    pub projection: Projection,
    pub divergence: Divergence,
}

/* ============================= HELPERS ============================= */

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn time_field(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    str_field(value, key)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/* ============================= PROJECTION ============================= */

/// Fold a runtime snapshot and an ordered event slice into a projected
/// loop state.
///
/// The fold is deterministic: the output is a function of the snapshot and
/// the events up to the cursor, and of nothing else. Unknown event types are
/// ignored. Recognized types: `state_transition`, `status`, `heartbeat`,
/// `control_result`, `tuning`.
pub fn project(snapshot: &Value, events: &[Value]) -> Result<ProjectedState> {
    let Some(snapshot_obj) = snapshot.as_object() else {
        bail!("snapshot is not a JSON object");
    };
    let Some(initial_state) = snapshot_obj.get("state").and_then(Value::as_str) else {
        bail!("snapshot is missing the 'state' field");
    };

    let snapshot_last_event_at = time_field(snapshot, "lastEventAt");

    let mut transition = Transition {
        current_state: initial_state.to_string(),
        previous_state: None,
        changed_at: time_field(snapshot, "stateChangedAt"),
        transition_count: 0,
    };

    let mut projection = Projection {
        status: str_field(snapshot, "status").unwrap_or("unknown").to_string(),
        last_event_at: snapshot_last_event_at,
        last_heartbeat_at: time_field(snapshot, "lastHeartbeatAt"),
        event_count: 0,
        last_control: None,
        tuning: TuningObservation {
            applied: str_field(snapshot, "appliedProfile").map(str::to_string),
            recommended: str_field(snapshot, "recommendedProfile").map(str::to_string),
            recommendation_confidence: snapshot
                .get("recommendationConfidence")
                .and_then(Value::as_f64),
        },
    };

    let mut flags = DivergenceFlags::default();
    let mut last_folded_at: Option<DateTime<Utc>> = None;

    for event in events {
        projection.event_count += 1;
        let at = time_field(event, "at");
        if let Some(at) = at {
            last_folded_at = Some(at);
            if projection.last_event_at.is_none_or(|prev| at > prev) {
                projection.last_event_at = Some(at);
            }
        }

        match str_field(event, "type") {
            Some("state_transition") => {
                let from = str_field(event, "from");
                let to = str_field(event, "to");
                if let Some(to) = to {
                    if from.is_some_and(|f| f != transition.current_state) {
                        flags.state_mismatch = true;
                    }
                    transition.previous_state = Some(transition.current_state.clone());
                    transition.current_state = to.to_string();
                    transition.changed_at = at.or(transition.changed_at);
                    transition.transition_count += 1;
                }
            }
            Some("status") => {
                if let Some(status) = str_field(event, "status") {
                    projection.status = status.to_string();
                }
            }
            Some("heartbeat") => {
                if let Some(at) = at
                    && projection.last_heartbeat_at.is_none_or(|prev| at > prev)
                {
                    projection.last_heartbeat_at = Some(at);
                }
            }
            Some("control_result") => {
                projection.last_control = Some(ControlObservation {
                    intent: str_field(event, "intent").unwrap_or("unknown").to_string(),
                    status: str_field(event, "status").unwrap_or("unknown").to_string(),
                    at,
                });
            }
            Some("tuning") => {
                if let Some(applied) = str_field(event, "applied") {
                    projection.tuning.applied = Some(applied.to_string());
                }
                if let Some(recommended) = str_field(event, "recommended") {
                    projection.tuning.recommended = Some(recommended.to_string());
                }
                if let Some(confidence) =
                    event.get("recommendationConfidence").and_then(Value::as_f64)
                {
                    projection.tuning.recommendation_confidence = Some(confidence);
                }
            }
            _ => {}
        }
    }

    if let (Some(snapshot_at), Some(folded_at)) = (snapshot_last_event_at, last_folded_at)
        && folded_at < snapshot_at
    {
        flags.stale_snapshot = true;
    }

    let any = flags.state_mismatch || flags.stale_snapshot;
    Ok(ProjectedState {
        transition,
        projection,
        divergence: Divergence { any, flags },
    })
}

/* ============================= TESTS ============================= */
