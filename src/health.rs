use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::thresholds::ThresholdProfile;

/* ============================= STATUS TYPES ============================= */

/// Loop health classification. Severity accumulates by max:
/// healthy < degraded < critical.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn rank(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Critical => 2,
        }
    }

    pub fn escalate(&mut self, to: HealthStatus) {
        if to.rank() > self.rank() {
            *self = to;
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        }
    }
}

/// Heartbeat freshness classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatFreshness {
    #[default]
    Fresh,
    Degraded,
    Critical,
}

/* ============================= INGEST FAILURE ============================= */

/// Classified ingest failure codes from the per-loop reconcile cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IngestFailure {
    SnapshotUnavailable,
    EventsUnavailable,
    ServiceRequestFailed,
    ServiceResponseInvalid,
    ProjectionFailed,
}

impl IngestFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestFailure::SnapshotUnavailable => "snapshot_unavailable",
            IngestFailure::EventsUnavailable => "events_unavailable",
            IngestFailure::ServiceRequestFailed => "service_request_failed",
            IngestFailure::ServiceResponseInvalid => "service_response_invalid",
            IngestFailure::ProjectionFailed => "projection_failed",
        }
    }

    /// Map an ingest failure to the health reason code it surfaces as.
    pub fn health_reason(&self) -> &'static str {
        match self {
            IngestFailure::ServiceRequestFailed => "transport_unreachable",
            IngestFailure::ServiceResponseInvalid => "invalid_transport_payload",
            IngestFailure::ProjectionFailed => "projection_failed",
            IngestFailure::SnapshotUnavailable | IngestFailure::EventsUnavailable => {
                "reconcile_failed"
            }
        }
    }
}

/* ============================= TRANSPORT HEALTH ============================= */

/// Rolling transport health for one loop.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TransportHealth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<String>,

    #[serde(default)]
    pub failure_streak: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl TransportHealth {
    /// Record a successful ingest: streak resets to zero.
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.last_result = Some("success".to_string());
        self.failure_streak = 0;
        self.last_success_at = Some(at);
    }

    /// Record a failed ingest: streak increments, code is retained.
    pub fn record_failure(&mut self, code: &str, at: DateTime<Utc>) {
        self.last_result = Some("failed".to_string());
        self.failure_streak = self.failure_streak.saturating_add(1);
        self.last_failure_code = Some(code.to_string());
        self.last_failure_at = Some(at);
    }
}

/* ============================= HEALTH EVALUATION ============================= */

/// Inputs to one health evaluation.
#[derive(Debug, Clone, Default)]
pub struct HealthInputs {
    pub divergence: bool,
    pub last_control_status: Option<String>,
    pub ingest_lag_seconds: Option<i64>,
    pub transport_failure_streak: u32,
    pub ingest_failure: Option<IngestFailure>,
}

/// Persisted health artifact for one loop.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HealthState {
    pub status: HealthStatus,
    pub reason_codes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest_lag_seconds: Option<i64>,

    #[serde(default)]
    pub transport_failure_streak: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluated_at: Option<DateTime<Utc>>,
}

/// Apply the health rule table. Severity accumulates by max; reason codes
/// are collected in rule order and deduplicated.
pub fn evaluate_health(inputs: &HealthInputs, thresholds: &ThresholdProfile) -> HealthState {
    let mut status = HealthStatus::Healthy;
    let mut reasons: Vec<String> = Vec::new();

    let mut raise = |status: &mut HealthStatus, to: HealthStatus, reason: &str| {
        status.escalate(to);
        if !reasons.iter().any(|r| r == reason) {
            reasons.push(reason.to_string());
        }
    };

    if inputs.divergence {
        raise(&mut status, HealthStatus::Degraded, "divergence_detected");
    }

    match inputs.last_control_status.as_deref() {
        Some("ambiguous") => raise(&mut status, HealthStatus::Degraded, "control_ambiguous"),
        Some("failed_command") => {
            raise(&mut status, HealthStatus::Degraded, "control_failed_command")
        }
        _ => {}
    }

    if let Some(lag) = inputs.ingest_lag_seconds {
        if lag >= thresholds.critical_ingest_lag_seconds {
            raise(&mut status, HealthStatus::Critical, "ingest_stale");
        } else if lag >= thresholds.degraded_ingest_lag_seconds {
            raise(&mut status, HealthStatus::Degraded, "ingest_stale");
        }
    }

    if inputs.transport_failure_streak >= thresholds.critical_transport_failure_streak {
        raise(&mut status, HealthStatus::Critical, "transport_unreachable");
    } else if inputs.transport_failure_streak >= thresholds.degraded_transport_failure_streak {
        raise(&mut status, HealthStatus::Degraded, "transport_unreachable");
    }

    if let Some(failure) = inputs.ingest_failure {
        raise(&mut status, HealthStatus::Degraded, failure.health_reason());
    }

    HealthState {
        status,
        reason_codes: reasons,
        ingest_lag_seconds: inputs.ingest_lag_seconds,
        transport_failure_streak: inputs.transport_failure_streak,
        evaluated_at: None,
    }
}

/* ============================= HEARTBEAT ============================= */

/// Persisted heartbeat artifact for one loop.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lag_seconds: Option<i64>,

    pub freshness: HeartbeatFreshness,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

/// Classify heartbeat freshness from the lag and threshold profile.
/// A missing heartbeat is critical.
pub fn classify_heartbeat(
    lag_seconds: Option<i64>,
    thresholds: &ThresholdProfile,
) -> HeartbeatFreshness {
    match lag_seconds {
        None => HeartbeatFreshness::Critical,
        Some(lag) if lag >= thresholds.critical_heartbeat_lag_seconds => {
            HeartbeatFreshness::Critical
        }
        Some(lag) if lag >= thresholds.degraded_heartbeat_lag_seconds => {
            HeartbeatFreshness::Degraded
        }
        Some(_) => HeartbeatFreshness::Fresh,
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thresholds::builtin_catalog;
    use chrono::TimeZone;

    fn thresholds() -> ThresholdProfile {
        builtin_catalog().profiles["baseline"].clone()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    // ── status escalation ──

    #[test]
    fn test_escalate_only_raises() {
        let mut status = HealthStatus::Degraded;
        status.escalate(HealthStatus::Healthy);
        assert_eq!(status, HealthStatus::Degraded);
        status.escalate(HealthStatus::Critical);
        assert_eq!(status, HealthStatus::Critical);
        status.escalate(HealthStatus::Degraded);
        assert_eq!(status, HealthStatus::Critical);
    }

    // ── rule table ──

    #[test]
    fn test_no_findings_is_healthy() {
        let state = evaluate_health(&HealthInputs::default(), &thresholds());
        assert_eq!(state.status, HealthStatus::Healthy);
        assert!(state.reason_codes.is_empty());
    }

    #[test]
    fn test_divergence_degrades() {
        let inputs = HealthInputs { divergence: true, ..Default::default() };
        let state = evaluate_health(&inputs, &thresholds());
        assert_eq!(state.status, HealthStatus::Degraded);
        assert_eq!(state.reason_codes, vec!["divergence_detected"]);
    }

    #[test]
    fn test_ambiguous_control_degrades() {
        let inputs = HealthInputs {
            last_control_status: Some("ambiguous".to_string()),
            ..Default::default()
        };
        let state = evaluate_health(&inputs, &thresholds());
        assert_eq!(state.status, HealthStatus::Degraded);
        assert_eq!(state.reason_codes, vec!["control_ambiguous"]);
    }

    #[test]
    fn test_failed_command_control_degrades() {
        let inputs = HealthInputs {
            last_control_status: Some("failed_command".to_string()),
            ..Default::default()
        };
        let state = evaluate_health(&inputs, &thresholds());
        assert_eq!(state.reason_codes, vec!["control_failed_command"]);
    }

    #[test]
    fn test_ok_control_is_ignored() {
        let inputs = HealthInputs {
            last_control_status: Some("ok".to_string()),
            ..Default::default()
        };
        let state = evaluate_health(&inputs, &thresholds());
        assert_eq!(state.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_ingest_lag_degraded_band() {
        let t = thresholds();
        let inputs = HealthInputs {
            ingest_lag_seconds: Some(t.degraded_ingest_lag_seconds),
            ..Default::default()
        };
        let state = evaluate_health(&inputs, &t);
        assert_eq!(state.status, HealthStatus::Degraded);
        assert_eq!(state.reason_codes, vec!["ingest_stale"]);
    }

    #[test]
    fn test_ingest_lag_critical_band() {
        let t = thresholds();
        let inputs = HealthInputs {
            ingest_lag_seconds: Some(t.critical_ingest_lag_seconds),
            ..Default::default()
        };
        let state = evaluate_health(&inputs, &t);
        assert_eq!(state.status, HealthStatus::Critical);
        assert_eq!(state.reason_codes, vec!["ingest_stale"]);
    }

    #[test]
    fn test_ingest_lag_below_degraded_is_healthy() {
        let t = thresholds();
        let inputs = HealthInputs {
            ingest_lag_seconds: Some(t.degraded_ingest_lag_seconds - 1),
            ..Default::default()
        };
        let state = evaluate_health(&inputs, &t);
        assert_eq!(state.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_transport_streak_bands() {
        let t = thresholds();
        let degraded = evaluate_health(
            &HealthInputs {
                transport_failure_streak: t.degraded_transport_failure_streak,
                ..Default::default()
            },
            &t,
        );
        assert_eq!(degraded.status, HealthStatus::Degraded);

        let critical = evaluate_health(
            &HealthInputs {
                transport_failure_streak: t.critical_transport_failure_streak,
                ..Default::default()
            },
            &t,
        );
        assert_eq!(critical.status, HealthStatus::Critical);
        assert_eq!(critical.reason_codes, vec!["transport_unreachable"]);
    }

    #[test]
    fn test_ingest_failure_mapping() {
        assert_eq!(
            IngestFailure::ServiceRequestFailed.health_reason(),
            "transport_unreachable"
        );
        assert_eq!(
            IngestFailure::ServiceResponseInvalid.health_reason(),
            "invalid_transport_payload"
        );
        assert_eq!(IngestFailure::ProjectionFailed.health_reason(), "projection_failed");
        assert_eq!(IngestFailure::SnapshotUnavailable.health_reason(), "reconcile_failed");
        assert_eq!(IngestFailure::EventsUnavailable.health_reason(), "reconcile_failed");
    }

    #[test]
    fn test_ingest_failure_degrades() {
        let inputs = HealthInputs {
            ingest_failure: Some(IngestFailure::ServiceResponseInvalid),
            ..Default::default()
        };
        let state = evaluate_health(&inputs, &thresholds());
        assert_eq!(state.status, HealthStatus::Degraded);
        assert_eq!(state.reason_codes, vec!["invalid_transport_payload"]);
    }

    #[test]
    fn test_severity_accumulates_by_max() {
        let t = thresholds();
        let inputs = HealthInputs {
            divergence: true,
            ingest_lag_seconds: Some(t.critical_ingest_lag_seconds + 1),
            transport_failure_streak: t.degraded_transport_failure_streak,
            ..Default::default()
        };
        let state = evaluate_health(&inputs, &t);
        assert_eq!(state.status, HealthStatus::Critical);
        assert_eq!(
            state.reason_codes,
            vec!["divergence_detected", "ingest_stale", "transport_unreachable"]
        );
    }

    #[test]
    fn test_duplicate_reason_not_repeated() {
        let t = thresholds();
        // Transport streak and a service_request_failed ingest failure both
        // map to transport_unreachable
        let inputs = HealthInputs {
            transport_failure_streak: t.critical_transport_failure_streak,
            ingest_failure: Some(IngestFailure::ServiceRequestFailed),
            ..Default::default()
        };
        let state = evaluate_health(&inputs, &t);
        assert_eq!(state.reason_codes, vec!["transport_unreachable"]);
    }

    // ── transport health ──

    #[test]
    fn test_transport_success_resets_streak() {
        let mut health = TransportHealth::default();
        health.record_failure("service_request_failed", at());
        health.record_failure("service_request_failed", at());
        assert_eq!(health.failure_streak, 2);
        health.record_success(at());
        assert_eq!(health.failure_streak, 0);
        assert_eq!(health.last_result.as_deref(), Some("success"));
        assert!(health.last_success_at.is_some());
        // The last failure code is retained for diagnostics
        assert_eq!(health.last_failure_code.as_deref(), Some("service_request_failed"));
    }

    #[test]
    fn test_transport_failure_increments_streak() {
        let mut health = TransportHealth::default();
        health.record_failure("events_unavailable", at());
        assert_eq!(health.failure_streak, 1);
        assert_eq!(health.last_result.as_deref(), Some("failed"));
        assert_eq!(health.last_failure_code.as_deref(), Some("events_unavailable"));
        assert!(health.last_failure_at.is_some());
    }

    // ── heartbeat ──

    #[test]
    fn test_heartbeat_fresh() {
        let t = thresholds();
        assert_eq!(classify_heartbeat(Some(0), &t), HeartbeatFreshness::Fresh);
        assert_eq!(
            classify_heartbeat(Some(t.degraded_heartbeat_lag_seconds - 1), &t),
            HeartbeatFreshness::Fresh
        );
    }

    #[test]
    fn test_heartbeat_degraded_band() {
        let t = thresholds();
        assert_eq!(
            classify_heartbeat(Some(t.degraded_heartbeat_lag_seconds), &t),
            HeartbeatFreshness::Degraded
        );
    }

    #[test]
    fn test_heartbeat_critical_band() {
        let t = thresholds();
        assert_eq!(
            classify_heartbeat(Some(t.critical_heartbeat_lag_seconds), &t),
            HeartbeatFreshness::Critical
        );
    }

    #[test]
    fn test_missing_heartbeat_is_critical() {
        assert_eq!(classify_heartbeat(None, &thresholds()), HeartbeatFreshness::Critical);
    }
}
