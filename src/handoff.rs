use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::context::Context;
use crate::policy::PolicyState;
use crate::registry::{FleetRegistry, Intent, ServiceConfig, SpriteConfig, Transport};
use crate::store::{self, Layout};
use crate::transport::{RequestConfig, TransportClient};

pub const SCHEMA_VERSION: &str = "v1";

/* ============================= IDEMPOTENCY KEYS ============================= */

/// Slugify one key part: lowercase, non-alphanumerics collapse to `-`.
pub fn slug(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    let mut last_dash = true;
    for c in part.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Join slugified parts with `-`, skipping empties.
pub fn slug_join(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| slug(p))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Derive the idempotency key for one intent.
pub fn idempotency_key(trace_id: &str, loop_id: &str, category: &str, intent: &str) -> String {
    slug_join(&["ops", trace_id, loop_id, category, intent])
}

/* ============================= INTENT TYPES ============================= */

/// Lifecycle status of a handoff intent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    PendingOperatorConfirmation,
    Executed,
    ExecutionAmbiguous,
    ExecutionFailed,
}

/// One operator intent derived from a policy candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffIntent {
    pub intent_id: String,
    pub candidate_id: String,
    pub loop_id: String,
    pub category: String,
    pub intent: Intent,
    pub status: IntentStatus,
    pub idempotency_key: String,
    pub transport: Transport,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprite: Option<SpriteConfig>,

    pub autonomous_eligible: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionRecord>,
}

/// Execution detail recorded after a control invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub exit_code: i32,
    pub confirmed: bool,
    pub at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The persisted handoff state artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffState {
    pub schema_version: String,
    pub trace_id: String,
    pub generated_at: DateTime<Utc>,
    pub intents: Vec<HandoffIntent>,
}

/* ============================= PLANNING ============================= */

/// Derive intents from every unsuppressed candidate in the policy state.
/// Planning never executes anything.
pub fn plan_handoff(
    ctx: &Context,
    registry: &FleetRegistry,
    policy_state: &PolicyState,
) -> Result<HandoffState> {
    let layout = Layout::new(ctx.repo_root());
    let mut intents = Vec::new();

    for candidate in &policy_state.candidates {
        if candidate.suppressed {
            continue;
        }
        let loop_config = registry.find_loop(&candidate.loop_id);
        let intent = candidate.recommended_intent;
        let key = idempotency_key(
            ctx.trace_id(),
            &candidate.loop_id,
            candidate.category.as_str(),
            intent.as_str(),
        );
        intents.push(HandoffIntent {
            intent_id: slug_join(&[&candidate.loop_id, candidate.category.as_str(), intent.as_str()]),
            candidate_id: candidate.candidate_id.clone(),
            loop_id: candidate.loop_id.clone(),
            category: candidate.category.as_str().to_string(),
            intent,
            status: IntentStatus::PendingOperatorConfirmation,
            idempotency_key: key,
            transport: loop_config.map(|l| l.transport).unwrap_or_default(),
            service: loop_config.and_then(|l| l.service.clone()),
            sprite: loop_config.and_then(|l| l.sprite.clone()),
            autonomous_eligible: candidate.autonomous.eligible,
            execution: None,
        });
    }

    let state = HandoffState {
        schema_version: SCHEMA_VERSION.to_string(),
        trace_id: ctx.trace_id().to_string(),
        generated_at: ctx.now(),
        intents,
    };

    store::write_json(&layout.fleet_handoff_state(), &state)?;
    store::append_jsonl(
        &layout.fleet_telemetry("handoff"),
        &json!({
            "schemaVersion": SCHEMA_VERSION,
            "stage": "fleet_handoff_plan",
            "at": state.generated_at.to_rfc3339(),
            "traceId": &state.trace_id,
            "intents": state.intents.len(),
            "autonomousEligible": state.intents.iter().filter(|i| i.autonomous_eligible).count(),
        }),
    )?;

    info!(intents = state.intents.len(), "fleet_handoff_plan_done");
    Ok(state)
}

/* ============================= CONTROL RUNNERS ============================= */

/// Raw outcome of one control invocation.
#[derive(Debug, Clone)]
pub struct ControlOutcome {
    pub exit_code: i32,
    pub confirmed: bool,
    pub detail: Option<String>,
}

/// Classify a control outcome into an intent status.
///
/// Exit 0 with confirmation is executed; exit 2 is ambiguous (confirmation
/// timeout or transport ambiguity); anything else failed.
pub fn classify_execution(outcome: &ControlOutcome) -> IntentStatus {
    match outcome.exit_code {
        0 if outcome.confirmed => IntentStatus::Executed,
        0 => IntentStatus::ExecutionAmbiguous,
        2 => IntentStatus::ExecutionAmbiguous,
        _ => IntentStatus::ExecutionFailed,
    }
}

/// Confirmation polling settings.
#[derive(Debug, Clone)]
pub struct ConfirmationConfig {
    pub timeout_seconds: u64,
    pub interval_seconds: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self { timeout_seconds: 60, interval_seconds: 5 }
    }
}

/// Seam between the executor and the concrete control transports.
#[allow(async_fn_in_trait)]
pub trait ControlRunner {
    async fn invoke(&self, intent: &HandoffIntent) -> Result<ControlOutcome>;
}

/// Invokes the local control CLI as a subprocess.
pub struct LocalProcessRunner {
    pub command: String,
}

impl ControlRunner for LocalProcessRunner {
    async fn invoke(&self, intent: &HandoffIntent) -> Result<ControlOutcome> {
        let output = tokio::process::Command::new(&self.command)
            .arg(intent.intent.as_str())
            .arg("--loop-id")
            .arg(&intent.loop_id)
            .arg("--idempotency-key")
            .arg(&intent.idempotency_key)
            .output()
            .await?;
        let exit_code = output.status.code().unwrap_or(1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let confirmed = exit_code == 0
            && serde_json::from_str::<Value>(stdout.trim())
                .map(|v| v["result"]["confirmed"] == true)
                .unwrap_or(false);
        Ok(ControlOutcome {
            exit_code,
            confirmed,
            detail: Some(stdout.trim().chars().take(240).collect()),
        })
    }
}

/// Invokes the sprite service control endpoint, polling until the result
/// is confirmed or the confirmation window elapses.
pub struct SpriteServiceRunner<'a> {
    pub ctx: &'a Context,
    pub confirmation: ConfirmationConfig,
}

impl ControlRunner for SpriteServiceRunner<'_> {
    async fn invoke(&self, intent: &HandoffIntent) -> Result<ControlOutcome> {
        let service = intent.service.clone().unwrap_or_default();
        let base_url = service
            .base_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("missing_service_base_url for {}", intent.loop_id))?;
        let token = service
            .token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok());
        let config = RequestConfig {
            token,
            retry_attempts: service.retry_attempts,
            retry_backoff_seconds: service.retry_backoff_seconds,
            ..RequestConfig::default()
        };
        let client = TransportClient::new(&config)?;
        let url = format!("{base_url}/ops/control");
        let body = json!({
            "loopId": intent.loop_id,
            "intent": intent.intent,
            "idempotencyKey": intent.idempotency_key,
        });

        let deadline = self.ctx.now()
            + chrono::Duration::seconds(self.confirmation.timeout_seconds as i64);
        loop {
            let response = match client.request(Method::POST, &url, Some(&body), &config).await {
                Ok(response) => response.body,
                Err(failure) => {
                    // Transport ambiguity: the control may or may not have run
                    return Ok(ControlOutcome {
                        exit_code: 2,
                        confirmed: false,
                        detail: Some(failure.to_string()),
                    });
                }
            };

            let exit_code = response["exitCode"].as_i64().unwrap_or(1) as i32;
            let confirmed = response["result"]["confirmed"] == true;
            let pending = response["result"]["confirm"] == "pending";

            if response["ok"] != true {
                return Ok(ControlOutcome {
                    exit_code: if exit_code == 0 { 1 } else { exit_code },
                    confirmed: false,
                    detail: Some(response.to_string()),
                });
            }
            if confirmed || !pending {
                return Ok(ControlOutcome {
                    exit_code,
                    confirmed,
                    detail: Some(response["result"]["status"].as_str().unwrap_or("").to_string()),
                });
            }
            if self.ctx.now() >= deadline {
                // Confirmation timeout surfaces as ambiguous
                return Ok(ControlOutcome {
                    exit_code: 2,
                    confirmed: false,
                    detail: Some("confirmation_timeout".to_string()),
                });
            }
            tokio::time::sleep(std::time::Duration::from_secs(self.confirmation.interval_seconds))
                .await;
        }
    }
}

/* ============================= EXECUTION ============================= */

/// Execution options: filters, confirm gate, and the autonomous marker
/// carried into telemetry.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub confirm: bool,
    /// When set, only autonomously eligible intents are executed and the
    /// run is recorded as autonomous.
    pub autonomous: bool,
    pub loop_filter: Option<String>,
    pub intent_filter: Option<String>,
}

/// Summary of one execution run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub attempted: u64,
    pub executed: u64,
    pub ambiguous: u64,
    pub failed: u64,
    pub autonomous: bool,
}

impl ExecutionSummary {
    /// Driver exit code: ambiguous dominates failed per the operational
    /// contract (2 over 1), success is 0.
    pub fn exit_code(&self) -> i32 {
        if self.ambiguous > 0 {
            2
        } else if self.failed > 0 {
            1
        } else {
            0
        }
    }
}

/// Execute the planned intents through the given control runner.
///
/// Requires `confirm`; a run without it is a validation error. Filters
/// that match nothing are validation errors too.
pub async fn execute_handoff<R: ControlRunner>(
    ctx: &Context,
    state: &mut HandoffState,
    runner: &R,
    options: &ExecuteOptions,
) -> Result<ExecutionSummary> {
    if !options.confirm {
        bail!("execution requires --confirm");
    }
    let layout = Layout::new(ctx.repo_root());

    let targets: Vec<usize> = state
        .intents
        .iter()
        .enumerate()
        .filter(|(_, intent)| {
            options
                .loop_filter
                .as_deref()
                .is_none_or(|filter| intent.loop_id == filter)
        })
        .filter(|(_, intent)| {
            options
                .intent_filter
                .as_deref()
                .is_none_or(|filter| intent.intent.as_str() == filter)
        })
        .filter(|(_, intent)| !options.autonomous || intent.autonomous_eligible)
        .map(|(index, _)| index)
        .collect();

    if targets.is_empty() && (options.loop_filter.is_some() || options.intent_filter.is_some()) {
        bail!("no planned intent matches the given filters");
    }

    let mut summary = ExecutionSummary {
        attempted: 0,
        executed: 0,
        ambiguous: 0,
        failed: 0,
        autonomous: options.autonomous,
    };

    for index in targets {
        let intent = &mut state.intents[index];
        if intent.status == IntentStatus::Executed {
            // Already executed under this idempotency key
            continue;
        }
        summary.attempted += 1;

        let outcome = match runner.invoke(intent).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(intent_id = %intent.intent_id, error = %error, "handoff_invoke_error");
                ControlOutcome { exit_code: 1, confirmed: false, detail: Some(error.to_string()) }
            }
        };

        let status = classify_execution(&outcome);
        intent.status = status;
        intent.execution = Some(ExecutionRecord {
            exit_code: outcome.exit_code,
            confirmed: outcome.confirmed,
            at: ctx.now(),
            detail: outcome.detail,
        });
        store::append_jsonl(
            &layout.loop_intents(&intent.loop_id),
            &json!({
                "schemaVersion": SCHEMA_VERSION,
                "at": ctx.now().to_rfc3339(),
                "traceId": ctx.trace_id(),
                "intentId": &intent.intent_id,
                "intent": intent.intent,
                "idempotencyKey": &intent.idempotency_key,
                "status": status,
            }),
        )?;
        store::append_jsonl(
            &layout.loop_telemetry(&intent.loop_id, "control"),
            &json!({
                "schemaVersion": SCHEMA_VERSION,
                "at": ctx.now().to_rfc3339(),
                "traceId": ctx.trace_id(),
                "intent": intent.intent,
                "idempotencyKey": &intent.idempotency_key,
                "exitCode": intent.execution.as_ref().map(|e| e.exit_code),
                "confirmed": intent.execution.as_ref().map(|e| e.confirmed),
                "status": status,
            }),
        )?;

        match status {
            IntentStatus::Executed => summary.executed += 1,
            IntentStatus::ExecutionAmbiguous => summary.ambiguous += 1,
            IntentStatus::ExecutionFailed => summary.failed += 1,
            IntentStatus::PendingOperatorConfirmation => {}
        }
    }

    store::write_json(&layout.fleet_handoff_state(), state)?;
    store::append_jsonl(
        &layout.fleet_telemetry("handoff"),
        &json!({
            "schemaVersion": SCHEMA_VERSION,
            "stage": "fleet_handoff_execute",
            "at": ctx.now().to_rfc3339(),
            "traceId": ctx.trace_id(),
            "autonomous": summary.autonomous,
            "attempted": summary.attempted,
            "executed": summary.executed,
            "ambiguous": summary.ambiguous,
            "failed": summary.failed,
        }),
    )?;

    info!(
        attempted = summary.attempted,
        executed = summary.executed,
        ambiguous = summary.ambiguous,
        failed = summary.failed,
        "fleet_handoff_execute_done"
    );
    Ok(summary)
}

/* ============================= TESTS ============================= */
