use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/* ============================= SHARED ENUMS ============================= */

/// Remediation category a policy candidate can carry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ReconcileFailed,
    HealthCritical,
    HealthDegraded,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::ReconcileFailed => "reconcile_failed",
            Category::HealthCritical => "health_critical",
            Category::HealthDegraded => "health_degraded",
        }
    }
}

/// Candidate severity. Critical outranks warning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
}

impl Severity {
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 2,
            Severity::Warning => 1,
        }
    }

    pub fn at_least(&self, floor: &Severity) -> bool {
        self.rank() >= floor.rank()
    }
}

/// Candidate confidence. High outranks medium outranks low.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn rank(&self) -> u8 {
        match self {
            Confidence::High => 3,
            Confidence::Medium => 2,
            Confidence::Low => 1,
        }
    }

    pub fn at_least(&self, floor: &Confidence) -> bool {
        self.rank() >= floor.rank()
    }
}

/// Operator intent vocabulary. Presently every category maps to cancel;
/// new intents extend through the allow-list without cascade changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Cancel,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Cancel => "cancel",
        }
    }
}

/* ============================= LOOP CONFIG ============================= */

/// How a loop's runtime artifacts are reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    #[default]
    Local,
    SpriteService,
}

/// Service connection settings for `sprite_service` loops.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default)]
    pub retry_backoff_seconds: f64,
}

fn default_retry_attempts() -> u32 {
    3
}

/// Sprite runner metadata carried through handoff envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SpriteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
}

/// One loop entry in the fleet registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    pub loop_id: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub transport: Transport,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprite: Option<SpriteConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceConfig>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

/* ============================= POLICY CONFIG ============================= */

/// Fleet policy mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    #[default]
    Advisory,
    GuardedAuto,
}

/// Noise controls applied during candidate cooldown checks.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NoiseControls {
    #[serde(default)]
    pub dedupe_window_seconds: i64,
}

/// Allow-lists gating autonomous eligibility.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AutonomousAllow {
    #[serde(default)]
    pub categories: BTreeSet<Category>,

    #[serde(default)]
    pub intents: Vec<Intent>,
}

/// Floors a candidate must clear to be considered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutonomousThresholds {
    pub min_severity: Severity,
    pub min_confidence: Confidence,
}

impl Default for AutonomousThresholds {
    fn default() -> Self {
        Self {
            min_severity: Severity::Critical,
            min_confidence: Confidence::High,
        }
    }
}

/// Hard safety limits applied while allocating the eligibility budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutonomousSafety {
    #[serde(default)]
    pub kill_switch: bool,

    #[serde(default)]
    pub cooldown_seconds: i64,

    pub max_actions_per_run: u32,

    pub max_actions_per_loop: u32,
}

impl Default for AutonomousSafety {
    fn default() -> Self {
        Self {
            kill_switch: false,
            cooldown_seconds: 0,
            max_actions_per_run: 1,
            max_actions_per_loop: 1,
        }
    }
}

/// Governance record required when the fleet runs in guarded_auto mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Governance {
    pub by: String,
    pub approval_ref: String,
    pub rationale: String,
    pub changed_at: DateTime<Utc>,
    pub review_by: DateTime<Utc>,
}

/// Automatic pause state toggled by the autopause evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AutoPause {
    #[serde(default)]
    pub active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
}

/// Rollout pause switches.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RolloutPause {
    #[serde(default)]
    pub manual: bool,

    #[serde(default)]
    pub auto: AutoPause,
}

/// Trip conditions for the autopause evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutopauseConfig {
    pub lookback_executions: usize,
    pub min_sample_size: u64,
    pub ambiguity_rate_threshold: f64,
    pub failure_rate_threshold: f64,
}

impl Default for AutopauseConfig {
    fn default() -> Self {
        Self {
            lookback_executions: 10,
            min_sample_size: 5,
            ambiguity_rate_threshold: 0.2,
            failure_rate_threshold: 0.2,
        }
    }
}

/// Canary rollout parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutConfig {
    /// Loop ids in scope. Empty means every loop is in scope.
    #[serde(default)]
    pub scope: BTreeSet<String>,

    #[serde(default)]
    pub canary_percent: u32,

    #[serde(default = "default_salt")]
    pub salt: String,

    #[serde(default)]
    pub pause: RolloutPause,

    #[serde(default)]
    pub autopause: AutopauseConfig,

    #[serde(default = "default_expand_step")]
    pub expand_step: u32,
}

fn default_salt() -> String {
    "v1".to_string()
}

fn default_expand_step() -> u32 {
    10
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            scope: BTreeSet::new(),
            canary_percent: 0,
            salt: default_salt(),
            pause: RolloutPause::default(),
            autopause: AutopauseConfig::default(),
            expand_step: default_expand_step(),
        }
    }
}

/// Autonomous action configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AutonomousConfig {
    #[serde(default)]
    pub allow: AutonomousAllow,

    #[serde(default)]
    pub thresholds: AutonomousThresholds,

    #[serde(default)]
    pub safety: AutonomousSafety,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub governance: Option<Governance>,

    #[serde(default)]
    pub rollout: RolloutConfig,
}

/// Fleet-wide policy settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    #[serde(default)]
    pub mode: PolicyMode,

    /// Mapping of loop id (or "*" for global) to suppressed categories.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub suppressions: BTreeMap<String, BTreeSet<Category>>,

    #[serde(default)]
    pub noise_controls: NoiseControls,

    #[serde(default)]
    pub autonomous: AutonomousConfig,
}

/* ============================= REGISTRY ============================= */

/// The fleet registry: the authoritative roster of loops and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetRegistry {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    pub fleet_id: String,

    #[serde(default)]
    pub loops: Vec<LoopConfig>,

    #[serde(default)]
    pub policy: PolicyConfig,
}

fn default_schema_version() -> String {
    "v1".to_string()
}

impl FleetRegistry {
    pub fn find_loop(&self, loop_id: &str) -> Option<&LoopConfig> {
        self.loops.iter().find(|l| l.loop_id == loop_id)
    }

    pub fn enabled_loops(&self) -> impl Iterator<Item = &LoopConfig> {
        self.loops.iter().filter(|l| l.enabled)
    }
}

/* ============================= VALIDATION ============================= */

/// Reason codes attached to governance validation failures.
pub const REASON_GOVERNANCE_MISSING: &str = "autonomous_governance_missing";
pub const REASON_GOVERNANCE_REVIEW_NOT_AFTER_CHANGE: &str =
    "autonomous_governance_review_not_after_change";
pub const REASON_GOVERNANCE_REVIEW_EXPIRED: &str = "autonomous_governance_review_expired";

/// Missing-field reason codes for a partially formed governance record.
pub fn governance_missing_reasons(governance: &Governance) -> Vec<String> {
    let mut reasons = Vec::new();
    if governance.by.trim().is_empty() {
        reasons.push("autonomous_governance_by_missing".to_string());
    }
    if governance.approval_ref.trim().is_empty() {
        reasons.push("autonomous_governance_approval_ref_missing".to_string());
    }
    if governance.rationale.trim().is_empty() {
        reasons.push("autonomous_governance_rationale_missing".to_string());
    }
    reasons
}

/// Validate the governance invariant for guarded_auto mode:
/// all fields present, `changedAt < reviewBy`, and `reviewBy` in the future.
pub fn validate_governance(governance: &Governance, now: DateTime<Utc>) -> Result<()> {
    let missing = governance_missing_reasons(governance);
    if !missing.is_empty() {
        bail!("governance record incomplete: {}", missing.join(", "));
    }
    if governance.changed_at >= governance.review_by {
        bail!("{REASON_GOVERNANCE_REVIEW_NOT_AFTER_CHANGE}: reviewBy must be after changedAt");
    }
    if governance.review_by <= now {
        bail!("{REASON_GOVERNANCE_REVIEW_EXPIRED}: reviewBy must be in the future");
    }
    Ok(())
}

/// Validate the whole registry. Per-loop service completeness is NOT checked
/// here: the fleet reconciler classifies incomplete sprite_service loops as
/// per-loop failures so the rest of the fleet still runs.
pub fn validate_registry(registry: &FleetRegistry, now: DateTime<Utc>) -> Result<()> {
    if registry.fleet_id.trim().is_empty() {
        bail!("registry fleetId must not be empty");
    }

    let mut seen = BTreeSet::new();
    for loop_config in &registry.loops {
        if loop_config.loop_id.trim().is_empty() {
            bail!("registry contains a loop with an empty loopId");
        }
        if !seen.insert(loop_config.loop_id.as_str()) {
            bail!("duplicate loopId '{}' in registry", loop_config.loop_id);
        }
        if let Some(service) = &loop_config.service {
            if service.retry_attempts < 1 {
                bail!(
                    "loop '{}': service.retryAttempts must be at least 1",
                    loop_config.loop_id
                );
            }
            if service.retry_backoff_seconds < 0.0 {
                bail!(
                    "loop '{}': service.retryBackoffSeconds must not be negative",
                    loop_config.loop_id
                );
            }
        }
    }

    let policy = &registry.policy;
    if policy.noise_controls.dedupe_window_seconds < 0 {
        bail!("noiseControls.dedupeWindowSeconds must not be negative");
    }
    if policy.autonomous.rollout.canary_percent > 100 {
        bail!("rollout.canaryPercent must be between 0 and 100");
    }
    for key in policy.suppressions.keys() {
        if key != "*" && registry.find_loop(key).is_none() {
            bail!("suppression key '{key}' does not match any loop");
        }
    }

    if policy.mode == PolicyMode::GuardedAuto {
        match &policy.autonomous.governance {
            Some(governance) => validate_governance(governance, now)?,
            None => bail!("{REASON_GOVERNANCE_MISSING}: guarded_auto mode requires governance"),
        }
    }

    Ok(())
}

/* ============================= TESTS ============================= */
