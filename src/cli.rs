use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "loop-ops")]
#[command(about = "Autonomous operations control plane for superloop fleets")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Repository root holding the .superloop artifact tree
    #[arg(long, global = true, default_value = ".")]
    pub repo_root: String,

    /// Trace id threaded through artifacts (default: OPS_MANAGER_TRACE_ID
    /// or a generated id)
    #[arg(long, global = true)]
    pub trace_id: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check registry, thresholds, and artifact tree health
    Check,

    /// Reconcile a single loop: ingest, project, classify health
    Reconcile {
        /// Loop id to reconcile
        #[arg(long)]
        loop_id: String,

        /// Cap on events ingested this cycle
        #[arg(long)]
        max_events: Option<usize>,

        #[command(flatten)]
        thresholds: ThresholdArgs,
    },

    /// Fleet-wide operations
    Fleet {
        #[command(subcommand)]
        action: FleetAction,
    },

    /// Run the policy engine over the latest fleet state
    Policy,

    /// Plan or execute operator handoff intents
    Handoff {
        #[command(subcommand)]
        action: HandoffAction,
    },

    /// Promotion readiness, apply, and controller
    Promotion {
        #[command(subcommand)]
        action: PromotionAction,
    },

    /// Record a safety drill outcome
    Drill {
        /// Drill name (kill_switch, sprite_service_outage, ambiguous_retry_guard)
        #[arg(long)]
        name: String,

        /// Drill result: pass or fail
        #[arg(long)]
        result: String,

        /// Who ran the drill
        #[arg(long)]
        by: Option<String>,
    },

    /// Horizon packet pipeline
    Horizon {
        #[command(subcommand)]
        action: HorizonAction,
    },
}

#[derive(Args)]
pub struct ThresholdArgs {
    /// Threshold profile name (falls back to OPS_MANAGER_THRESHOLD_PROFILE,
    /// then the catalog default)
    #[arg(long)]
    pub threshold_profile: Option<String>,

    /// Threshold catalog file (falls back to
    /// OPS_MANAGER_THRESHOLD_PROFILES_FILE, then the built-in catalog)
    #[arg(long)]
    pub thresholds_file: Option<String>,
}

#[derive(Subcommand)]
pub enum FleetAction {
    /// Reconcile every enabled loop with bounded parallelism
    Reconcile {
        /// Worker pool size
        #[arg(long, default_value_t = 2)]
        max_parallel: usize,

        /// Process loops sorted by loopId instead of registry order
        #[arg(long)]
        deterministic_order: bool,

        /// Cap on events ingested per loop
        #[arg(long)]
        max_events: Option<usize>,

        #[command(flatten)]
        thresholds: ThresholdArgs,
    },
}

#[derive(Subcommand)]
pub enum HandoffAction {
    /// Derive intents from the latest policy state (never executes)
    Plan,

    /// Execute planned intents via control invocations
    Execute {
        /// Required acknowledgement that executions will run
        #[arg(long)]
        confirm: bool,

        /// Only execute intents for this loop
        #[arg(long)]
        loop_id: Option<String>,

        /// Only execute intents with this intent kind
        #[arg(long)]
        intent: Option<String>,

        /// Execute only autonomously eligible intents and record the run
        /// as autonomous
        #[arg(long)]
        autonomous: bool,

        /// Local control command to invoke for local-transport loops
        #[arg(long, default_value = "superloop-control")]
        control_command: String,

        /// Confirmation polling timeout in seconds
        #[arg(long, default_value_t = 60)]
        timeout_seconds: u64,

        /// Confirmation polling interval in seconds
        #[arg(long, default_value_t = 5)]
        interval_seconds: u64,
    },
}

#[derive(Args)]
pub struct GovernanceArgs {
    /// Operator approving the change
    #[arg(long)]
    pub by: Option<String>,

    /// Change/approval reference
    #[arg(long)]
    pub approval_ref: Option<String>,

    /// Why this change is safe
    #[arg(long)]
    pub rationale: Option<String>,

    /// RFC-3339 timestamp the approval must be reviewed by
    #[arg(long)]
    pub review_by: Option<String>,
}

#[derive(Subcommand)]
pub enum PromotionAction {
    /// Evaluate the five promotion readiness gates
    Ci {
        /// Promotion gate config file
        #[arg(long)]
        config: Option<String>,
    },

    /// Apply (or preview) a promotion intent against the registry
    Apply {
        /// expand, resume, or rollback
        #[arg(long)]
        intent: String,

        /// Preview without mutating
        #[arg(long)]
        dry_run: bool,

        /// Replay guard: a prior record with this key short-circuits
        #[arg(long)]
        idempotency_key: Option<String>,

        #[command(flatten)]
        governance: GovernanceArgs,

        /// Promotion gate config file
        #[arg(long)]
        config: Option<String>,
    },

    /// Roll the rollout back (sets the manual pause)
    Rollback {
        #[command(flatten)]
        governance: GovernanceArgs,

        /// Promotion gate config file
        #[arg(long)]
        config: Option<String>,
    },

    /// Run the guarded promotion controller cycle
    Controller {
        /// Controller config file (budgets, cooldowns, freeze windows)
        #[arg(long)]
        config: Option<String>,

        /// Allow the controller to apply instead of propose-only
        #[arg(long)]
        apply: bool,

        #[command(flatten)]
        governance: GovernanceArgs,
    },
}

#[derive(Subcommand)]
pub enum HorizonAction {
    /// Create a queued packet
    Create {
        #[arg(long)]
        packet_id: String,

        #[arg(long)]
        horizon_ref: String,

        #[arg(long)]
        sender: String,

        #[arg(long)]
        recipient_type: String,

        #[arg(long)]
        recipient_id: String,

        #[arg(long)]
        intent: String,

        #[arg(long)]
        ttl_seconds: Option<i64>,
    },

    /// Plan dispatch for queued packets without mutating
    Plan {
        #[command(flatten)]
        selection: HorizonSelectionArgs,
    },

    /// Dispatch queued packets through their adapters
    Dispatch {
        #[command(flatten)]
        selection: HorizonSelectionArgs,

        /// Skip all mutation; only record a preview
        #[arg(long)]
        dry_run: bool,
    },

    /// Ingest a JSONL receipt stream
    Ack {
        /// Receipts file (JSONL, one receipt per line)
        #[arg(long)]
        file: String,
    },

    /// Reconcile overdue dispatched packets: retry or dead-letter
    Retry {
        #[arg(long, default_value_t = 600)]
        ack_timeout_seconds: i64,

        #[arg(long, default_value_t = 3)]
        max_retries: u32,

        #[arg(long, default_value_t = 300)]
        retry_backoff_seconds: i64,

        /// Routing directory file
        #[arg(long)]
        directory: Option<String>,
    },
}

#[derive(Args)]
pub struct HorizonSelectionArgs {
    /// Only packets for this horizon
    #[arg(long)]
    pub horizon: Option<String>,

    /// Only packets for this recipient id
    #[arg(long)]
    pub recipient: Option<String>,

    /// Cap on packets selected
    #[arg(long)]
    pub limit: Option<usize>,

    /// Routing directory file
    #[arg(long)]
    pub directory: Option<String>,
}
