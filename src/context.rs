use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/* ============================= CLOCK ============================= */

/// Source of "now" for every pipeline.
///
/// Cooldowns, TTLs, ack windows, budgets, and freeze windows all read the
/// clock through this type so tests can pin time to a fixed instant.
#[derive(Debug, Clone)]
pub enum Clock {
    System,
    Fixed(DateTime<Utc>),
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Fixed(at) => *at,
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::System
    }
}

/* ============================= CONTEXT ============================= */

/// Shared invocation context threaded through every pipeline.
///
/// Replaces ad-hoc globals: resolved repo root, trace id, and clock travel
/// together from the CLI entry point down to the artifact writes.
#[derive(Debug, Clone)]
pub struct Context {
    repo_root: PathBuf,
    trace_id: String,
    clock: Clock,
}

impl Context {
    pub fn new(repo_root: impl Into<PathBuf>, trace_id: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            trace_id: trace_id.into(),
            clock: Clock::System,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Resolve the trace id for this invocation.
///
/// Resolution order: explicit flag, `OPS_MANAGER_TRACE_ID`, then a generated
/// id derived from the current timestamp and process id.
pub fn resolve_trace_id(explicit: Option<&str>) -> String {
    if let Some(id) = explicit {
        return id.to_string();
    }
    if let Ok(id) = std::env::var("OPS_MANAGER_TRACE_ID")
        && !id.is_empty()
    {
        return id;
    }
    format!(
        "trace-{}-{}",
        Utc::now().format("%Y%m%d%H%M%S"),
        std::process::id()
    )
}

/* ============================= TESTS ============================= */
