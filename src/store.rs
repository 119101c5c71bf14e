use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/* ============================= LAYOUT ============================= */

/// Repository-rooted artifact layout.
///
/// Every state file and telemetry stream the control plane touches lives
/// under `.superloop/` inside the repo root. Paths are derived here and
/// nowhere else so the tree stays consistent across pipelines.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self { root: repo_root.into() }
    }

    fn ops_manager(&self) -> PathBuf {
        self.root.join(".superloop").join("ops-manager")
    }

    fn horizons(&self) -> PathBuf {
        self.root.join(".superloop").join("horizons")
    }

    // ── per-loop artifacts ──

    pub fn loop_dir(&self, loop_id: &str) -> PathBuf {
        self.ops_manager().join(loop_id)
    }

    pub fn loop_cursor(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join("cursor.json")
    }

    pub fn loop_state(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join("state.json")
    }

    pub fn loop_health(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join("health.json")
    }

    pub fn loop_heartbeat(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join("heartbeat.json")
    }

    pub fn loop_health_transport(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join("transport-health.json")
    }

    pub fn loop_intents(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join("intents.jsonl")
    }

    pub fn loop_escalations(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join("escalations.jsonl")
    }

    pub fn loop_profile_drift(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join("profile-drift.json")
    }

    pub fn loop_alerts_cursor(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join("alerts-cursor.json")
    }

    pub fn loop_telemetry(&self, loop_id: &str, stage: &str) -> PathBuf {
        self.loop_dir(loop_id)
            .join("telemetry")
            .join(format!("{stage}.jsonl"))
    }

    // ── runtime artifacts produced by the loop runner (local transport) ──

    pub fn loop_runtime_snapshot(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join("runtime").join("snapshot.json")
    }

    pub fn loop_runtime_events(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join("runtime").join("events.jsonl")
    }

    // ── fleet artifacts ──

    pub fn fleet_dir(&self) -> PathBuf {
        self.ops_manager().join("fleet")
    }

    pub fn fleet_registry(&self) -> PathBuf {
        self.fleet_dir().join("registry.v1.json")
    }

    pub fn fleet_state(&self) -> PathBuf {
        self.fleet_dir().join("state.json")
    }

    pub fn fleet_policy_state(&self) -> PathBuf {
        self.fleet_dir().join("policy-state.json")
    }

    pub fn fleet_promotion_state(&self) -> PathBuf {
        self.fleet_dir().join("promotion-state.json")
    }

    pub fn fleet_handoff_state(&self) -> PathBuf {
        self.fleet_dir().join("handoff-state.json")
    }

    pub fn fleet_drills(&self) -> PathBuf {
        self.fleet_dir().join("drills.json")
    }

    pub fn fleet_telemetry(&self, stage: &str) -> PathBuf {
        self.fleet_dir().join("telemetry").join(format!("{stage}.jsonl"))
    }

    pub fn fleet_summary(&self, name: &str) -> PathBuf {
        self.fleet_dir().join("summaries").join(format!("{name}.md"))
    }

    // ── horizon artifacts ──

    pub fn packet(&self, packet_id: &str) -> PathBuf {
        self.horizons()
            .join("packets")
            .join(format!("{}.json", safe_component(packet_id)))
    }

    pub fn packets_dir(&self) -> PathBuf {
        self.horizons().join("packets")
    }

    pub fn ack_state(&self) -> PathBuf {
        self.horizons().join("ack-state.json")
    }

    pub fn retry_state(&self) -> PathBuf {
        self.horizons().join("retry-state.json")
    }

    pub fn horizon_telemetry(&self, stage: &str) -> PathBuf {
        self.horizons().join("telemetry").join(format!("{stage}.jsonl"))
    }

    pub fn outbox(&self, recipient_type: &str, recipient_id: &str) -> PathBuf {
        self.horizons()
            .join("outbox")
            .join(safe_component(recipient_type))
            .join(format!("{}.jsonl", safe_component(recipient_id)))
    }
}

/// Sanitize an identifier for use as a single path component.
///
/// Keeps alphanumerics, `-`, `_`, and `.`; everything else becomes `-`.
/// An empty input maps to `"unknown"`.
pub fn safe_component(raw: &str) -> String {
    if raw.is_empty() {
        return "unknown".to_string();
    }
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/* ============================= JSON STATE FILES ============================= */

/// Read a JSON state file. `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let value = serde_json::from_str(&contents)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    Ok(Some(value))
}

/// Write a JSON state file atomically: write to a sibling temp file, then
/// rename over the target. Readers never observe a torn file.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, format!("{json}\n"))
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}

/* ============================= JSONL TELEMETRY ============================= */

/// Append one record to an append-only JSONL file as a single line.
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let line = serde_json::to_string(value)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;
    Ok(())
}

/// Read every non-empty line of a JSONL file. `Ok(vec![])` when missing.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    Ok(contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.to_string())
        .collect())
}

/// Count the non-empty lines of a JSONL file. Zero when missing.
pub fn line_count(path: &Path) -> Result<u64> {
    Ok(read_lines(path)?.len() as u64)
}

/// Return the last `n` non-empty lines of a JSONL file, oldest first.
pub fn tail_n(path: &Path, n: usize) -> Result<Vec<String>> {
    let lines = read_lines(path)?;
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].to_vec())
}

/// Parse the last `n` lines of a JSONL file into values, skipping lines
/// that fail to parse. Oldest first.
pub fn tail_values(path: &Path, n: usize) -> Result<Vec<serde_json::Value>> {
    Ok(tail_n(path, n)?
        .iter()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

/* ============================= TESTS ============================= */
