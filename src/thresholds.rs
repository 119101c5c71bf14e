use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::store;

/* ============================= TYPES ============================= */

/// Concrete numeric thresholds a reconcile run classifies against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdProfile {
    pub degraded_ingest_lag_seconds: i64,
    pub critical_ingest_lag_seconds: i64,
    pub degraded_transport_failure_streak: u32,
    pub critical_transport_failure_streak: u32,
    pub degraded_heartbeat_lag_seconds: i64,
    pub critical_heartbeat_lag_seconds: i64,
}

/// Versioned catalog of named threshold profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdCatalog {
    pub schema_version: String,
    pub default_profile: String,
    pub profiles: std::collections::BTreeMap<String, ThresholdProfile>,
}

/* ============================= BUILT-IN CATALOG ============================= */

/// Return the built-in catalog used when no catalog file is configured.
pub fn builtin_catalog() -> ThresholdCatalog {
    let mut profiles = std::collections::BTreeMap::new();
    profiles.insert("baseline".to_string(), baseline_profile());
    profiles.insert("strict".to_string(), strict_profile());
    profiles.insert("lenient".to_string(), lenient_profile());
    ThresholdCatalog {
        schema_version: "v1".to_string(),
        default_profile: "baseline".to_string(),
        profiles,
    }
}

fn baseline_profile() -> ThresholdProfile {
    ThresholdProfile {
        degraded_ingest_lag_seconds: 900,
        critical_ingest_lag_seconds: 3600,
        degraded_transport_failure_streak: 2,
        critical_transport_failure_streak: 5,
        degraded_heartbeat_lag_seconds: 600,
        critical_heartbeat_lag_seconds: 1800,
    }
}

fn strict_profile() -> ThresholdProfile {
    ThresholdProfile {
        degraded_ingest_lag_seconds: 300,
        critical_ingest_lag_seconds: 900,
        degraded_transport_failure_streak: 1,
        critical_transport_failure_streak: 3,
        degraded_heartbeat_lag_seconds: 180,
        critical_heartbeat_lag_seconds: 600,
    }
}

fn lenient_profile() -> ThresholdProfile {
    ThresholdProfile {
        degraded_ingest_lag_seconds: 3600,
        critical_ingest_lag_seconds: 14400,
        degraded_transport_failure_streak: 5,
        critical_transport_failure_streak: 10,
        degraded_heartbeat_lag_seconds: 1800,
        critical_heartbeat_lag_seconds: 7200,
    }
}

/* ============================= VALIDATION ============================= */

/// Validate one profile: every critical threshold must be at least its
/// degraded counterpart.
pub fn validate_profile(name: &str, profile: &ThresholdProfile) -> Result<()> {
    if profile.critical_ingest_lag_seconds < profile.degraded_ingest_lag_seconds {
        bail!("threshold profile '{name}': critical ingest lag below degraded ingest lag");
    }
    if profile.critical_transport_failure_streak < profile.degraded_transport_failure_streak {
        bail!("threshold profile '{name}': critical transport streak below degraded streak");
    }
    if profile.critical_heartbeat_lag_seconds < profile.degraded_heartbeat_lag_seconds {
        bail!("threshold profile '{name}': critical heartbeat lag below degraded heartbeat lag");
    }
    Ok(())
}

/// Validate a whole catalog, including that the default profile exists.
pub fn validate_catalog(catalog: &ThresholdCatalog) -> Result<()> {
    if !catalog.profiles.contains_key(&catalog.default_profile) {
        bail!(
            "unknown_threshold_profile: default profile '{}' is not in the catalog",
            catalog.default_profile
        );
    }
    for (name, profile) in &catalog.profiles {
        validate_profile(name, profile)?;
    }
    Ok(())
}

/* ============================= RESOLUTION ============================= */

/// Load the catalog: `OPS_MANAGER_THRESHOLD_PROFILES_FILE` if set, else an
/// explicit path, else the built-in catalog.
pub fn load_catalog(explicit_file: Option<&Path>) -> Result<ThresholdCatalog> {
    let env_file = std::env::var("OPS_MANAGER_THRESHOLD_PROFILES_FILE").ok();
    let path = explicit_file
        .map(|p| p.to_path_buf())
        .or_else(|| env_file.as_deref().map(std::path::PathBuf::from));

    let catalog = match path {
        Some(path) => match store::read_json::<ThresholdCatalog>(&path)? {
            Some(catalog) => catalog,
            None => bail!("threshold catalog file not found: {}", path.display()),
        },
        None => builtin_catalog(),
    };
    validate_catalog(&catalog)?;
    Ok(catalog)
}

/// Resolve a profile by name: explicit flag, `OPS_MANAGER_THRESHOLD_PROFILE`,
/// then the catalog default. Unknown names fail with
/// `unknown_threshold_profile`.
pub fn resolve_profile(
    catalog: &ThresholdCatalog,
    explicit: Option<&str>,
) -> Result<ThresholdProfile> {
    let env_profile = std::env::var("OPS_MANAGER_THRESHOLD_PROFILE").ok();
    let name = explicit
        .map(|s| s.to_string())
        .or(env_profile)
        .unwrap_or_else(|| catalog.default_profile.clone());

    match catalog.profiles.get(&name) {
        Some(profile) => Ok(profile.clone()),
        None => bail!("unknown_threshold_profile: '{name}'"),
    }
}

/* ============================= TESTS ============================= */
