use crate::domain::{DomainError, MatchThresholds};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Service configuration, loaded from a TOML file and overridable through
/// environment variables. Connection settings can additionally be
/// hot-swapped at runtime through the config endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub source_db: SourceDbConfig,

    #[serde(default)]
    pub target_api: TargetApiConfig,

    #[serde(default)]
    pub target_db: TargetDbConfig,

    #[serde(default)]
    pub matching: MatchingConfig,

    /// Target-side path prefixes mapped to local prefixes. Parsed and
    /// surfaced for the UI's thumbnail proxy; the core never reads it.
    #[serde(default)]
    pub path_mappings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceDbConfig {
    /// Path to the Windows Photos Legacy MediaGraph.db file.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetApiConfig {
    pub url: Option<String>,
    /// Secret; never echoed by the config endpoint.
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDbConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_name")]
    pub name: String,
    #[serde(default = "default_db_user")]
    pub user: String,
    /// Secret; never echoed by the config endpoint.
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for TargetDbConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            name: default_db_name(),
            user: default_db_user(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Default minimum IoU (I) when a run request omits it.
    #[serde(default = "default_min_overlap")]
    pub min_overlap_score: f64,
    /// Default maximum center distance (C) when a run request omits it.
    #[serde(default = "default_max_center_dist")]
    pub max_center_dist: f64,
    /// Floor on pair match counts before a pair is actionable.
    #[serde(default = "default_min_photos")]
    pub min_photos_in_cluster: usize,
    /// Minimum matched faces per cluster for merge candidates.
    #[serde(default = "default_min_merge")]
    pub min_merge_matches: usize,
    /// Whether person names compare case- and whitespace-insensitively
    /// when deciding if a target person already exists.
    #[serde(default = "default_true")]
    pub person_name_case_insensitive: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            min_overlap_score: default_min_overlap(),
            max_center_dist: default_max_center_dist(),
            min_photos_in_cluster: default_min_photos(),
            min_merge_matches: default_min_merge(),
            person_name_case_insensitive: default_true(),
        }
    }
}

fn default_db_host() -> String {
    "localhost".to_string()
}
fn default_db_port() -> u16 {
    5432
}
fn default_db_name() -> String {
    "immich".to_string()
}
fn default_db_user() -> String {
    "postgres".to_string()
}
fn default_min_overlap() -> f64 {
    0.30
}
fn default_max_center_dist() -> f64 {
    0.40
}
fn default_min_photos() -> usize {
    1
}
fn default_min_merge() -> usize {
    2
}
fn default_true() -> bool {
    true
}

/// Which connection settings have been hot-swapped since startup.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OverrideFlags {
    pub source_db: bool,
    pub target_api: bool,
    pub target_db: bool,
}

impl AppConfig {
    /// Loads configuration. An explicitly given file must parse; the
    /// default location is optional and silently skipped when absent.
    /// Environment variables override file values either way.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, DomainError> {
        let mut config = match explicit_path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new("facebridge.toml");
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, DomainError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DomainError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&raw).map_err(|e| {
            DomainError::Configuration(format!("cannot parse {}: {}", path.display(), e))
        })
    }

    fn apply_env_overrides(&mut self) {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        if let Some(path) = env("FACEBRIDGE_SOURCE_DB") {
            self.source_db.path = Some(PathBuf::from(path));
        }
        if let Some(url) = env("FACEBRIDGE_TARGET_API_URL") {
            self.target_api.url = Some(url);
        }
        if let Some(key) = env("FACEBRIDGE_TARGET_API_KEY") {
            self.target_api.api_key = Some(key);
        }
        if let Some(host) = env("FACEBRIDGE_TARGET_DB_HOST") {
            self.target_db.host = host;
        }
        if let Some(port) = env("FACEBRIDGE_TARGET_DB_PORT").and_then(|p| p.parse().ok()) {
            self.target_db.port = port;
        }
        if let Some(name) = env("FACEBRIDGE_TARGET_DB_NAME") {
            self.target_db.name = name;
        }
        if let Some(user) = env("FACEBRIDGE_TARGET_DB_USER") {
            self.target_db.user = user;
        }
        if let Some(password) = env("FACEBRIDGE_TARGET_DB_PASSWORD") {
            self.target_db.password = Some(password);
        }
    }

    pub fn default_thresholds(&self) -> MatchThresholds {
        MatchThresholds {
            min_iou: self.matching.min_overlap_score,
            max_center_dist: self.matching.max_center_dist,
        }
    }

    /// The non-secret view served by `GET /config`: secrets become
    /// `*_set` booleans.
    pub fn redacted(&self, overrides: &OverrideFlags) -> serde_json::Value {
        json!({
            "source_db_path": self.source_db.path,
            "target_api_url": self.target_api.url,
            "target_api_key_set": self.target_api.api_key.is_some(),
            "target_db_host": self.target_db.host,
            "target_db_port": self.target_db.port,
            "target_db_name": self.target_db.name,
            "target_db_user": self.target_db.user,
            "target_db_password_set": self.target_db.password.is_some(),
            "min_overlap_score": self.matching.min_overlap_score,
            "max_center_dist": self.matching.max_center_dist,
            "min_photos_in_cluster": self.matching.min_photos_in_cluster,
            "min_merge_matches": self.matching.min_merge_matches,
            "person_name_case_insensitive": self.matching.person_name_case_insensitive,
            "path_mappings": self.path_mappings,
            "overrides": overrides,
        })
    }
}
