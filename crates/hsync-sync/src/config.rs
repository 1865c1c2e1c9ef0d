use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hsync_adapters::{AdapterSettings, SourceKind};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_SOURCES_FILE: &str = "sources.yaml";
pub const DEFAULT_USER_AGENT: &str = "hsync-bot/0.1 (+hackathon listing sync)";
const UNSTOP_REQUEST_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    MissingVar(&'static str),
    #[error("{name} has an invalid value {value:?}")]
    InvalidVar { name: &'static str, value: String },
    #[error("source registry {path}: {reason}")]
    Registry { path: String, reason: String },
    #[error("source {name}: {reason}")]
    InvalidSource { name: String, reason: String },
    #[error("building http client: {0}")]
    HttpClient(String),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub sources_file: PathBuf,
    pub user_agent: String,
    pub http_timeout: Duration,
    /// Upper bound for one adapter call, all pages included.
    pub source_timeout: Duration,
    pub stale_after_runs: u32,
    pub lease_ttl: Duration,
    /// Cadence for `hsync schedule`. Unset means no in-process scheduling.
    pub sync_cron: Option<String>,
}

impl SyncConfig {
    /// Reads the process environment, after loading `.env` when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Ok(Self {
            database_url: var("DATABASE_URL").ok_or(ConfigError::MissingVar("DATABASE_URL"))?,
            sources_file: var("HSYNC_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOURCES_FILE)),
            user_agent: var("HSYNC_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout: Duration::from_secs(parse_var(
                "HSYNC_HTTP_TIMEOUT_SECS",
                var("HSYNC_HTTP_TIMEOUT_SECS"),
                20,
            )?),
            source_timeout: Duration::from_secs(parse_var(
                "HSYNC_SOURCE_TIMEOUT_SECS",
                var("HSYNC_SOURCE_TIMEOUT_SECS"),
                120,
            )?),
            stale_after_runs: parse_var("HSYNC_STALE_AFTER_RUNS", var("HSYNC_STALE_AFTER_RUNS"), 3)?,
            lease_ttl: Duration::from_secs(parse_var(
                "HSYNC_LEASE_TTL_SECS",
                var("HSYNC_LEASE_TTL_SECS"),
                900,
            )?),
            sync_cron: var("HSYNC_SYNC_CRON"),
        })
    }
}

fn parse_var<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(ConfigError::InvalidVar { name, value: raw }),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(flatten)]
    pub adapter: AdapterSettings,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Overrides the global per-source timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub min_request_interval_ms: Option<u64>,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceConfig {
    pub fn name(&self) -> &str {
        &self.adapter.name
    }

    /// Minimum spacing between requests. Unstop is paced at one request per
    /// second unless configured otherwise.
    pub fn request_interval(&self) -> Option<Duration> {
        match (self.min_request_interval_ms, self.adapter.kind) {
            (Some(0), _) => None,
            (Some(ms), _) => Some(Duration::from_millis(ms)),
            (None, SourceKind::Unstop) => Some(UNSTOP_REQUEST_INTERVAL),
            (None, _) => None,
        }
    }
}

impl SourceRegistry {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let registry_err = |reason: String| ConfigError::Registry {
            path: path.display().to_string(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| registry_err(e.to_string()))?;
        let registry: SourceRegistry =
            serde_yaml::from_str(&text).map_err(|e| registry_err(e.to_string()))?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            let name = source.name().trim();
            if name.is_empty() {
                return Err(ConfigError::InvalidSource {
                    name: String::new(),
                    reason: "name must not be empty".into(),
                });
            }
            if !seen.insert(name) {
                return Err(ConfigError::InvalidSource {
                    name: name.to_string(),
                    reason: "duplicate source name".into(),
                });
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn missing_database_url_is_a_config_error() {
        let err = SyncConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("DATABASE_URL")));
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = SyncConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/hsync")]))
            .unwrap();
        assert_eq!(config.sources_file, PathBuf::from("sources.yaml"));
        assert_eq!(config.http_timeout, Duration::from_secs(20));
        assert_eq!(config.source_timeout, Duration::from_secs(120));
        assert_eq!(config.stale_after_runs, 3);
        assert_eq!(config.lease_ttl, Duration::from_secs(900));
        assert_eq!(config.sync_cron, None);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = SyncConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/hsync"),
            ("HSYNC_STALE_AFTER_RUNS", "zero"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { name: "HSYNC_STALE_AFTER_RUNS", .. }));

        let err = SyncConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/hsync"),
            ("HSYNC_SOURCE_TIMEOUT_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { .. }));
    }

    #[test]
    fn registry_loads_and_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
sources:
  - name: unstop
    kind: unstop
    statuses: [open]
  - name: mlh
    kind: mlh
    enabled: false
    urls: ["https://mlh.io/seasons/2025/events"]
    min_request_interval_ms: 250
    timeout_secs: 30
"#
        )
        .unwrap();

        let registry = SourceRegistry::load(file.path()).unwrap();
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.enabled().count(), 1);
        let unstop = &registry.sources[0];
        assert!(unstop.enabled);
        assert_eq!(unstop.adapter.statuses, vec!["open".to_string()]);
        assert_eq!(unstop.request_interval(), Some(Duration::from_secs(1)));
        let mlh = &registry.sources[1];
        assert_eq!(mlh.request_interval(), Some(Duration::from_millis(250)));
        assert_eq!(mlh.timeout_secs, Some(30));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "sources:\n  - {{name: a, kind: devpost}}\n  - {{name: a, kind: devpost}}\n"
        )
        .unwrap();
        assert!(matches!(
            SourceRegistry::load(file.path()),
            Err(ConfigError::InvalidSource { .. })
        ));
    }

    #[test]
    fn unreadable_registry_is_reported() {
        assert!(matches!(
            SourceRegistry::load(Path::new("/nonexistent/sources.yaml")),
            Err(ConfigError::Registry { .. })
        ));
    }
}
