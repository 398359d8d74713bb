//! The configuration document: JSON parsed with serde, defaults applied,
//! unknown fields ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _};
use nano_runtime::AppLimits;
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 8080;
const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MEMORY_MB: usize = 128;
const DEFAULT_MAX_BUFFER_MB: usize = 64;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: usize,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            memory_mb: DEFAULT_MEMORY_MB,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Accepted for compatibility with single-app documents; routing in
    /// multi-app mode is by hostname only.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<usize>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub max_buffer_size_mb: Option<usize>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_memory_mb() -> usize {
    DEFAULT_MEMORY_MB
}

/// A fully-resolved app record: defaults applied, hostname lowered.
#[derive(Debug, Clone)]
pub struct TenantRecord {
    pub name: String,
    pub hostname: String,
    pub path: PathBuf,
    pub limits: AppLimits,
    pub env: BTreeMap<String, String>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Reading config file {:?}", path))?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(text).context("Parsing config document")?;
        config.validate()?;
        Ok(config)
    }

    /// A synthetic single-app config for `nano serve <app_dir>`.
    pub fn for_single_app(dir: &Path, port: Option<u16>) -> anyhow::Result<Self> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app".to_string());
        let config = Config {
            port: port.unwrap_or(DEFAULT_PORT),
            defaults: Defaults::default(),
            apps: vec![AppConfig {
                name: name.clone(),
                path: dir.to_string_lossy().into_owned(),
                hostname: Some("localhost".to_string()),
                port: None,
                timeout_ms: None,
                memory_mb: None,
                env: BTreeMap::new(),
                max_buffer_size_mb: None,
            }],
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.apps.is_empty() {
            bail!("config must define at least one app");
        }
        for app in &self.apps {
            if app.name.is_empty() {
                bail!("app name must not be empty");
            }
            if app.path.is_empty() {
                bail!("app {:?} has an empty path", app.name);
            }
        }
        Ok(())
    }

    /// Resolve every app into a tenant record.
    pub fn records(&self) -> Vec<TenantRecord> {
        self.apps
            .iter()
            .map(|app| resolve_record(app, &self.defaults))
            .collect()
    }
}

pub fn resolve_record(app: &AppConfig, defaults: &Defaults) -> TenantRecord {
    let hostname = app
        .hostname
        .clone()
        .unwrap_or_else(|| app.name.clone())
        .to_ascii_lowercase();
    TenantRecord {
        name: app.name.clone(),
        hostname,
        path: PathBuf::from(&app.path),
        limits: AppLimits {
            timeout: Duration::from_millis(app.timeout_ms.unwrap_or(defaults.timeout_ms)),
            memory_cap_bytes: app.memory_mb.unwrap_or(defaults.memory_mb) * 1024 * 1024,
            max_stream_buffer_bytes: app.max_buffer_size_mb.unwrap_or(DEFAULT_MAX_BUFFER_MB)
                * 1024
                * 1024,
        },
        env: app.env.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let config = Config::from_str(
            r#"{ "apps": [ { "name": "app-a", "path": "/srv/app-a" } ] }"#,
        )
        .unwrap();
        assert_eq!(config.port, 8080);
        let records = config.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.hostname, "app-a");
        assert_eq!(record.limits.timeout, Duration::from_millis(5000));
        assert_eq!(record.limits.memory_cap_bytes, 128 * 1024 * 1024);
        assert_eq!(record.limits.max_stream_buffer_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn per_app_overrides_beat_document_defaults() {
        let config = Config::from_str(
            r#"{
                "port": 9000,
                "defaults": { "timeout_ms": 1000, "memory_mb": 32 },
                "apps": [
                    { "name": "a", "path": "/srv/a", "hostname": "A.Example.COM",
                      "timeout_ms": 250, "memory_mb": 16, "max_buffer_size_mb": 1,
                      "env": { "MODE": "test" } },
                    { "name": "b", "path": "/srv/b" }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        let records = config.records();
        assert_eq!(records[0].hostname, "a.example.com");
        assert_eq!(records[0].limits.timeout, Duration::from_millis(250));
        assert_eq!(records[0].limits.memory_cap_bytes, 16 * 1024 * 1024);
        assert_eq!(records[0].limits.max_stream_buffer_bytes, 1024 * 1024);
        assert_eq!(records[0].env.get("MODE").map(String::as_str), Some("test"));
        assert_eq!(records[1].limits.timeout, Duration::from_millis(1000));
        assert_eq!(records[1].limits.memory_cap_bytes, 32 * 1024 * 1024);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let config = Config::from_str(
            r#"{ "apps": [ { "name": "a", "path": "/srv/a", "workers": 4 } ], "log": "json" }"#,
        );
        assert!(config.is_ok());
    }

    #[test]
    fn empty_apps_is_rejected() {
        assert!(Config::from_str(r#"{ "apps": [] }"#).is_err());
        assert!(Config::from_str(r#"{}"#).is_err());
        assert!(Config::from_str("not json").is_err());
    }
}
