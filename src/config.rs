use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::{CommitPolicy, WindowPolicy};

/// Per-engine knobs shared by every tenant.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub window: WindowPolicy,
    pub commit_policy: CommitPolicy,
    /// How long a save waits for the item locks before reporting a conflict.
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window: WindowPolicy::default(),
            commit_policy: CommitPolicy::default(),
            lock_timeout: Duration::from_millis(2_000),
        }
    }
}

/// Server configuration, read from `MENAJE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "menaje".into(),
            max_connections: 256,
            compact_threshold: 1_000,
            metrics_port: None,
            engine: EngineConfig::default(),
        }
    }
}

/// `key` parsed as `T`, or None when unset or malformed.
fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable numbers fall back to the default;
    /// an unknown commit policy is an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let defaults = Self::default();

        let commit_policy = match lookup("MENAJE_COMMIT_POLICY") {
            Some(v) => v.parse::<CommitPolicy>()?,
            None => defaults.engine.commit_policy,
        };

        Ok(Self {
            bind: lookup("MENAJE_BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "MENAJE_PORT").unwrap_or(defaults.port),
            data_dir: lookup("MENAJE_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("MENAJE_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "MENAJE_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "MENAJE_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "MENAJE_METRICS_PORT"),
            engine: EngineConfig {
                window: WindowPolicy {
                    setup_days: parsed(&lookup, "MENAJE_SETUP_DAYS").unwrap_or(0),
                    teardown_days: parsed(&lookup, "MENAJE_TEARDOWN_DAYS").unwrap_or(0),
                },
                commit_policy,
                lock_timeout: parsed(&lookup, "MENAJE_LOCK_TIMEOUT_MS")
                    .map_or(defaults.engine.lock_timeout, Duration::from_millis),
            },
        })
    }
}
