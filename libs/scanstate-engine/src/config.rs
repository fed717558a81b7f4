use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::store::StoreConfig;
use crate::supervisor::SupervisorSettings;
use crate::worker::{DecodeFailurePolicy, WorkerSettings};

/// Whole configuration file. Every section and field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl EngineConfig {
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::config("read", format!("'{path}': {e}")))?;
        Self::parse(&content).map_err(|e| e.with_context(format!("'{path}'")))
    }

    pub fn parse(content: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(content).map_err(|e| EngineError::config("parse", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.worker.concurrency == 0 {
            return Err(EngineError::config("worker", "concurrency must be at least 1"));
        }
        if self.worker.max_receive_failures == 0 {
            return Err(EngineError::config("worker", "max_receive_failures must be at least 1"));
        }
        match self.source.kind {
            SourceKind::Pubsub => {
                if self.source.project_id.is_empty() || self.source.subscription_id.is_empty() {
                    return Err(EngineError::config("source", "pubsub needs project_id and subscription_id"));
                }
                if self.source.max_messages == 0 {
                    return Err(EngineError::config("source", "max_messages must be at least 1"));
                }
            }
            SourceKind::Tcp => {
                if self.source.listen.is_empty() {
                    return Err(EngineError::config("source", "tcp needs a listen address"));
                }
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  [source]
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Pubsub,
    Tcp,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Pubsub => "pubsub",
            SourceKind::Tcp => "tcp",
        })
    }
}

impl FromStr for SourceKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pubsub" => Ok(SourceKind::Pubsub),
            "tcp" => Ok(SourceKind::Tcp),
            other => Err(EngineError::config("source", format!("unknown source type: '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,
    #[serde(default = "default_project_id")]
    pub project_id: String,
    #[serde(default = "default_subscription_id")]
    pub subscription_id: String,
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
    /// Explicit Pub/Sub base URL; otherwise the emulator or the public endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_source_kind() -> SourceKind {
    SourceKind::Pubsub
}
fn default_project_id() -> String {
    "test-project".into()
}
fn default_subscription_id() -> String {
    "scan-sub".into()
}
fn default_max_messages() -> u32 {
    32
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_listen() -> String {
    "0.0.0.0:9300".into()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            project_id: default_project_id(),
            subscription_id: default_subscription_id(),
            max_messages: default_max_messages(),
            endpoint: None,
            access_token: None,
            poll_interval_ms: default_poll_interval_ms(),
            listen: default_listen(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  [worker] / [api]
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub decode_failure: DecodeFailurePolicy,
    #[serde(default = "default_max_receive_failures")]
    pub max_receive_failures: u32,
    #[serde(default = "default_receive_backoff_ms")]
    pub receive_backoff_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_concurrency() -> usize {
    4
}
fn default_max_receive_failures() -> u32 {
    5
}
fn default_receive_backoff_ms() -> u64 {
    500
}
fn default_drain_timeout_ms() -> u64 {
    10_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            decode_failure: DecodeFailurePolicy::default(),
            max_receive_failures: default_max_receive_failures(),
            receive_backoff_ms: default_receive_backoff_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            concurrency: self.concurrency,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            worker: WorkerSettings {
                decode_failure: self.decode_failure,
                max_receive_failures: self.max_receive_failures,
                receive_backoff: Duration::from_millis(self.receive_backoff_ms),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// 0 disables the inspection API.
    #[serde(default)]
    pub port: u16,
}
