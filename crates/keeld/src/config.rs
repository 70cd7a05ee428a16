//! keeld.toml configuration.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. CLI flags override individual fields after loading.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use keel_agent::{Backoff, BreakerConfig, EngineConfig, RetryPolicy};
use keel_sync::{AgentIdentity, BufferConfig, ClientConfig};
use keel_workflow::WorkflowConfig;

/// Read a TOML config file, or return the defaults when `path` is `None`.
pub fn load<T: DeserializeOwned + Default>(path: Option<&Path>) -> anyhow::Result<T> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("read {}: {e}", path.display()))?;
            Ok(toml::from_str(&content)?)
        }
        None => Ok(T::default()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub grpc_port: u16,
    pub api_port: u16,
    pub data_dir: PathBuf,
    pub apex_domain: String,
    /// Routing partition gateway configs are written to.
    pub routing_partition: String,
    /// Per-agent event buffer.
    pub buffer: BufferConfig,
    /// Agents with no open stream for this long are forgotten.
    pub registry_idle_ttl_secs: u64,
    pub eviction_interval_secs: u64,
    pub instance_poll_interval_ms: u64,
    pub max_instance_polls: u32,
    pub schema_timeout_secs: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            grpc_port: 50051,
            api_port: 8080,
            data_dir: PathBuf::from("/var/lib/keel"),
            apex_domain: "keel.app".to_string(),
            routing_partition: "default".to_string(),
            buffer: BufferConfig::default(),
            registry_idle_ttl_secs: 600,
            eviction_interval_secs: 60,
            instance_poll_interval_ms: 1000,
            max_instance_polls: 300,
            schema_timeout_secs: 5,
        }
    }
}

impl ControlPlaneConfig {
    pub fn workflow(&self) -> WorkflowConfig {
        WorkflowConfig::default()
            .with_apex_domain(&self.apex_domain)
            .with_instance_polls(
                Duration::from_millis(self.instance_poll_interval_ms),
                self.max_instance_polls,
            )
    }

    pub fn registry_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.registry_idle_ttl_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }

    pub fn schema_timeout(&self) -> Duration {
        Duration::from_secs(self.schema_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// `host:port` or a full `http://` URL.
    pub control_plane: String,
    pub client_id: String,
    pub region: String,
    pub shard: String,
    /// Selectors on top of `region`.
    pub selectors: BTreeMap<String, String>,
    pub inbound: BufferConfig,
    pub outbound: BufferConfig,
    pub pull_interval_secs: u64,
    pub pull_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
    pub refresh_interval_secs: u64,
    pub watch_backoff_step_ms: u64,
    pub watch_backoff_max_ms: u64,
    pub retry_attempts: u32,
    pub push_retry_attempts: u32,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            control_plane: "127.0.0.1:50051".to_string(),
            client_id: "keel-agent".to_string(),
            region: "local".to_string(),
            shard: "default".to_string(),
            selectors: BTreeMap::new(),
            inbound: BufferConfig::default(),
            outbound: BufferConfig::default(),
            pull_interval_secs: 15 * 60,
            pull_timeout_secs: 2 * 60,
            reconcile_interval_secs: 60,
            refresh_interval_secs: 5 * 60,
            watch_backoff_step_ms: 1000,
            watch_backoff_max_ms: 30_000,
            retry_attempts: 5,
            push_retry_attempts: 3,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 30,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

impl AgentConfig {
    /// gRPC endpoint URL for the control plane.
    pub fn endpoint(&self) -> String {
        if self.control_plane.starts_with("http://") || self.control_plane.starts_with("https://")
        {
            self.control_plane.clone()
        } else {
            format!("http://{}", self.control_plane)
        }
    }

    pub fn identity(&self) -> AgentIdentity {
        self.selectors.iter().fold(
            AgentIdentity::new(&self.client_id, &self.region, &self.shard),
            |identity, (k, v)| identity.with_selector(k, v),
        )
    }

    pub fn client(&self) -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn engine(&self) -> EngineConfig {
        let retry = RetryPolicy::default().with_max_attempts(self.retry_attempts);
        EngineConfig::default()
            .with_pull_interval(Duration::from_secs(self.pull_interval_secs))
            .with_pull_timeout(Duration::from_secs(self.pull_timeout_secs))
            .with_reconcile_interval(Duration::from_secs(self.reconcile_interval_secs))
            .with_refresh_interval(Duration::from_secs(self.refresh_interval_secs))
            .with_watch_backoff(Backoff::Linear {
                step: Duration::from_millis(self.watch_backoff_step_ms),
                max: Duration::from_millis(self.watch_backoff_max_ms),
            })
            .with_pull_retry(retry)
            .with_push_retry(retry.with_max_attempts(self.push_retry_attempts))
            .with_breaker(
                BreakerConfig::default()
                    .with_failure_threshold(self.breaker_failure_threshold)
                    .with_cooldown(Duration::from_secs(self.breaker_cooldown_secs)),
            )
            .with_inbound(self.inbound)
            .with_outbound(self.outbound)
    }
}
