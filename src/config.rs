//! Configuration recognized by the core (§6). Loading from TOML/env lives
//! in the runtime crate; this struct is the shape every handler reads.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-namespace-prefix configuration for pedestal installation
/// (`injection.namespace_config` in §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespacePrefixConfig {
    pub port: u16,
    pub chart_name: String,
    pub image_name: String,
    pub image_tag: String,
    pub repo_name: String,
    pub repo_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// `k8s.namespace` — namespace in which jobs are created.
    pub k8s_namespace: String,
    /// `harbor.repository` / `harbor.registry` / `harbor.namespace`.
    pub harbor_repository: String,
    pub harbor_registry: String,
    pub harbor_namespace: String,
    /// `buildkit.address` — builder daemon.
    pub buildkit_address: String,
    /// `injection.namespace_config` — map per prefix.
    pub injection_namespace_config: BTreeMap<String, NamespacePrefixConfig>,
    /// `system.timezone` — TZ for env vars.
    pub system_timezone: String,
    /// `nfs.path` / `jfs.dataset_path` — shared result/dataset storage.
    pub nfs_path: String,
    pub jfs_dataset_path: String,
    /// `algo.detector` — name of the detector algorithm gating downstream
    /// algorithm execution.
    pub algo_detector: String,

    #[serde(with = "humantime_secs", default = "default_helm_timeout")]
    pub helm_install_timeout: Duration,
    #[serde(with = "humantime_secs", default = "default_builder_timeout")]
    pub builder_progress_timeout: Duration,
    #[serde(with = "humantime_secs", default = "default_token_wait_timeout")]
    pub wait_for_token_timeout: Duration,
    /// Upper bound on randomized exponential backoff for resource-contention
    /// reschedules (§9).
    #[serde(with = "humantime_secs", default = "default_reschedule_backoff_cap")]
    pub reschedule_backoff_cap: Duration,

    pub max_concurrent_restarts: u32,
    pub worker_pool_size: usize,
}

fn default_helm_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_builder_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_token_wait_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_reschedule_backoff_cap() -> Duration {
    Duration::from_secs(300)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            k8s_namespace: "default".to_string(),
            harbor_repository: String::new(),
            harbor_registry: String::new(),
            harbor_namespace: String::new(),
            buildkit_address: String::new(),
            injection_namespace_config: BTreeMap::new(),
            system_timezone: "UTC".to_string(),
            nfs_path: String::new(),
            jfs_dataset_path: String::new(),
            algo_detector: "detector".to_string(),
            helm_install_timeout: default_helm_timeout(),
            builder_progress_timeout: default_builder_timeout(),
            wait_for_token_timeout: default_token_wait_timeout(),
            reschedule_backoff_cap: default_reschedule_backoff_cap(),
            max_concurrent_restarts: 5,
            worker_pool_size: 20,
        }
    }
}

mod humantime_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
