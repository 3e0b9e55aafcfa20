//! External collaborators C8 handlers talk to: the cluster itself (chaos
//! CRDs, batch Jobs, helm releases) and the container-builder daemon.
//! These are narrow interfaces per §1 — the mechanics of helm installation,
//! CRD schemas, and image building are explicitly out of scope; only the
//! shape of the calls the handlers make is part of the core.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rca_common::errors::HandlerError;
use serde_json::Value;

/// A cluster resource the handlers create: a chaos CRD or a batch Job.
/// `annotations` carries the serialized causal-context carriers (§9);
/// `labels` carries the identity fields listed in §6.
#[derive(Debug, Clone, Default)]
pub struct ResourceSpec {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub spec: Value,
}

#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Installs the pedestal via helm into `namespace`, bounded by
    /// `timeout` for install + readiness (§4.8.1, §5).
    async fn install_helm_release(
        &self,
        namespace: &str,
        chart_values: &Value,
        timeout: Duration,
    ) -> Result<(), HandlerError>;

    /// Creates the chaos CRD representing the fault being injected
    /// (§4.8.2).
    async fn create_chaos_crd(&self, resource: ResourceSpec) -> Result<(), HandlerError>;

    /// Creates a batch Job (used by `BuildDatapack` and `RunAlgorithm`,
    /// §4.8.3/§4.8.4) with the given environment and resource metadata.
    async fn create_batch_job(
        &self,
        resource: ResourceSpec,
        env: BTreeMap<String, String>,
    ) -> Result<(), HandlerError>;
}

/// Request to the container-builder daemon (§4.8.6).
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub image_name: String,
    pub tag: String,
    pub source_mount: String,
    pub dockerfile_path: String,
    pub build_args: BTreeMap<String, String>,
}

/// Result of a completed build, persisted as a Container record.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub image_digest: String,
}

#[async_trait]
pub trait BuilderClient: Send + Sync {
    /// Acquires a build session, supplies the source/dockerfile mounts and
    /// build args, and streams progress internally — the real
    /// implementation joins the progress-stream read concurrently with the
    /// build call (§5) and returns only once both complete. Idempotency is
    /// the caller's responsibility via `image_name` + `tag` (§4.8.6).
    async fn build(&self, request: BuildRequest) -> Result<BuildOutcome, HandlerError>;
}

#[cfg(test)]
pub mod fakes {
    use std::sync::Mutex;

    use super::*;

    /// Records every call it receives; always succeeds. Used by handler
    /// unit tests and the end-to-end scenario tests to assert on what the
    /// pipeline would have done against a live cluster.
    #[derive(Default)]
    pub struct RecordingClusterGateway {
        pub helm_installs: Mutex<Vec<(String, Value)>>,
        pub crds_created: Mutex<Vec<ResourceSpec>>,
        pub jobs_created: Mutex<Vec<(ResourceSpec, BTreeMap<String, String>)>>,
        pub fail_next_helm: Mutex<bool>,
    }

    #[async_trait]
    impl ClusterGateway for RecordingClusterGateway {
        async fn install_helm_release(
            &self,
            namespace: &str,
            chart_values: &Value,
            _timeout: Duration,
        ) -> Result<(), HandlerError> {
            if std::mem::take(&mut *self.fail_next_helm.lock().unwrap()) {
                return Err(HandlerError::ClusterRejected("helm install failed".into()));
            }
            self.helm_installs
                .lock()
                .unwrap()
                .push((namespace.to_string(), chart_values.clone()));
            Ok(())
        }

        async fn create_chaos_crd(&self, resource: ResourceSpec) -> Result<(), HandlerError> {
            self.crds_created.lock().unwrap().push(resource);
            Ok(())
        }

        async fn create_batch_job(
            &self,
            resource: ResourceSpec,
            env: BTreeMap<String, String>,
        ) -> Result<(), HandlerError> {
            self.jobs_created.lock().unwrap().push((resource, env));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingBuilderClient {
        pub builds: Mutex<Vec<BuildRequest>>,
    }

    #[async_trait]
    impl BuilderClient for RecordingBuilderClient {
        async fn build(&self, request: BuildRequest) -> Result<BuildOutcome, HandlerError> {
            let digest = format!("sha256:{:x}", md5_like(&request.image_name, &request.tag));
            self.builds.lock().unwrap().push(request);
            Ok(BuildOutcome {
                image_digest: digest,
            })
        }
    }

    /// Deterministic, non-cryptographic stand-in digest for tests only.
    fn md5_like(name: &str, tag: &str) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        tag.hash(&mut hasher);
        hasher.finish()
    }
}
