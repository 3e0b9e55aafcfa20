//! HTTP-backed `ClusterGateway`/`BuilderClient` (C8): thin `reqwest` clients
//! over the cluster-API sidecar and the container-builder daemon. The wire
//! shape of those two services is explicitly out of scope for this crate
//! (§1) — these structs only need to call them and map their failures onto
//! `HandlerError`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rca_common::errors::HandlerError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use rca_core::cluster::{BuildOutcome, BuildRequest, BuilderClient, ClusterGateway, ResourceSpec};

fn map_reqwest_err(err: reqwest::Error) -> HandlerError {
    if err.is_timeout() {
        HandlerError::Timeout
    } else {
        HandlerError::ClusterRejected(err.to_string())
    }
}

async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response, HandlerError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(HandlerError::ClusterRejected(format!(
            "{status}: {body}"
        )))
    }
}

pub struct HttpClusterGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClusterGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Serialize)]
struct HelmInstallRequest<'a> {
    namespace: &'a str,
    chart_values: &'a Value,
    timeout_secs: u64,
}

#[async_trait]
impl ClusterGateway for HttpClusterGateway {
    async fn install_helm_release(
        &self,
        namespace: &str,
        chart_values: &Value,
        timeout: Duration,
    ) -> Result<(), HandlerError> {
        let response = self
            .client
            .post(format!("{}/helm/releases", self.base_url))
            .json(&HelmInstallRequest {
                namespace,
                chart_values,
                timeout_secs: timeout.as_secs(),
            })
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        expect_success(response).await?;
        Ok(())
    }

    async fn create_chaos_crd(&self, resource: ResourceSpec) -> Result<(), HandlerError> {
        let response = self
            .client
            .post(format!("{}/chaos-crds", self.base_url))
            .json(&resource_payload(&resource))
            .send()
            .await
            .map_err(map_reqwest_err)?;
        expect_success(response).await?;
        Ok(())
    }

    async fn create_batch_job(
        &self,
        resource: ResourceSpec,
        env: BTreeMap<String, String>,
    ) -> Result<(), HandlerError> {
        let mut payload = resource_payload(&resource);
        payload["env"] = serde_json::to_value(env).unwrap_or_default();
        let response = self
            .client
            .post(format!("{}/batch-jobs", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        expect_success(response).await?;
        Ok(())
    }
}

fn resource_payload(resource: &ResourceSpec) -> Value {
    serde_json::json!({
        "name": resource.name,
        "namespace": resource.namespace,
        "labels": resource.labels,
        "annotations": resource.annotations,
        "spec": resource.spec,
    })
}

pub struct HttpBuilderClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBuilderClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Serialize)]
struct BuildApiRequest<'a> {
    image_name: &'a str,
    tag: &'a str,
    source_mount: &'a str,
    dockerfile_path: &'a str,
    build_args: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct BuildApiResponse {
    image_digest: String,
}

#[async_trait]
impl BuilderClient for HttpBuilderClient {
    async fn build(&self, request: BuildRequest) -> Result<BuildOutcome, HandlerError> {
        let response = self
            .client
            .post(format!("{}/builds", self.base_url))
            .json(&BuildApiRequest {
                image_name: &request.image_name,
                tag: &request.tag,
                source_mount: &request.source_mount,
                dockerfile_path: &request.dockerfile_path,
                build_args: &request.build_args,
            })
            .send()
            .await
            .map_err(map_reqwest_err)?;
        let response = expect_success(response).await?;
        let parsed: BuildApiResponse = response
            .json()
            .await
            .map_err(|e| HandlerError::BuilderError(e.to_string()))?;
        Ok(BuildOutcome {
            image_digest: parsed.image_digest,
        })
    }
}
