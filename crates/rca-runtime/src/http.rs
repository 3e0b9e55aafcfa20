//! The axum HTTP transport for cluster informer webhooks (C9): decodes
//! each callback's JSON body into the parameters [`rca_core::ingress`]'s
//! pure-logic methods expect.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rca_common::errors::HandlerError;
use rca_core::ingress::IngressCallbacks;
use serde::Deserialize;

pub fn router(callbacks: Arc<IngressCallbacks>) -> Router {
    Router::new()
        .route("/webhooks/crd-added", post(crd_added))
        .route("/webhooks/crd-succeeded", post(crd_succeeded))
        .route("/webhooks/crd-failed", post(crd_failed))
        .route("/webhooks/job-added", post(job_added))
        .route("/webhooks/job-succeeded", post(job_succeeded))
        .route("/webhooks/job-failed", post(job_failed))
        .with_state(callbacks)
}

fn into_response(result: Result<(), HandlerError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err @ HandlerError::PayloadInvalid(_)) => {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
struct NamedCallback {
    name: String,
    labels: BTreeMap<String, String>,
}

async fn crd_added(
    State(callbacks): State<Arc<IngressCallbacks>>,
    Json(body): Json<NamedCallback>,
) -> Response {
    into_response(callbacks.on_crd_added(&body.name, &body.labels).await)
}

#[derive(Deserialize)]
struct CrdSucceededBody {
    name: String,
    namespace: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    labels: BTreeMap<String, String>,
}

async fn crd_succeeded(
    State(callbacks): State<Arc<IngressCallbacks>>,
    Json(body): Json<CrdSucceededBody>,
) -> Response {
    into_response(
        callbacks
            .on_crd_succeeded(&body.name, &body.namespace, body.start, body.end, &body.labels)
            .await,
    )
}

#[derive(Deserialize)]
struct CrdFailedBody {
    name: String,
    namespace: String,
    reason: String,
    labels: BTreeMap<String, String>,
}

async fn crd_failed(
    State(callbacks): State<Arc<IngressCallbacks>>,
    Json(body): Json<CrdFailedBody>,
) -> Response {
    into_response(
        callbacks
            .on_crd_failed(&body.name, &body.namespace, &body.reason, &body.labels)
            .await,
    )
}

async fn job_added(
    State(callbacks): State<Arc<IngressCallbacks>>,
    Json(body): Json<NamedCallback>,
) -> Response {
    into_response(callbacks.on_job_added(&body.name, &body.labels).await)
}

#[derive(Deserialize)]
struct JobSucceededBody {
    labels: BTreeMap<String, String>,
}

async fn job_succeeded(
    State(callbacks): State<Arc<IngressCallbacks>>,
    Json(body): Json<JobSucceededBody>,
) -> Response {
    into_response(callbacks.on_job_succeeded(&body.labels).await)
}

#[derive(Deserialize)]
struct JobFailedBody {
    reason: String,
    labels: BTreeMap<String, String>,
}

async fn job_failed(
    State(callbacks): State<Arc<IngressCallbacks>>,
    Json(body): Json<JobFailedBody>,
) -> Response {
    into_response(callbacks.on_job_failed(&body.reason, &body.labels).await)
}
