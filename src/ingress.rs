//! Cluster-event ingress (C9): the four informer entry points and the
//! five/six-step handling common to all of them — recover identity from
//! labels, update the C1 record, release resources on terminal outcomes,
//! emit to C10, and on success submit the next pipeline stage.
//!
//! This module is pure logic; the axum HTTP transport that decodes an
//! informer webhook payload into the parameters below lives in the runtime
//! crate.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rca_common::errors::{HandlerError, StoreError};
use rca_common::events::EventName;
use rca_common::{
    BuildDatapackPayload, ExecutionState, FaultInjectionState, RetryPolicy, RunAlgorithmPayload,
    CollectResultPayload, Task, TaskPayload, TaskState, TaskType,
};
use tracing::instrument;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::events::DomainEvent;
use crate::events::EventSink;
use crate::namespace_lock::NamespaceLockManager;
use crate::queues::TaskQueues;
use crate::store::{FaultInjectionStore, ResultStore, TaskStore};

/// Identity recovered from a cluster resource's labels (§6).
struct Identity {
    task_id: Uuid,
    trace_id: Uuid,
    group_id: Uuid,
}

fn parse_identity(labels: &BTreeMap<String, String>) -> Result<Identity, HandlerError> {
    let parse = |key: &str| -> Result<Uuid, HandlerError> {
        labels
            .get(key)
            .ok_or_else(|| HandlerError::PayloadInvalid(format!("missing label {key}")))?
            .parse::<Uuid>()
            .map_err(|e| HandlerError::PayloadInvalid(format!("malformed label {key}: {e}")))
    };
    Ok(Identity {
        task_id: parse("task_id")?,
        trace_id: parse("trace_id")?,
        group_id: parse("group_id")?,
    })
}

fn parse_task_type(labels: &BTreeMap<String, String>) -> Result<TaskType, HandlerError> {
    let raw = labels
        .get("task_type")
        .ok_or_else(|| HandlerError::PayloadInvalid("missing label task_type".into()))?;
    TaskType::from_str(raw).map_err(HandlerError::PayloadInvalid)
}

fn required_label<'a>(labels: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str, HandlerError> {
    labels
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| HandlerError::PayloadInvalid(format!("missing label {key}")))
}

/// Pure-logic handling for the informer callbacks of §4.9. Held by the
/// runtime's HTTP transport alongside the same stores/queues/locks the
/// pipeline executor shares.
pub struct IngressCallbacks {
    pub task_store: Arc<dyn TaskStore>,
    pub fault_injection_store: Arc<dyn FaultInjectionStore>,
    pub result_store: Arc<dyn ResultStore>,
    pub namespace_lock: Arc<NamespaceLockManager>,
    pub queues: Arc<TaskQueues>,
    pub events: Arc<dyn EventSink>,
    pub config: Arc<PipelineConfig>,
}

async fn publish(
    events: &dyn EventSink,
    identity: &Identity,
    task_type: &str,
    name: EventName,
    payload: serde_json::Value,
) {
    let event = DomainEvent::new(identity.task_id, task_type, name, payload).with_site(
        file!(),
        line!(),
        "ingress",
    );
    let _ = events.publish(identity.trace_id, event).await;
}

impl IngressCallbacks {
    /// `OnCRDAdded`: acknowledges the chaos CRD was accepted by the cluster.
    /// No record or resource state changes yet — `Initial` already reflects
    /// this — so this step is confirmation only, ahead of the terminal
    /// succeed/fail callback.
    #[instrument(skip(self, labels))]
    pub async fn on_crd_added(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<(), HandlerError> {
        let _identity = parse_identity(labels)?;
        tracing::debug!(injection_name = name, "chaos CRD acknowledged by cluster");
        Ok(())
    }

    /// `OnCRDSucceeded(name, start, end)` (§4.8.2, §4.9): the chaos engine
    /// confirms the fault window, so the record gets its recorded
    /// `start_time`/`end_time` and the pipeline advances to `BuildDatapack`.
    #[instrument(skip(self, labels))]
    pub async fn on_crd_succeeded(
        &self,
        name: &str,
        namespace: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), HandlerError> {
        let identity = parse_identity(labels)?;

        let mut record = self
            .fault_injection_store
            .get_by_injection_name(name)
            .await
            .map_err(HandlerError::Store)?
            .ok_or_else(|| HandlerError::PayloadInvalid(format!("no fault injection record named {name}")))?;
        record.start_time = Some(start);
        record.end_time = Some(end);
        record.state = FaultInjectionState::InjectSuccess;
        self.fault_injection_store
            .update(&record)
            .await
            .map_err(HandlerError::Store)?;

        publish(
            self.events.as_ref(),
            &identity,
            TaskType::FaultInjection.as_str(),
            EventName::FaultInjectionCompleted,
            serde_json::json!({"injection_name": name, "start_time": start, "end_time": end}),
        )
        .await;

        // Per the spec's S1 ordering (FaultInjectionCompleted -> DatasetBuildSucceed),
        // the next pipeline stage is BuildDatapack, carrying the recorded window.
        let dataset_name = format!("{}-{}", record.benchmark, namespace);
        let service = labels.get("service").cloned().unwrap_or_default();
        let now = Utc::now();
        let downstream = Task {
            task_id: Uuid::new_v4(),
            group_id: identity.group_id,
            trace_id: identity.trace_id,
            payload: TaskPayload::BuildDatapack(BuildDatapackPayload {
                benchmark: record.benchmark.clone(),
                dataset_name,
                namespace: namespace.to_string(),
                pre_duration: record.pre_duration,
                service,
                start_time: Some(start),
                end_time: Some(end),
                fault_injection_record_id: Some(record.id),
            }),
            immediate: true,
            execute_time: now.timestamp(),
            cron_expr: None,
            retry_policy: RetryPolicy::default(),
            restart_attempts: 0,
            state: TaskState::Pending,
            carrier: Default::default(),
            project_id: String::new(),
            user_id: String::new(),
            created_at: now,
            updated_at: now,
        };
        self.queues
            .submit(downstream)
            .await
            .map_err(|e| HandlerError::Store(StoreError::Backend(e.to_string())))?;

        Ok(())
    }

    /// `OnCRDFailed(name, reason)`: per S4, the namespace lock is released
    /// immediately since no downstream stage will occupy it.
    #[instrument(skip(self, labels))]
    pub async fn on_crd_failed(
        &self,
        name: &str,
        namespace: &str,
        reason: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), HandlerError> {
        let identity = parse_identity(labels)?;

        if let Some(mut record) = self
            .fault_injection_store
            .get_by_injection_name(name)
            .await
            .map_err(HandlerError::Store)?
        {
            record.state = FaultInjectionState::InjectFailed;
            self.fault_injection_store
                .update(&record)
                .await
                .map_err(HandlerError::Store)?;
        }

        self.namespace_lock.release(namespace, identity.trace_id).await?;

        publish(
            self.events.as_ref(),
            &identity,
            TaskType::FaultInjection.as_str(),
            EventName::FaultInjectionFailed,
            serde_json::json!({"injection_name": name, "reason": reason}),
        )
        .await;

        self.task_store
            .patch_state(identity.task_id, TaskState::Error)
            .await
            .map_err(HandlerError::Store)?;

        Ok(())
    }

    /// `OnJobAdded`: confirmation only, mirroring [`Self::on_crd_added`].
    #[instrument(skip(self, labels))]
    pub async fn on_job_added(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<(), HandlerError> {
        let _identity = parse_identity(labels)?;
        tracing::debug!(job_name = name, "batch job acknowledged by cluster");
        Ok(())
    }

    /// `OnJobSucceeded`: routes on the recovered `task_type` label, since
    /// both `BuildDatapack` and `RunAlgorithm` complete via a batch Job
    /// callback but advance the pipeline differently.
    #[instrument(skip(self, labels))]
    pub async fn on_job_succeeded(&self, labels: &BTreeMap<String, String>) -> Result<(), HandlerError> {
        let identity = parse_identity(labels)?;
        let task_type = parse_task_type(labels)?;

        self.task_store
            .patch_state(identity.task_id, TaskState::Completed)
            .await
            .map_err(HandlerError::Store)?;

        match task_type {
            TaskType::BuildDatapack => {
                publish(
                    self.events.as_ref(),
                    &identity,
                    task_type.as_str(),
                    EventName::DatasetBuildSucceed,
                    serde_json::json!({}),
                )
                .await;

                // Open Question #1: BuildDatapack's job terminal callback is
                // the last cluster resource occupying the namespace, so the
                // lock RestartPedestal handed downstream is released here.
                let namespace = required_label(labels, "namespace")?;
                self.namespace_lock.release(namespace, identity.trace_id).await?;

                let fault_injection_record_id = labels
                    .get("fault_injection_record_id")
                    .map(|raw| {
                        raw.parse::<Uuid>()
                            .map_err(|e| HandlerError::PayloadInvalid(format!("malformed label fault_injection_record_id: {e}")))
                    })
                    .transpose()?;
                let dataset = required_label(labels, "dataset")?.to_string();

                let now = Utc::now();
                let downstream = Task {
                    task_id: Uuid::new_v4(),
                    group_id: identity.group_id,
                    trace_id: identity.trace_id,
                    payload: TaskPayload::RunAlgorithm(RunAlgorithmPayload {
                        image: self.config.algo_detector.clone(),
                        tag: "latest".into(),
                        dataset,
                        env_vars: Default::default(),
                        fault_injection_record_id,
                    }),
                    immediate: true,
                    execute_time: now.timestamp(),
                    cron_expr: None,
                    retry_policy: RetryPolicy::default(),
                    restart_attempts: 0,
                    state: TaskState::Pending,
                    carrier: Default::default(),
                    project_id: String::new(),
                    user_id: String::new(),
                    created_at: now,
                    updated_at: now,
                };
                self.queues
                    .submit(downstream)
                    .await
                    .map_err(|e| HandlerError::Store(StoreError::Backend(e.to_string())))?;
            }
            TaskType::RunAlgorithm => {
                publish(
                    self.events.as_ref(),
                    &identity,
                    task_type.as_str(),
                    EventName::AlgoRunSucceed,
                    serde_json::json!({}),
                )
                .await;

                let execution_id = required_label(labels, "execution_id")?
                    .parse::<Uuid>()
                    .map_err(|e| HandlerError::PayloadInvalid(format!("malformed label execution_id: {e}")))?;
                let output_path = format!("{}/{}", self.config.nfs_path, execution_id);

                let now = Utc::now();
                let downstream = Task {
                    task_id: Uuid::new_v4(),
                    group_id: identity.group_id,
                    trace_id: identity.trace_id,
                    payload: TaskPayload::CollectResult(CollectResultPayload {
                        execution_id,
                        result_csv_path: format!("{output_path}/result.csv"),
                        conclusion_csv_path: format!("{output_path}/conclusion.csv"),
                    }),
                    immediate: true,
                    execute_time: now.timestamp(),
                    cron_expr: None,
                    retry_policy: RetryPolicy::default(),
                    restart_attempts: 0,
                    state: TaskState::Pending,
                    carrier: Default::default(),
                    project_id: String::new(),
                    user_id: String::new(),
                    created_at: now,
                    updated_at: now,
                };
                self.queues
                    .submit(downstream)
                    .await
                    .map_err(|e| HandlerError::Store(StoreError::Backend(e.to_string())))?;
            }
            other => {
                return Err(HandlerError::PayloadInvalid(format!(
                    "unexpected task_type {other} on job-succeeded callback"
                )));
            }
        }

        Ok(())
    }

    /// `OnJobFailed`: the pipeline halts at this stage; no downstream task
    /// is submitted.
    #[instrument(skip(self, labels))]
    pub async fn on_job_failed(&self, reason: &str, labels: &BTreeMap<String, String>) -> Result<(), HandlerError> {
        let identity = parse_identity(labels)?;
        let task_type = parse_task_type(labels)?;

        self.task_store
            .patch_state(identity.task_id, TaskState::Error)
            .await
            .map_err(HandlerError::Store)?;

        match task_type {
            TaskType::BuildDatapack => {
                publish(
                    self.events.as_ref(),
                    &identity,
                    task_type.as_str(),
                    EventName::DatasetBuildFailed,
                    serde_json::json!({"reason": reason}),
                )
                .await;
                let namespace = required_label(labels, "namespace")?;
                self.namespace_lock.release(namespace, identity.trace_id).await?;
            }
            TaskType::RunAlgorithm => {
                publish(
                    self.events.as_ref(),
                    &identity,
                    task_type.as_str(),
                    EventName::AlgoRunFailed,
                    serde_json::json!({"reason": reason}),
                )
                .await;
                if let Some(raw) = labels.get("execution_id") {
                    let execution_id = raw
                        .parse::<Uuid>()
                        .map_err(|e| HandlerError::PayloadInvalid(format!("malformed label execution_id: {e}")))?;
                    let _ = self
                        .result_store
                        .patch_execution_state(execution_id, ExecutionState::Failed)
                        .await;
                }
            }
            other => {
                return Err(HandlerError::PayloadInvalid(format!(
                    "unexpected task_type {other} on job-failed callback"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rca_common::FaultInjectionRecord;

    fn ingress() -> (IngressCallbacks, Arc<crate::memory::InMemoryBroker>) {
        use crate::events::StreamEventSink;
        use crate::store::memory::{InMemoryFaultInjectionStore, InMemoryResultStore, InMemoryTaskStore};

        let broker = Arc::new(crate::memory::InMemoryBroker::default());
        let task_store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::default());
        let callbacks = IngressCallbacks {
            task_store: task_store.clone(),
            fault_injection_store: Arc::new(InMemoryFaultInjectionStore::default()),
            result_store: Arc::new(InMemoryResultStore::default()),
            namespace_lock: Arc::new(NamespaceLockManager::new(broker.clone() as Arc<dyn crate::broker::BrokerOps>)),
            queues: Arc::new(TaskQueues::new(broker.clone() as Arc<dyn crate::broker::BrokerOps>, task_store)),
            events: Arc::new(StreamEventSink::new(broker.clone() as Arc<dyn crate::broker::BrokerOps>)),
            config: Arc::new(PipelineConfig::default()),
        };
        (callbacks, broker)
    }

    fn identity_labels(task_id: Uuid, trace_id: Uuid, group_id: Uuid, task_type: TaskType) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("task_id".into(), task_id.to_string());
        labels.insert("trace_id".into(), trace_id.to_string());
        labels.insert("group_id".into(), group_id.to_string());
        labels.insert("task_type".into(), task_type.as_str().to_string());
        labels
    }

    fn seeded_record(task_id: Uuid, injection_name: &str) -> FaultInjectionRecord {
        FaultInjectionRecord {
            id: Uuid::new_v4(),
            task_id,
            fault_type: 1,
            display_config: serde_json::json!({}),
            engine_config: serde_json::json!({}),
            pre_duration: 20,
            start_time: None,
            end_time: None,
            benchmark: "ts-cb".into(),
            injection_name: injection_name.into(),
            state: FaultInjectionState::Initial,
            labels: Default::default(),
        }
    }

    #[tokio::test]
    async fn crd_succeeded_updates_record_and_submits_build_datapack() {
        let (callbacks, _broker) = ingress();
        let task_id = Uuid::new_v4();
        let trace_id = Uuid::new_v4();
        let group_id = Uuid::new_v4();

        let record = seeded_record(task_id, "ts-cb-ts0-abcd1234");
        callbacks.fault_injection_store.create(&record).await.unwrap();
        callbacks
            .namespace_lock
            .check_and_lock("ts0", i64::MAX, trace_id)
            .await
            .unwrap();

        let labels = identity_labels(task_id, trace_id, group_id, TaskType::FaultInjection);
        let start = Utc::now();
        let end = start + chrono::Duration::minutes(5);

        callbacks
            .on_crd_succeeded("ts-cb-ts0-abcd1234", "ts0", start, end, &labels)
            .await
            .unwrap();

        let updated = callbacks
            .fault_injection_store
            .get_by_injection_name("ts-cb-ts0-abcd1234")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.state, FaultInjectionState::InjectSuccess);
        assert_eq!(updated.start_time, Some(start));
    }

    #[tokio::test]
    async fn crd_failed_releases_namespace_lock_and_marks_task_error() {
        let (callbacks, _broker) = ingress();
        let task_id = Uuid::new_v4();
        let trace_id = Uuid::new_v4();
        let group_id = Uuid::new_v4();

        let now = Utc::now();
        let task = Task {
            task_id,
            group_id,
            trace_id,
            payload: TaskPayload::FaultInjection(rca_common::FaultInjectionPayload {
                benchmark: "ts-cb".into(),
                fault_type: 1,
                namespace: "ts0".into(),
                pre_duration: 20,
                display_config: serde_json::json!({}),
                engine_config: serde_json::json!({}),
                labels: Default::default(),
            }),
            immediate: false,
            execute_time: now.timestamp(),
            cron_expr: None,
            retry_policy: RetryPolicy::default(),
            restart_attempts: 0,
            state: TaskState::Running,
            carrier: Default::default(),
            project_id: String::new(),
            user_id: String::new(),
            created_at: now,
            updated_at: now,
        };
        callbacks.task_store.create(&task).await.unwrap();

        let record = seeded_record(task_id, "ts-cb-ts0-abcd1234");
        callbacks.fault_injection_store.create(&record).await.unwrap();
        callbacks
            .namespace_lock
            .check_and_lock("ts0", i64::MAX, trace_id)
            .await
            .unwrap();

        let labels = identity_labels(task_id, trace_id, group_id, TaskType::FaultInjection);
        callbacks
            .on_crd_failed("ts-cb-ts0-abcd1234", "ts0", "chaos engine timeout", &labels)
            .await
            .unwrap();

        let stored = callbacks.task_store.get(task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Error);

        // Lock was released: a fresh trace can now acquire "ts0".
        let other_trace = Uuid::new_v4();
        callbacks
            .namespace_lock
            .check_and_lock("ts0", i64::MAX, other_trace)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn job_succeeded_for_build_datapack_releases_namespace_and_submits_run_algorithm() {
        let (callbacks, _broker) = ingress();
        let task_id = Uuid::new_v4();
        let trace_id = Uuid::new_v4();
        let group_id = Uuid::new_v4();

        let now = Utc::now();
        let task = Task {
            task_id,
            group_id,
            trace_id,
            payload: TaskPayload::BuildDatapack(BuildDatapackPayload {
                benchmark: "ts-cb".into(),
                dataset_name: "ts-cb-ts0".into(),
                namespace: "ts0".into(),
                pre_duration: 20,
                service: "ts-order".into(),
                start_time: Some(now),
                end_time: Some(now + chrono::Duration::minutes(5)),
                fault_injection_record_id: None,
            }),
            immediate: true,
            execute_time: now.timestamp(),
            cron_expr: None,
            retry_policy: RetryPolicy::default(),
            restart_attempts: 0,
            state: TaskState::Running,
            carrier: Default::default(),
            project_id: String::new(),
            user_id: String::new(),
            created_at: now,
            updated_at: now,
        };
        callbacks.task_store.create(&task).await.unwrap();
        callbacks
            .namespace_lock
            .check_and_lock("ts0", i64::MAX, trace_id)
            .await
            .unwrap();

        let mut labels = identity_labels(task_id, trace_id, group_id, TaskType::BuildDatapack);
        labels.insert("namespace".into(), "ts0".into());
        labels.insert("dataset".into(), "ts-cb-ts0".into());

        callbacks.on_job_succeeded(&labels).await.unwrap();

        let stored = callbacks.task_store.get(task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Completed);

        let other_trace = Uuid::new_v4();
        callbacks
            .namespace_lock
            .check_and_lock("ts0", i64::MAX, other_trace)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn job_failed_for_run_algorithm_marks_execution_failed() {
        let (callbacks, _broker) = ingress();
        let task_id = Uuid::new_v4();
        let trace_id = Uuid::new_v4();
        let group_id = Uuid::new_v4();
        let execution_id = Uuid::new_v4();

        let now = Utc::now();
        let task = Task {
            task_id,
            group_id,
            trace_id,
            payload: TaskPayload::RunAlgorithm(RunAlgorithmPayload {
                image: "detector".into(),
                tag: "v1".into(),
                dataset: "ts-cb-ts0".into(),
                env_vars: Default::default(),
                fault_injection_record_id: None,
            }),
            immediate: true,
            execute_time: now.timestamp(),
            cron_expr: None,
            retry_policy: RetryPolicy::default(),
            restart_attempts: 0,
            state: TaskState::Running,
            carrier: Default::default(),
            project_id: String::new(),
            user_id: String::new(),
            created_at: now,
            updated_at: now,
        };
        callbacks.task_store.create(&task).await.unwrap();

        let execution = rca_common::ExecutionResult {
            id: execution_id,
            task_id,
            fault_injection_record_id: None,
            image: "detector".into(),
            tag: "v1".into(),
            dataset: "ts-cb-ts0".into(),
            state: ExecutionState::Initial,
            created_at: now,
        };
        callbacks.result_store.create_execution(&execution).await.unwrap();

        let mut labels = identity_labels(task_id, trace_id, group_id, TaskType::RunAlgorithm);
        labels.insert("execution_id".into(), execution_id.to_string());

        callbacks.on_job_failed("pod OOMKilled", &labels).await.unwrap();

        let stored = callbacks.task_store.get(task_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Error);

        let updated_execution = callbacks.result_store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(updated_execution.state, ExecutionState::Failed);
    }
}
