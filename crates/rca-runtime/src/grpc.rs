//! The tonic server implementing `RcaSubmission`, wiring each RPC onto the
//! core's queues/broker/worker pool/event sink.

use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use rca_core::broker::BrokerOps;
use rca_core::events::EventSink;
use rca_core::queues::TaskQueues;
use rca_core::store::FaultInjectionStore;
use rca_core::worker::WorkerPool;
use rca_proto::rca_submission_server::RcaSubmission;
use rca_proto::{
    CancelRequest, CancelResponse, EventEnvelope, GetStatusRequest, GetStatusResponse,
    SubmitBatchRequest, SubmitBatchResponse, SubmitRequest, SubmitResponse, TailEventsRequest,
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use uuid::Uuid;

pub struct SubmissionService {
    pub queues: Arc<TaskQueues>,
    pub broker: Arc<dyn BrokerOps>,
    pub events: Arc<dyn EventSink>,
    pub fault_injection_store: Arc<dyn FaultInjectionStore>,
    pub worker_pool: Arc<WorkerPool>,
}

fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, Status> {
    raw.parse()
        .map_err(|e| Status::invalid_argument(format!("malformed {field}: {e}")))
}

#[tonic::async_trait]
impl RcaSubmission for SubmissionService {
    async fn submit(
        &self,
        request: Request<SubmitRequest>,
    ) -> Result<Response<SubmitResponse>, Status> {
        let request = request.into_inner();
        let task = rca_proto::conversions::task_from_submit_request(&request)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let trace_id = task.trace_id;
        let group_id = task.group_id;
        let task_id = self
            .queues
            .submit(task)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(SubmitResponse {
            task_id: task_id.to_string(),
            trace_id: trace_id.to_string(),
            group_id: group_id.to_string(),
        }))
    }

    async fn submit_fault_injection_batch(
        &self,
        request: Request<SubmitBatchRequest>,
    ) -> Result<Response<SubmitBatchResponse>, Status> {
        let request = request.into_inner();
        let tasks = request
            .tasks
            .iter()
            .map(rca_proto::conversions::task_from_submit_request)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let outcome = self
            .queues
            .submit_fault_injection_batch(tasks, self.fault_injection_store.as_ref())
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(SubmitBatchResponse {
            submitted_task_ids: outcome.submitted.iter().map(Uuid::to_string).collect(),
            duplicated_count: outcome.duplicated_count as u32,
        }))
    }

    async fn cancel(
        &self,
        request: Request<CancelRequest>,
    ) -> Result<Response<CancelResponse>, Status> {
        let task_id = parse_uuid(&request.into_inner().task_id, "task_id")?;
        self.worker_pool.cancel_running(task_id);
        let removed = self
            .queues
            .cancel(task_id)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(CancelResponse { removed }))
    }

    async fn get_status(
        &self,
        request: Request<GetStatusRequest>,
    ) -> Result<Response<GetStatusResponse>, Status> {
        let task_id = parse_uuid(&request.into_inner().task_id, "task_id")?;
        let status = self
            .broker
            .status_get(task_id)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(match status {
            Some((state, message)) => GetStatusResponse {
                found: true,
                state,
                message,
            },
            None => GetStatusResponse {
                found: false,
                state: String::new(),
                message: String::new(),
            },
        }))
    }

    type TailEventsStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope, Status>> + Send + 'static>>;

    async fn tail_events(
        &self,
        request: Request<TailEventsRequest>,
    ) -> Result<Response<Self::TailEventsStream>, Status> {
        let request = request.into_inner();
        let trace_id = parse_uuid(&request.trace_id, "trace_id")?;
        let after_id = request.after_id;
        let events = self.events.clone();

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            let mut cursor = after_id;
            loop {
                let batch = match events.replay_then_tail(trace_id, cursor.as_deref()).await {
                    Ok(batch) => batch,
                    Err(err) => {
                        let _ = tx.send(Err(Status::internal(err.to_string()))).await;
                        return;
                    }
                };
                for (id, event) in batch {
                    cursor = Some(id.clone());
                    let envelope = rca_proto::conversions::event_envelope(
                        &id,
                        event.task_id,
                        &event.task_type,
                        &event,
                    );
                    if tx.send(Ok(envelope)).await.is_err() {
                        return;
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
