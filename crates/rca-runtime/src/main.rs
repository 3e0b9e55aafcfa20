//! The RCA experiment controller daemon entry point: wires Redis, SQLite,
//! the worker pool and dispatcher, axum ingress, and the gRPC submission
//! server, then runs until a shutdown signal arrives.

use std::sync::Arc;

use rca_core::broker::BrokerOps;
use rca_core::dispatcher::Dispatcher;
use rca_core::events::{EventSink, StreamEventSink};
use rca_core::handlers::{
    build_container::BuildContainerHandler, build_datapack::BuildDatapackHandler,
    collect_result::CollectResultHandler, fault_injection::FaultInjectionHandler,
    restart_pedestal::RestartPedestalHandler, run_algorithm::RunAlgorithmHandler, HandlerContext,
};
use rca_core::ingress::IngressCallbacks;
use rca_core::namespace_lock::NamespaceLockManager;
use rca_core::queues::TaskQueues;
use rca_core::rate_limiter::RateLimiter;
use rca_core::store::{FaultInjectionStore, ResultStore, TaskStore};
use rca_core::worker::WorkerPool;
use rca_common::TaskType;
use tokio_util::sync::CancellationToken;

use rca_runtime::cluster_gateway::{HttpBuilderClient, HttpClusterGateway};
use rca_runtime::config::{load_pipeline_config, RuntimeArgs};
use rca_runtime::grpc::SubmissionService;
use rca_runtime::redis_broker::RedisBroker;
use rca_runtime::sqlite_store::SqliteStore;
use rca_runtime::{http, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = RuntimeArgs::load();
    telemetry::init(args.log_json);

    let config = Arc::new(load_pipeline_config(&args.config_path).await?);
    tracing::info!(config_path = %args.config_path.display(), "loaded pipeline config");

    let broker: Arc<dyn BrokerOps> = Arc::new(RedisBroker::connect(&args.redis_url).await?);
    let store = Arc::new(SqliteStore::open(&args.sqlite_path)?);
    let task_store: Arc<dyn TaskStore> = store.clone();
    let fault_injection_store: Arc<dyn FaultInjectionStore> = store.clone();
    let result_store: Arc<dyn ResultStore> = store.clone();

    let builder_url = args
        .builder_url
        .clone()
        .unwrap_or_else(|| config.buildkit_address.clone());
    let cluster = Arc::new(HttpClusterGateway::new(args.cluster_api_url.clone()));
    let builder = Arc::new(HttpBuilderClient::new(builder_url));

    let events: Arc<dyn EventSink> = Arc::new(StreamEventSink::new(broker.clone()));
    let namespace_lock = Arc::new(NamespaceLockManager::new(broker.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(broker.clone(), config.max_concurrent_restarts));
    let queues = Arc::new(TaskQueues::new(broker.clone(), task_store.clone()));

    let ctx = Arc::new(HandlerContext {
        namespace_lock: namespace_lock.clone(),
        rate_limiter,
        task_store: task_store.clone(),
        fault_injection_store: fault_injection_store.clone(),
        result_store: result_store.clone(),
        queues: queues.clone(),
        cluster,
        builder,
        events: events.clone(),
        config: config.clone(),
    });

    let mut dispatcher = Dispatcher::new();
    dispatcher.register(TaskType::RestartPedestal, Arc::new(RestartPedestalHandler));
    dispatcher.register(TaskType::FaultInjection, Arc::new(FaultInjectionHandler));
    dispatcher.register(TaskType::BuildDatapack, Arc::new(BuildDatapackHandler));
    dispatcher.register(TaskType::RunAlgorithm, Arc::new(RunAlgorithmHandler));
    dispatcher.register(TaskType::CollectResult, Arc::new(CollectResultHandler));
    dispatcher.register(TaskType::BuildContainer, Arc::new(BuildContainerHandler));
    let dispatcher = Arc::new(dispatcher);

    let worker_pool = WorkerPool::new(broker.clone(), dispatcher, ctx, &config);

    let shutdown = CancellationToken::new();

    let pool_handle = {
        let pool = worker_pool.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };

    let tick_handle = {
        let queues = queues.clone();
        let shutdown = shutdown.clone();
        let interval = std::time::Duration::from_millis(args.tick_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = queues.tick().await {
                            tracing::warn!(%err, "scheduler tick failed");
                        }
                    }
                }
            }
        })
    };

    let ingress_callbacks = Arc::new(IngressCallbacks {
        task_store,
        fault_injection_store: fault_injection_store.clone(),
        result_store,
        namespace_lock,
        queues: queues.clone(),
        events: events.clone(),
        config,
    });

    let http_listener = tokio::net::TcpListener::bind(&args.http_listen).await?;
    tracing::info!(addr = %args.http_listen, "ingress HTTP server listening");
    let http_handle = {
        let shutdown = shutdown.clone();
        let router = http::router(ingress_callbacks);
        tokio::spawn(async move {
            axum::serve(http_listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        })
    };

    let submission = SubmissionService {
        queues,
        broker,
        events,
        fault_injection_store,
        worker_pool: worker_pool.clone(),
    };
    let grpc_addr = args.grpc_listen.parse()?;
    tracing::info!(addr = %args.grpc_listen, "submission gRPC server listening");
    let grpc_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(rca_proto::rca_submission_server::RcaSubmissionServer::new(submission))
                .serve_with_shutdown(grpc_addr, shutdown.cancelled_owned())
                .await
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    shutdown.cancel();

    let _ = pool_handle.await;
    let _ = tick_handle.await;
    let _ = http_handle.await;
    let _ = grpc_handle.await;

    Ok(())
}
