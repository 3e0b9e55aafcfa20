//! The RCA experiment controller daemon: wires the Redis-backed broker,
//! the SQLite-backed stores, the worker pool and dispatcher, the axum
//! ingress transport, and the gRPC submission server described in the core
//! crate's component seams.

pub mod cluster_gateway;
pub mod config;
pub mod grpc;
pub mod http;
pub mod redis_broker;
pub mod sqlite_store;
pub mod telemetry;
