//! Generated gRPC types for the submission surface, plus conversions to
//! and from `rca-common`'s domain types. The core crate never depends on
//! this; only `rca-runtime`'s server and out-of-process submitters do.

pub mod conversions;

tonic::include_proto!("rca.v1");

pub use conversions::ProtoError;
