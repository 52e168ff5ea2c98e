//! Remote protocol service access.
//!
//! `RemoteService` abstracts the service behind three outcome classes
//! (success, authorization failure, transient failure, plus pass-through
//! rejections). `XrpcService` implements it over HTTP, and `RequestPipeline`
//! wraps every call with the right credential, refresh-and-retry and
//! bounded backoff.

pub mod error;
pub mod operation;
pub mod pipeline;
pub mod service;
pub mod xrpc;

pub use error::CallError;
pub use operation::{Operation, OperationKind};
pub use pipeline::RequestPipeline;
pub use service::RemoteService;
pub use xrpc::XrpcService;
