//! gRPC client for local model backends.
//!
//! `backend.proto` is compiled at build time; [`BackendClient`] wraps the
//! generated client with typed errors and streams that cancel the call when
//! dropped.

pub mod backend;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{proto, BackendClient, PredictStream, ReplyStream, TtsStream};
pub use error::{ClientError, Result};
