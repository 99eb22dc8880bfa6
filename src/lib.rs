//! OpenAI-compatible inference gateway.
//!
//! Requests arrive over HTTP (or a WebSocket for Open Responses), are
//! resolved against per-model YAML configuration, templated into prompts
//! and dispatched over gRPC to backend processes that the gateway spawns,
//! caches and supervises.

pub mod backend;
pub mod config;
pub mod error;
pub mod inference;
pub mod logging;
pub mod mcp;
pub mod middleware;
pub mod routers;
pub mod server;

pub use error::{GatewayError, GatewayResult};
pub use server::{build_app, AppContext};
