//! Wire types for the inference gateway.
//!
//! OpenAI-compatible chat, completion, embedding, image, audio and rerank
//! payloads, the Anthropic Messages surface, Open Responses resources and
//! stream event names, plus the gateway's own auxiliary endpoints.

pub mod audio;
pub mod chat;
pub mod common;
pub mod completion;
pub mod embedding;
pub mod event_types;
pub mod extras;
pub mod images;
pub mod messages;
pub mod models;
pub mod rerank;
pub mod responses;
pub mod usecase;
pub mod validated;
