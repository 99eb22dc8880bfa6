//! Response Store for the Responses API.
//!
//! Keeps response resources, their output items and the ordered log of
//! streamed events in memory, so background responses can be polled,
//! cancelled and resumed from any sequence number.

mod core;
mod memory;
mod stream;

pub use core::{StoreError, StoreResult, StoredEvent, StoredResponse};

pub use memory::{EventSignal, ResponseStore};
pub use stream::follow_events;
pub use tokio_util::sync::CancellationToken;
