//! Backend processes: spawning, health gating, caching and eviction.

pub mod instance;
pub mod kinds;
pub mod loader;
pub mod process;
pub mod watchdog;

pub use instance::{BackendInstance, InferenceGuard};
pub use loader::{BackendLoader, LoadedBackend};
pub use process::BackendProcess;
pub use watchdog::Watchdog;
