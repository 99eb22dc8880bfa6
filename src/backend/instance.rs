use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use grpc_client::BackendClient;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedMutexGuard};

use super::process::BackendProcess;

#[derive(Debug)]
struct Activity {
    in_flight: usize,
    busy_since: Option<Instant>,
    idle_since: Option<Instant>,
    last_used: Instant,
}

/// A loaded model: its gRPC client plus the process serving it, if spawned.
#[derive(Debug)]
pub struct BackendInstance {
    model: String,
    backend: String,
    client: BackendClient,
    process: Option<BackendProcess>,
    activity: Mutex<Activity>,
    idle: Notify,
    /// Serialises inference for backends that are not re-entrant
    inference_lock: Option<Arc<tokio::sync::Mutex<()>>>,
    loaded_at: Instant,
}

impl BackendInstance {
    pub fn new(
        model: impl Into<String>,
        backend: impl Into<String>,
        client: BackendClient,
        process: Option<BackendProcess>,
        parallel_requests: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            model: model.into(),
            backend: backend.into(),
            client,
            process,
            activity: Mutex::new(Activity {
                in_flight: 0,
                busy_since: None,
                idle_since: Some(now),
                last_used: now,
            }),
            idle: Notify::new(),
            inference_lock: (!parallel_requests).then(|| Arc::new(tokio::sync::Mutex::new(()))),
            loaded_at: now,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn client(&self) -> &BackendClient {
        &self.client
    }

    pub fn address(&self) -> &str {
        self.client.address()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(BackendProcess::pid)
    }

    /// Connected backends are assumed alive; spawned ones must still be running.
    pub fn is_alive(&self) -> bool {
        self.process.as_ref().is_none_or(BackendProcess::is_running)
    }

    pub fn loaded_for(&self) -> Duration {
        self.loaded_at.elapsed()
    }

    pub fn in_flight(&self) -> usize {
        self.activity.lock().in_flight
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight() > 0
    }

    pub fn last_used(&self) -> Instant {
        self.activity.lock().last_used
    }

    /// How long the backend has been busy, if it is.
    pub fn busy_for(&self) -> Option<Duration> {
        self.activity.lock().busy_since.map(|t| t.elapsed())
    }

    /// How long the backend has been idle, if it is.
    pub fn idle_for(&self) -> Option<Duration> {
        self.activity.lock().idle_since.map(|t| t.elapsed())
    }

    pub fn touch(&self) {
        self.activity.lock().last_used = Instant::now();
    }

    /// Wait for the inference slot, then mark the backend busy until the
    /// returned guard drops.
    pub async fn acquire(self: &Arc<Self>) -> InferenceGuard {
        let permit = match &self.inference_lock {
            Some(lock) => Some(lock.clone().lock_owned().await),
            None => None,
        };
        self.mark_busy();
        InferenceGuard {
            instance: self.clone(),
            _permit: permit,
        }
    }

    fn mark_busy(&self) {
        let now = Instant::now();
        let mut activity = self.activity.lock();
        activity.in_flight += 1;
        activity.busy_since.get_or_insert(now);
        activity.idle_since = None;
        activity.last_used = now;
    }

    fn mark_idle(&self) {
        let now = Instant::now();
        let became_idle = {
            let mut activity = self.activity.lock();
            activity.in_flight = activity.in_flight.saturating_sub(1);
            activity.last_used = now;
            if activity.in_flight == 0 {
                activity.busy_since = None;
                activity.idle_since = Some(now);
                true
            } else {
                false
            }
        };
        if became_idle {
            self.idle.notify_waiters();
        }
    }

    /// Resolve once no request is using the backend.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.is_busy() {
                return;
            }
            notified.await;
        }
    }

    pub async fn stop(&self) {
        if let Some(process) = &self.process {
            process.stop().await;
        }
    }
}

/// Marks a backend busy for its lifetime.
///
/// Streaming handlers keep it alive inside the response stream so the
/// backend stays busy until the last token is sent.
#[derive(Debug)]
pub struct InferenceGuard {
    instance: Arc<BackendInstance>,
    _permit: Option<OwnedMutexGuard<()>>,
}

impl InferenceGuard {
    pub fn instance(&self) -> &Arc<BackendInstance> {
        &self.instance
    }

    pub fn client(&self) -> &BackendClient {
        self.instance.client()
    }
}

impl Drop for InferenceGuard {
    fn drop(&mut self) {
        self.instance.mark_idle();
    }
}
