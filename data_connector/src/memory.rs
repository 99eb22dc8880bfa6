//! In-memory Response Store.
//!
//! The registry lock guards only the id map. Every entry has its own lock,
//! so writers on one response never wait on readers of another. Entries are
//! cloned out of the registry before their lock is taken; the two locks are
//! never held in the opposite order.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use openai_protocol::{
    event_types::is_terminal_event,
    responses::{ResponseItem, ResponseObject, ResponseStatus, ResponsesRequest},
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{StoreError, StoreResult, StoredEvent, StoredResponse};

struct EntryState {
    request: ResponsesRequest,
    response: ResponseObject,
    items: HashMap<String, ResponseItem>,
    events: Vec<StoredEvent>,
    stored_at: Instant,
    stored_at_unix: i64,
    expires_at: Option<Instant>,
    cancel: Option<CancellationToken>,
    background: bool,
    closed: bool,
}

impl EntryState {
    fn index_items(&mut self) {
        self.items = self
            .response
            .output
            .iter()
            .filter_map(|item| match item.id() {
                Some(id) if !id.is_empty() => Some((id.to_string(), item.clone())),
                _ => None,
            })
            .collect();
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn snapshot(&self) -> StoredResponse {
        StoredResponse {
            request: self.request.clone(),
            response: self.response.clone(),
            status: self.response.status,
            stored_at: self.stored_at_unix,
            event_count: self.events.len() as u64,
            closed: self.closed,
            background: self.background,
        }
    }
}

struct Entry {
    state: Mutex<EntryState>,
    /// Number of events appended so far; bumped after every append and once
    /// more when the stream closes.
    signal: watch::Sender<u64>,
}

/// Receiver side of an entry's event signal.
///
/// `changed()` resolves whenever events are appended or the stream closes.
pub type EventSignal = watch::Receiver<u64>;

/// TTL-backed store of Responses API resources and their event logs.
pub struct ResponseStore {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    ttl: RwLock<Option<Duration>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResponseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStore")
            .field("entries", &self.entries.read().len())
            .field("ttl", &*self.ttl.read())
            .finish()
    }
}

impl ResponseStore {
    /// Create a store. A zero TTL keeps responses until deleted.
    ///
    /// When called inside a tokio runtime and `ttl` is non-zero, a sweep task
    /// runs every `ttl / 2`.
    pub fn new(ttl: Duration) -> Arc<Self> {
        let store = Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            ttl: RwLock::new(None),
            sweeper: Mutex::new(None),
        });
        store.set_ttl(ttl);
        store
    }

    pub fn ttl(&self) -> Option<Duration> {
        *self.ttl.read()
    }

    /// Change the TTL, re-deriving expiry of existing entries and restarting
    /// the sweep task.
    pub fn set_ttl(self: &Arc<Self>, ttl: Duration) {
        let ttl = (!ttl.is_zero()).then_some(ttl);
        *self.ttl.write() = ttl;

        for entry in self.all_entries() {
            let mut state = entry.state.lock();
            state.expires_at = ttl.map(|ttl| state.stored_at + ttl);
        }

        let mut sweeper = self.sweeper.lock();
        if let Some(handle) = sweeper.take() {
            handle.abort();
        }
        let Some(ttl) = ttl else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, expired responses are only removed on access");
            return;
        };
        let interval = (ttl / 2).max(Duration::from_millis(1));
        let weak: Weak<Self> = Arc::downgrade(self);
        *sweeper = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                let removed = store.cleanup();
                if removed > 0 {
                    debug!(removed, "Swept expired responses");
                }
            }
        }));
        info!(ttl_secs = ttl.as_secs_f64(), "Response store TTL configured");
    }

    fn all_entries(&self) -> Vec<Arc<Entry>> {
        self.entries.read().values().cloned().collect()
    }

    fn insert(
        &self,
        id: &str,
        request: ResponsesRequest,
        response: ResponseObject,
        cancel: Option<CancellationToken>,
        background: bool,
    ) {
        let now = Instant::now();
        let mut state = EntryState {
            request,
            response,
            items: HashMap::new(),
            events: Vec::new(),
            stored_at: now,
            stored_at_unix: chrono::Utc::now().timestamp(),
            expires_at: self.ttl().map(|ttl| now + ttl),
            cancel,
            background,
            closed: false,
        };
        state.index_items();
        let entry = Arc::new(Entry {
            state: Mutex::new(state),
            signal: watch::channel(0).0,
        });
        if self.entries.write().insert(id.to_string(), entry).is_some() {
            warn!(response_id = %id, "Replaced an existing stored response");
        }
        debug!(response_id = %id, background, "Stored response");
    }

    /// Insert a response, indexing every output item that has an id.
    pub fn store(&self, id: &str, request: ResponsesRequest, response: ResponseObject) {
        self.insert(id, request, response, None, false);
    }

    /// Insert a background response with its cancel handle. The status is
    /// seeded to `queued`.
    pub fn store_background(
        &self,
        id: &str,
        request: ResponsesRequest,
        mut response: ResponseObject,
        cancel: CancellationToken,
    ) {
        response.status = ResponseStatus::Queued;
        self.insert(id, request, response, Some(cancel), true);
    }

    /// Look up a live entry. Expired entries are removed and reported.
    fn entry(&self, id: &str) -> StoreResult<Arc<Entry>> {
        let entry = self
            .entries
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let expired = entry.state.lock().is_expired(Instant::now());
        if expired {
            self.remove_if_same(id, &entry);
            return Err(StoreError::Expired(id.to_string()));
        }
        Ok(entry)
    }

    fn remove_if_same(&self, id: &str, entry: &Arc<Entry>) {
        let mut entries = self.entries.write();
        if entries.get(id).is_some_and(|current| Arc::ptr_eq(current, entry)) {
            entries.remove(id);
        }
    }

    pub fn get(&self, id: &str) -> StoreResult<StoredResponse> {
        let entry = self.entry(id)?;
        let snapshot = entry.state.lock().snapshot();
        Ok(snapshot)
    }

    pub fn get_item(&self, id: &str, item_id: &str) -> StoreResult<ResponseItem> {
        let entry = self.entry(id)?;
        let state = entry.state.lock();
        state
            .items
            .get(item_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(item_id.to_string()))
    }

    /// First non-expired response holding an item with this id.
    pub fn find_item(&self, item_id: &str) -> StoreResult<ResponseItem> {
        let now = Instant::now();
        self.all_entries()
            .iter()
            .find_map(|entry| {
                let state = entry.state.lock();
                if state.is_expired(now) {
                    return None;
                }
                state.items.get(item_id).cloned()
            })
            .ok_or_else(|| StoreError::NotFound(item_id.to_string()))
    }

    /// Replace the response resource and re-index its items. A closed
    /// response (finished or cancelled) is final.
    pub fn update_response(&self, id: &str, response: ResponseObject) -> StoreResult<()> {
        let entry = self.entry(id)?;
        let mut state = entry.state.lock();
        if state.closed {
            return Err(StoreError::AlreadyClosed(id.to_string()));
        }
        state.response = response;
        state.index_items();
        Ok(())
    }

    /// Set the status. A terminal status also closes the event stream.
    pub fn update_status(
        &self,
        id: &str,
        status: ResponseStatus,
        completed_at: Option<i64>,
    ) -> StoreResult<()> {
        let entry = self.entry(id)?;
        let mut state = entry.state.lock();
        if state.closed {
            return Err(StoreError::AlreadyClosed(id.to_string()));
        }
        state.response.status = status;
        if completed_at.is_some() {
            state.response.completed_at = completed_at;
        }
        if !status.is_terminal() {
            return Ok(());
        }
        state.closed = true;
        let count = state.events.len() as u64;
        drop(state);
        entry.signal.send_replace(count);
        Ok(())
    }

    /// Append an event, assigning the next sequence number.
    ///
    /// The event's `type` field names it; any `sequence_number` already in
    /// `payload` is overwritten. A terminal event closes the stream.
    pub fn append_event(&self, id: &str, mut payload: Value) -> StoreResult<StoredEvent> {
        let entry = self.entry(id)?;
        let mut state = entry.state.lock();
        if state.closed {
            return Err(StoreError::AlreadyClosed(id.to_string()));
        }
        let event = Self::push_event(&mut state, &mut payload);
        let count = state.events.len() as u64;
        drop(state);
        entry.signal.send_replace(count);
        Ok(event)
    }

    fn push_event(state: &mut EntryState, payload: &mut Value) -> StoredEvent {
        let sequence_number = state.events.len() as u64;
        if let Value::Object(map) = payload {
            map.insert("sequence_number".to_string(), Value::from(sequence_number));
        }
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if is_terminal_event(&event_type) {
            state.closed = true;
        }
        let event = StoredEvent {
            sequence_number,
            event_type,
            payload: payload.clone(),
        };
        state.events.push(event.clone());
        event
    }

    /// Mark the stream closed without appending anything.
    pub fn close(&self, id: &str) -> StoreResult<()> {
        let entry = self.entry(id)?;
        let count = {
            let mut state = entry.state.lock();
            state.closed = true;
            state.events.len() as u64
        };
        entry.signal.send_replace(count);
        Ok(())
    }

    /// Events with `sequence_number > after`, or all events when `after` is
    /// `None`, in order.
    pub fn get_events_after(&self, id: &str, after: Option<u64>) -> StoreResult<Vec<StoredEvent>> {
        let entry = self.entry(id)?;
        let state = entry.state.lock();
        let start = after.map_or(0, |n| (n + 1) as usize).min(state.events.len());
        Ok(state.events[start..].to_vec())
    }

    /// Signal that fires whenever events are appended to `id`.
    pub fn subscribe(&self, id: &str) -> StoreResult<EventSignal> {
        Ok(self.entry(id)?.signal.subscribe())
    }

    pub fn is_closed(&self, id: &str) -> StoreResult<bool> {
        Ok(self.entry(id)?.state.lock().closed)
    }

    pub fn cancel_handle(&self, id: &str) -> StoreResult<Option<CancellationToken>> {
        Ok(self.entry(id)?.state.lock().cancel.clone())
    }

    /// Cancel a response.
    ///
    /// Terminal responses are returned untouched. Otherwise the status
    /// becomes `cancelled`, the cancel handle fires and, if the stream is
    /// still open, one `response.failed` event carrying the cancelled
    /// resource is appended before the stream closes.
    pub fn cancel(&self, id: &str) -> StoreResult<ResponseObject> {
        let entry = self.entry(id)?;
        let mut state = entry.state.lock();
        if state.response.status.is_terminal() {
            return Ok(state.response.clone());
        }
        state.response.status = ResponseStatus::Cancelled;
        state.response.completed_at = Some(chrono::Utc::now().timestamp());
        if let Some(token) = &state.cancel {
            token.cancel();
        }
        if !state.closed {
            let mut payload = serde_json::json!({
                "type": openai_protocol::event_types::ResponseEvent::FAILED,
                "response": state.response,
            });
            Self::push_event(&mut state, &mut payload);
        }
        state.closed = true;
        let response = state.response.clone();
        let count = state.events.len() as u64;
        drop(state);
        entry.signal.send_replace(count);
        info!(response_id = %id, "Cancelled response");
        Ok(response)
    }

    pub fn delete(&self, id: &str) -> StoreResult<()> {
        let entry = self
            .entries
            .write()
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        // wake followers so they notice the stream is gone
        let count = {
            let mut state = entry.state.lock();
            state.closed = true;
            state.events.len() as u64
        };
        entry.signal.send_replace(count);
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.entries.read().len()
    }

    /// Remove every expired entry, returning how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, Arc<Entry>)> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.state.lock().is_expired(now))
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        for (id, entry) in &expired {
            self.remove_if_same(id, entry);
        }
        expired.len()
    }
}

impl Drop for ResponseStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use openai_protocol::responses::ResponseObject;
    use serde_json::json;

    use super::*;

    fn request() -> ResponsesRequest {
        serde_json::from_value(json!({"model": "m", "input": "hi"})).unwrap()
    }

    fn response(id: &str) -> ResponseObject {
        ResponseObject::from_request(id.to_string(), &request(), ResponseStatus::InProgress)
    }

    fn event(kind: &str) -> Value {
        json!({"type": kind, "sequence_number": 99})
    }

    #[test]
    fn sequence_numbers_are_contiguous_from_zero() {
        let store = ResponseStore::new(Duration::ZERO);
        store.store("resp_1", request(), response("resp_1"));
        for kind in ["response.created", "response.in_progress", "response.output_text.delta"] {
            store.append_event("resp_1", event(kind)).unwrap();
        }
        let events = store.get_events_after("resp_1", Some(0)).unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(events[0].payload["sequence_number"], 1);
        assert_eq!(store.get_events_after("resp_1", None).unwrap().len(), 3);
        assert!(store.get_events_after("resp_1", Some(10)).unwrap().is_empty());
    }

    #[test]
    fn terminal_event_closes_stream() {
        let store = ResponseStore::new(Duration::ZERO);
        store.store("r", request(), response("r"));
        store.append_event("r", event("response.completed")).unwrap();
        assert_eq!(
            store.append_event("r", event("response.output_text.delta")),
            Err(StoreError::AlreadyClosed("r".into()))
        );
    }

    #[test]
    fn terminal_status_closes_stream() {
        let store = ResponseStore::new(Duration::ZERO);
        store.store("r", request(), response("r"));
        store.append_event("r", event("response.created")).unwrap();
        store
            .update_status("r", ResponseStatus::InProgress, None)
            .unwrap();
        assert!(!store.is_closed("r").unwrap());

        store
            .update_status("r", ResponseStatus::Completed, Some(1))
            .unwrap();
        assert!(store.is_closed("r").unwrap());
        assert_eq!(
            store.append_event("r", event("response.output_text.delta")),
            Err(StoreError::AlreadyClosed("r".into()))
        );
        assert_eq!(store.get_events_after("r", None).unwrap().len(), 1);
    }

    #[test]
    fn items_are_indexed() {
        let store = ResponseStore::new(Duration::ZERO);
        let mut resource = response("r");
        resource.output.push(ResponseItem::output_message("hello", "completed"));
        let item_id = resource.output[0].id().unwrap().to_string();
        store.store("r", request(), resource);

        assert!(store.get_item("r", &item_id).is_ok());
        assert!(store.find_item(&item_id).is_ok());
        assert!(matches!(store.find_item("missing"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn cancel_appends_one_terminal_event() {
        let store = ResponseStore::new(Duration::ZERO);
        let token = CancellationToken::new();
        store.store_background("r", request(), response("r"), token.clone());
        assert_eq!(store.get("r").unwrap().status, ResponseStatus::Queued);

        store.append_event("r", event("response.created")).unwrap();
        let cancelled = store.cancel("r").unwrap();
        assert_eq!(cancelled.status, ResponseStatus::Cancelled);
        assert!(token.is_cancelled());

        let events = store.get_events_after("r", None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, "response.failed");
        assert_eq!(events[1].payload["response"]["status"], "cancelled");
        assert!(store.append_event("r", event("response.completed")).is_err());

        // cancelling again is a no-op
        store.cancel("r").unwrap();
        assert_eq!(store.get_events_after("r", None).unwrap().len(), 2);
    }

    #[test]
    fn cancelled_response_rejects_updates() {
        let store = ResponseStore::new(Duration::ZERO);
        store.store_background("r", request(), response("r"), CancellationToken::new());
        store.cancel("r").unwrap();
        assert!(store.update_status("r", ResponseStatus::InProgress, None).is_err());
        assert!(store.update_response("r", response("r")).is_err());
        assert_eq!(store.get("r").unwrap().status, ResponseStatus::Cancelled);
    }

    #[test]
    fn cancel_on_terminal_response_is_noop() {
        let store = ResponseStore::new(Duration::ZERO);
        store.store("r", request(), response("r"));
        store.update_status("r", ResponseStatus::Completed, Some(1)).unwrap();
        let resource = store.cancel("r").unwrap();
        assert_eq!(resource.status, ResponseStatus::Completed);
        assert!(store.get_events_after("r", None).unwrap().is_empty());
    }

    #[test]
    fn delete_and_count() {
        let store = ResponseStore::new(Duration::ZERO);
        store.store("a", request(), response("a"));
        store.store("b", request(), response("b"));
        assert_eq!(store.count(), 2);
        store.delete("a").unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.delete("a"), Err(StoreError::NotFound("a".into())));
    }

    #[test]
    fn expired_entries_are_unreachable() {
        let store = ResponseStore::new(Duration::ZERO);
        store.store("r", request(), response("r"));
        store.set_ttl(Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(store.get("r").unwrap_err(), StoreError::Expired("r".into()));
        // lazily removed on access
        assert_eq!(store.get("r").unwrap_err(), StoreError::NotFound("r".into()));
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let store = ResponseStore::new(Duration::from_millis(40));
        store.store("r", request(), response("r"));
        tokio::time::sleep(Duration::from_millis(40 + 20 + 30)).await;
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn subscribers_are_signalled() {
        let store = ResponseStore::new(Duration::ZERO);
        store.store("r", request(), response("r"));
        let mut signal = store.subscribe("r").unwrap();
        let writer = store.clone();
        tokio::spawn(async move {
            writer.append_event("r", event("response.created")).unwrap();
        });
        signal.changed().await.unwrap();
        assert_eq!(*signal.borrow(), 1);
    }
}
