//! Replay-then-follow view over a response's event log.

use std::sync::Arc;

use futures::Stream;

use crate::{
    core::{StoreResult, StoredEvent},
    memory::ResponseStore,
};

/// Stream every event after `after`, then wait for new ones until the
/// response's stream closes or the entry disappears.
///
/// Events arrive strictly in sequence order with no gaps or duplicates.
pub fn follow_events(
    store: Arc<ResponseStore>,
    id: String,
    after: Option<u64>,
) -> StoreResult<impl Stream<Item = StoredEvent> + Send + 'static> {
    let signal = store.subscribe(&id)?;
    let state = (store, id, after, signal, Vec::<StoredEvent>::new().into_iter());

    Ok(futures::stream::unfold(
        state,
        |(store, id, mut after, mut signal, mut pending)| async move {
            loop {
                if let Some(event) = pending.next() {
                    after = Some(event.sequence_number);
                    return Some((event, (store, id, after, signal, pending)));
                }
                // mark the current value seen before reading, so an append
                // racing with the read still wakes us
                signal.borrow_and_update();
                let batch = store.get_events_after(&id, after).ok()?;
                if !batch.is_empty() {
                    pending = batch.into_iter();
                    continue;
                }
                if store.is_closed(&id).unwrap_or(true) {
                    return None;
                }
                signal.changed().await.ok()?;
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use openai_protocol::responses::{ResponseObject, ResponseStatus, ResponsesRequest};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn replays_then_follows_without_duplicates() {
        let store = ResponseStore::new(Duration::ZERO);
        let request: ResponsesRequest =
            serde_json::from_value(json!({"model": "m", "input": "hi"})).unwrap();
        let resource = ResponseObject::from_request("r".into(), &request, ResponseStatus::InProgress);
        store.store("r", request, resource);
        for kind in ["response.created", "response.in_progress", "a", "b"] {
            store.append_event("r", json!({"type": kind})).unwrap();
        }

        let stream = follow_events(store.clone(), "r".into(), Some(1)).unwrap();
        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.append_event("r", json!({"type": "c"})).unwrap();
            writer.append_event("r", json!({"type": "response.completed"})).unwrap();
        });

        let seqs: Vec<u64> = stream.map(|e| e.sequence_number).collect().await;
        assert_eq!(seqs, vec![2, 3, 4, 5]);
    }
}
