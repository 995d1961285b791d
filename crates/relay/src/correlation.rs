//! Request id → pending reply slot.
//!
//! The relay's extension receive loop is the only writer that resolves a slot;
//! the command that registered the id is the only reader. Every exit path of a
//! command (reply, timeout, disconnect) removes its id.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Mutex};

struct PendingRequest {
    created_at: Instant,
    /// Extension link the command was forwarded on.
    link_id: u64,
    slot: oneshot::Sender<Value>,
}

#[derive(Clone, Default)]
pub struct CorrelationTable {
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `id`. Returns `None` while another request holds it.
    pub async fn register(&self, id: &str, link_id: u64) -> Option<oneshot::Receiver<Value>> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(
            id.to_string(),
            PendingRequest {
                created_at: Instant::now(),
                link_id,
                slot: tx,
            },
        );
        Some(rx)
    }

    /// Deliver `reply` to the request waiting on `id`. Unknown ids are a no-op.
    pub async fn resolve(&self, id: &str, reply: Value) -> bool {
        let entry = self.pending.lock().await.remove(id);
        match entry {
            Some(request) => {
                tracing::trace!(
                    request_id = %id,
                    waited_ms = request.created_at.elapsed().as_millis() as u64,
                    "Resolving pending request"
                );
                // The waiter may have timed out between our remove and this send.
                request.slot.send(reply).is_ok()
            }
            None => false,
        }
    }

    /// Drop the slot for `id` without resolving it.
    pub async fn release(&self, id: &str) -> bool {
        self.pending.lock().await.remove(id).is_some()
    }

    /// Resolve every request forwarded on `link_id` with an error frame.
    pub async fn fail_link(&self, link_id: u64, error: &str) -> usize {
        let stranded: Vec<(String, PendingRequest)> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, r)| r.link_id == link_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|r| (id, r)))
                .collect()
        };
        let count = stranded.len();
        for (id, request) in stranded {
            let _ = request.slot.send(json!({ "error": error, "requestId": id }));
        }
        count
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.pending.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_delivers_once_and_removes() {
        let table = CorrelationTable::new();
        let rx = table.register("r1", 1).await.unwrap();
        assert!(table.contains("r1").await);

        assert!(table.resolve("r1", json!({"requestId": "r1", "success": true})).await);
        assert_eq!(rx.await.unwrap()["success"], true);
        assert!(table.is_empty().await);

        // A second reply for the same id has nowhere to go.
        assert!(!table.resolve("r1", json!({"requestId": "r1"})).await);
    }

    #[tokio::test]
    async fn test_id_in_use_is_refused() {
        let table = CorrelationTable::new();
        let _rx = table.register("r1", 1).await.unwrap();
        assert!(table.register("r1", 1).await.is_none());
        assert!(table.release("r1").await);
        assert!(table.register("r1", 1).await.is_some());
    }

    #[tokio::test]
    async fn test_unmatched_resolve_has_no_effect() {
        let table = CorrelationTable::new();
        let _rx = table.register("r1", 1).await.unwrap();
        assert!(!table.resolve("ghost", json!({"requestId": "ghost"})).await);
        assert_eq!(table.len().await, 1);
        assert!(table.contains("r1").await);
    }

    #[tokio::test]
    async fn test_fail_link_only_touches_that_link() {
        let table = CorrelationTable::new();
        let a = table.register("a", 1).await.unwrap();
        let b = table.register("b", 2).await.unwrap();

        assert_eq!(table.fail_link(1, "Extension disconnected").await, 1);
        let reply = a.await.unwrap();
        assert_eq!(reply["error"], "Extension disconnected");
        assert_eq!(reply["requestId"], "a");

        assert!(table.contains("b").await);
        drop(b);
        assert!(table.release("b").await);
    }
}
