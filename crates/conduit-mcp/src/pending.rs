//! Correlation table: request id → waiting caller.

use crate::error::McpError;
use crate::jsonrpc::{RequestId, Response};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

type Slot = oneshot::Sender<Result<Response, McpError>>;

/// Pending requests of one connection.
///
/// Each entry is removed exactly once: by a matching response, by
/// [`PendingRequests::fail_all`], or by the caller's [`PendingGuard`] being
/// dropped (timeout or cancellation). Once failed, the table is closed and
/// rejects new registrations.
#[derive(Default)]
pub(crate) struct PendingRequests {
    inner: Mutex<Table>,
}

#[derive(Default)]
struct Table {
    slots: HashMap<RequestId, Slot>,
    closed: bool,
}

impl PendingRequests {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a slot for `id`. Must happen before the request is sent.
    pub(crate) fn register(self: &Arc<Self>, id: RequestId) -> Result<PendingGuard, McpError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.table();
            if table.closed {
                return Err(McpError::ConnectionClosed);
            }
            if table.slots.contains_key(&id) {
                return Err(McpError::Protocol(format!("duplicate request id {id}")));
            }
            table.slots.insert(id.clone(), tx);
        }
        Ok(PendingGuard {
            id,
            rx,
            table: Arc::clone(self),
        })
    }

    /// Deliver a response. Returns `false` when nobody is waiting for its id.
    pub(crate) fn resolve(&self, response: Response) -> bool {
        let slot = self.table().slots.remove(&response.id);
        match slot {
            // The receiver may have been dropped in the same instant; that is
            // still a completed resolution from the table's point of view.
            Some(tx) => {
                let _ = tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&self, id: &RequestId) {
        self.table().slots.remove(id);
    }

    /// Fail every waiting caller and close the table. Returns how many were
    /// waiting.
    pub(crate) fn fail_all(&self, error: impl Fn() -> McpError) -> usize {
        let slots: Vec<Slot> = {
            let mut table = self.table();
            table.closed = true;
            table.slots.drain().map(|(_, tx)| tx).collect()
        };
        let count = slots.len();
        for tx in slots {
            let _ = tx.send(Err(error()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.table().slots.len()
    }
}

/// A caller's handle on its pending entry. Resolves to the response; removes
/// the entry when dropped early.
pub(crate) struct PendingGuard {
    id: RequestId,
    rx: oneshot::Receiver<Result<Response, McpError>>,
    table: Arc<PendingRequests>,
}

impl Future for PendingGuard {
    type Output = Result<Response, McpError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(outcome) => outcome,
            Err(_) => Err(McpError::ConnectionClosed),
        })
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_delivers_to_matching_id() {
        let table = PendingRequests::new();
        let one = table.register(RequestId::from(1)).unwrap();
        let two = table.register(RequestId::from(2)).unwrap();
        assert_eq!(table.len(), 2);

        // Out of order.
        assert!(table.resolve(Response::success(2, json!("b"))));
        assert!(table.resolve(Response::success(1, json!("a"))));

        assert_eq!(one.await.unwrap().into_result().unwrap(), json!("a"));
        assert_eq!(two.await.unwrap().into_result().unwrap(), json!("b"));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn second_resolution_is_a_noop() {
        let table = PendingRequests::new();
        let guard = table.register(RequestId::from(1)).unwrap();
        assert!(table.resolve(Response::success(1, json!(1))));
        assert!(!table.resolve(Response::success(1, json!(2))));
        assert_eq!(table.fail_all(|| McpError::ConnectionClosed), 0);
        assert_eq!(guard.await.unwrap().into_result().unwrap(), json!(1));
    }

    #[test]
    fn dropping_guard_removes_entry() {
        let table = PendingRequests::new();
        let guard = table.register(RequestId::from("x")).unwrap();
        assert_eq!(&guard.id, &RequestId::from("x"));
        drop(guard);
        assert_eq!(table.len(), 0);
        assert!(!table.resolve(Response::success("x", json!(null))));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let table = PendingRequests::new();
        let _guard = table.register(RequestId::from(1)).unwrap();
        assert!(matches!(
            table.register(RequestId::from(1)),
            Err(McpError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn fail_all_resolves_everyone_and_closes() {
        let table = PendingRequests::new();
        let guards: Vec<_> = (1..=3)
            .map(|i| table.register(RequestId::from(i)).unwrap())
            .collect();
        let failed = table.fail_all(|| McpError::Cancelled {
            method: "test".into(),
        });
        assert_eq!(failed, 3);
        for guard in guards {
            assert!(matches!(guard.await, Err(McpError::Cancelled { .. })));
        }
        assert!(matches!(
            table.register(RequestId::from(4)),
            Err(McpError::ConnectionClosed)
        ));
    }
}
