//! Request tracker (`spec.md` §4.2).
//!
//! Correlates outbound `http_request` envelopes with the `http_response`/
//! `http_error` envelope that eventually answers them. Shared across all
//! tunnels — ids are UUIDs and therefore globally unique, so one
//! `DashMap` suffices instead of a per-tunnel table.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use tunnel_protocol::ErrorKind;

/// The resolved outcome of a tracked request.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: tunnel_protocol::message::Headers,
    pub body: Vec<u8>,
}

#[derive(Clone)]
pub enum TrackerOutcome {
    Response(HttpResponse),
    Error { kind: ErrorKind, message: String },
    Timeout,
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterError {
    Duplicate,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResolveError {
    NotFound,
}

/// Request correlator shared by every tunnel on the server.
pub struct RequestTracker {
    pending: DashMap<Uuid, oneshot::Sender<TrackerOutcome>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Registers a new pending request, returning a receiver that resolves
    /// exactly once: via [`complete`](Self::complete), [`fail`](Self::fail),
    /// the `timeout` elapsing, or the tracker being dropped (cancellation).
    pub fn register(
        &self,
        id: Uuid,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<TrackerOutcome>, RegisterError> {
        if self.pending.contains_key(&id) {
            return Err(RegisterError::Duplicate);
        }
        let _ = timeout; // timeout budget is enforced by the caller in `wait`
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        Ok(rx)
    }

    pub fn complete(&self, id: Uuid, response: HttpResponse) -> Result<(), ResolveError> {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(TrackerOutcome::Response(response));
                Ok(())
            }
            None => Err(ResolveError::NotFound),
        }
    }

    pub fn fail(&self, id: Uuid, kind: ErrorKind, message: String) -> Result<(), ResolveError> {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(TrackerOutcome::Error { kind, message });
                Ok(())
            }
            None => Err(ResolveError::NotFound),
        }
    }

    /// Drops a pending entry without resolving the waiter (used when the
    /// waiter itself gives up, e.g. the public connection disconnected).
    pub fn cancel(&self, id: Uuid) {
        self.pending.remove(&id);
    }

    /// Waits for `id` to resolve, or surfaces `Timeout` after `timeout`
    /// and removes the entry regardless of the caller's own cancellation.
    pub async fn wait(&self, id: Uuid, rx: oneshot::Receiver<TrackerOutcome>, timeout: Duration) -> TrackerOutcome {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => TrackerOutcome::Cancelled,
            Err(_) => {
                self.pending.remove(&id);
                TrackerOutcome::Timeout
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TrackerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerOutcome::Response(r) => write!(f, "Response({})", r.status),
            TrackerOutcome::Error { kind, message } => write!(f, "Error({kind:?}, {message})"),
            TrackerOutcome::Timeout => write!(f, "Timeout"),
            TrackerOutcome::Cancelled => write!(f, "Cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn complete_resolves_the_single_waiter() {
        let tracker = RequestTracker::new();
        let id = Uuid::new_v4();
        let rx = tracker.register(id, Duration::from_secs(5)).unwrap();

        tracker
            .complete(
                id,
                HttpResponse {
                    status: 200,
                    headers: Default::default(),
                    body: b"ok".to_vec(),
                },
            )
            .unwrap();

        let outcome = tracker.wait(id, rx, Duration::from_secs(5)).await;
        match outcome {
            TrackerOutcome::Response(r) => assert_eq!(r.status, 200),
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_complete_is_not_found() {
        let tracker = RequestTracker::new();
        let id = Uuid::new_v4();
        let _rx = tracker.register(id, Duration::from_secs(5)).unwrap();
        tracker
            .complete(
                id,
                HttpResponse {
                    status: 200,
                    headers: Default::default(),
                    body: vec![],
                },
            )
            .unwrap();
        assert_eq!(
            tracker
                .complete(
                    id,
                    HttpResponse {
                        status: 500,
                        headers: Default::default(),
                        body: vec![],
                    }
                )
                .unwrap_err(),
            ResolveError::NotFound
        );
    }

    #[tokio::test]
    async fn duplicate_register_is_rejected() {
        let tracker = RequestTracker::new();
        let id = Uuid::new_v4();
        let _rx = tracker.register(id, Duration::from_secs(5)).unwrap();
        assert_eq!(
            tracker.register(id, Duration::from_secs(5)).unwrap_err(),
            RegisterError::Duplicate
        );
    }

    #[tokio::test]
    async fn unresolved_entry_times_out_and_is_removed() {
        let tracker = RequestTracker::new();
        let id = Uuid::new_v4();
        let rx = tracker.register(id, Duration::from_millis(20)).unwrap();
        let outcome = tracker.wait(id, rx, Duration::from_millis(20)).await;
        assert!(matches!(outcome, TrackerOutcome::Timeout));
        assert!(tracker.is_empty());
    }
}
