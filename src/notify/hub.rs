use std::sync::{atomic::{AtomicU64, Ordering}, Arc};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};

const SINK_CAPACITY: usize = 64;

struct Sink {
    conn: u64,
    tx: mpsc::Sender<Value>,
}

/// Live output sinks of open event streams, keyed by session id.
///
/// Only the transport handle lives here. Which profile a session belongs to is
/// persisted in `mcp_sessions`, so the hub is safe to lose on restart.
#[derive(Clone, Default)]
pub struct Hub {
    sinks: Arc<DashMap<String, Sink>>,
    next_conn: Arc<AtomicU64>,
}

/// Keeps a sink registered for as long as the stream holding it is alive.
pub struct SinkGuard {
    hub: Hub,
    session_id: String,
    conn: u64,
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        // a reconnect may already have replaced this sink
        let conn = self.conn;
        if self.hub.sinks.remove_if(&self.session_id, |_, sink| sink.conn == conn).is_some() {
            tracing::debug!(session = %self.session_id, conn, "stream detached");
        }
    }
}

impl Hub {
    /// Registers a new sink for `session_id`, replacing any previous one.
    pub fn attach(&self, session_id: &str) -> (SinkGuard, mpsc::Receiver<Value>) {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        self.sinks.insert(session_id.to_owned(), Sink { conn, tx });
        tracing::debug!(session = session_id, conn, "stream attached");

        let guard = SinkGuard {
            hub: self.clone(),
            session_id: session_id.to_owned(),
            conn,
        };
        (guard, rx)
    }

    pub fn detach(&self, session_id: &str) -> bool {
        self.sinks.remove(session_id).is_some()
    }

    pub fn is_attached(&self, session_id: &str) -> bool {
        self.sinks.get(session_id).is_some_and(|sink| !sink.tx.is_closed())
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Best-effort delivery of one frame. Returns whether the frame was queued.
    pub fn push(&self, session_id: &str, frame: Value) -> bool {
        let result = match self.sinks.get(session_id) {
            Some(sink) => sink.tx.try_send(frame),
            None => return false,
        };

        match result {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session = session_id, "stream backlog full, frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.sinks.remove_if(session_id, |_, sink| sink.tx.is_closed());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn frames_reach_the_attached_stream() {
        let hub = Hub::default();
        assert!(!hub.push("s1", json!(1)));

        let (_guard, mut rx) = hub.attach("s1");
        assert!(hub.is_attached("s1"));
        assert!(hub.push("s1", json!({"n": 1})));
        assert_eq!(rx.recv().await.unwrap(), json!({"n": 1}));
    }

    #[test]
    fn dropping_the_guard_detaches() {
        let hub = Hub::default();
        let (guard, _rx) = hub.attach("s1");
        assert_eq!(hub.len(), 1);
        drop(guard);
        assert!(hub.is_empty());
        assert!(!hub.is_attached("s1"));
    }

    #[test]
    fn stale_guard_leaves_reconnected_stream_alone() {
        let hub = Hub::default();
        let (old, _old_rx) = hub.attach("s1");
        let (_new, _new_rx) = hub.attach("s1");
        drop(old);
        assert!(hub.is_attached("s1"));
    }

    #[test]
    fn closed_receivers_are_pruned_on_push() {
        let hub = Hub::default();
        let (_guard, rx) = hub.attach("s1");
        drop(rx);
        assert!(!hub.push("s1", json!(1)));
        assert!(hub.is_empty());
    }
}
