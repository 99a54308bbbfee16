// Table of operations in flight on one client connection, keyed by
// message id.

use crate::future::{CompletionHandle, OperationError};
use crate::ldap_protocol::{ProtocolOp, SearchResultEntry};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A streamed search event delivered before the terminal done response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchEvent {
    Entry(SearchResultEntry),
    Reference(Vec<String>),
}

type SearchSink = Box<dyn Fn(SearchEvent) + Send + Sync>;

/// One outstanding operation: the completion handle for its terminal
/// response, and for searches a sink receiving streamed entries and
/// references.
pub struct PendingOp {
    completion: CompletionHandle<ProtocolOp>,
    search_sink: Option<SearchSink>,
    created: Instant,
    last_activity: Mutex<Instant>,
}

impl PendingOp {
    pub fn new(completion: CompletionHandle<ProtocolOp>) -> Self {
        let now = Instant::now();
        Self {
            completion,
            search_sink: None,
            created: now,
            last_activity: Mutex::new(now),
        }
    }

    pub fn with_search_sink(
        completion: CompletionHandle<ProtocolOp>,
        sink: impl Fn(SearchEvent) + Send + Sync + 'static,
    ) -> Self {
        let mut op = Self::new(completion);
        op.search_sink = Some(Box::new(sink));
        op
    }

    pub fn completion(&self) -> &CompletionHandle<ProtocolOp> {
        &self.completion
    }

    pub fn deliver_search_event(&self, event: SearchEvent) {
        self.touch();
        if let Some(sink) = &self.search_sink {
            sink(event);
        }
    }

    /// Refresh the activity timestamp, called for intermediate responses
    /// and streamed search events.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }
}

/// Message ids start at 1 (id 0 is reserved for unsolicited notifications)
/// and are strictly increasing for the lifetime of the connection; an id is
/// never reused even after its operation completes.
pub struct PendingTable {
    next_id: AtomicI32,
    ops: DashMap<i32, PendingOp>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI32::new(1),
            ops: DashMap::new(),
        }
    }

    pub fn allocate_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, message_id: i32, op: PendingOp) {
        self.ops.insert(message_id, op);
    }

    /// Atomically remove the operation; the caller completes it. At most one
    /// caller gets the entry, so the terminal response is delivered once.
    pub fn remove(&self, message_id: i32) -> Option<PendingOp> {
        self.ops.remove(&message_id).map(|(_, op)| op)
    }

    /// Run `f` against the operation without removing it (streamed search
    /// events, intermediate responses).
    pub fn with<T>(&self, message_id: i32, f: impl FnOnce(&PendingOp) -> T) -> Option<T> {
        self.ops.get(&message_id).map(|op| f(op.value()))
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Age of the longest-outstanding operation, for monitoring.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.ops.iter().map(|entry| entry.value().age()).max()
    }

    /// Fail every outstanding operation, used when the connection dies.
    pub fn fail_all(&self, error: &OperationError) {
        let ids: Vec<i32> = self.ops.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, op)) = self.ops.remove(&id) {
                op.completion.fail(error.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::future_pair;
    use crate::ldap_protocol::LdapResult;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let table = PendingTable::new();
        let first = table.allocate_id();
        assert_eq!(first, 1);
        let mut previous = first;
        for _ in 0..100 {
            let id = table.allocate_id();
            assert!(id > previous);
            previous = id;
        }
    }

    #[test]
    fn test_remove_is_exactly_once() {
        let table = PendingTable::new();
        let (_future, handle) = future_pair();
        let id = table.allocate_id();
        table.insert(id, PendingOp::new(handle));

        assert!(table.remove(id).is_some());
        assert!(table.remove(id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_search_sink_receives_events_while_pending() {
        let table = PendingTable::new();
        let (_future, handle) = future_pair();
        let received = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_target = std::sync::Arc::clone(&received);
        let id = table.allocate_id();
        table.insert(
            id,
            PendingOp::with_search_sink(handle, move |event| {
                sink_target.lock().unwrap().push(event);
            }),
        );

        table.with(id, |op| {
            op.deliver_search_event(SearchEvent::Entry(SearchResultEntry {
                object_name: "cn=a".to_string(),
                attributes: vec![],
            }));
            op.deliver_search_event(SearchEvent::Reference(vec!["ldap://x".to_string()]));
        });
        assert_eq!(received.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_fail_all_completes_every_op() {
        let table = PendingTable::new();
        let mut futures = Vec::new();
        for _ in 0..3 {
            let (future, handle) = future_pair();
            let id = table.allocate_id();
            table.insert(id, PendingOp::new(handle));
            futures.push(future);
        }

        table.fail_all(&OperationError::ConnectionClosed("reset by peer".to_string()));
        assert!(table.is_empty());
        for future in futures {
            assert!(matches!(
                future.wait(),
                Err(OperationError::ConnectionClosed(_))
            ));
        }
    }

    #[test]
    fn test_activity_timestamp_refreshes_on_events() {
        let table = PendingTable::new();
        let (_future, handle) = future_pair();
        let id = table.allocate_id();
        table.insert(id, PendingOp::new(handle));

        std::thread::sleep(std::time::Duration::from_millis(20));
        let idle_before = table.with(id, |op| op.idle_time()).unwrap();
        table.with(id, |op| op.touch());
        let idle_after = table.with(id, |op| op.idle_time()).unwrap();
        assert!(idle_after < idle_before);
        assert!(table.oldest_age().unwrap() >= idle_after);
    }

    #[test]
    fn test_completed_op_future_sees_response() {
        let table = PendingTable::new();
        let (future, handle) = future_pair();
        let id = table.allocate_id();
        table.insert(id, PendingOp::new(handle));

        let op = table.remove(id).unwrap();
        op.completion()
            .complete(ProtocolOp::BindResponse(LdapResult::success()));
        match future.wait() {
            Ok(ProtocolOp::BindResponse(r)) => assert!(r.is_success()),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
