//! Per-client access state
//!
//! A record exists exactly while the client is connected. It carries the
//! assigned policy, the cached portal decisions, the set of objects the
//! client has been told about, and at most one in-flight portal dialog.

use crate::host::FilterHandle;
use crate::types::{AccessHook, AccessRequest, AsyncCompleter, Facility};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::task::JoinHandle;

/// Snapshot of a connected client as supplied by the host registry.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    /// Stable client index.
    pub index: u32,
    /// Process id from the client's credentials.
    pub pid: i32,
    /// Whether the credentials were verified by the transport.
    pub credentials_valid: bool,
    /// Client property list.
    pub proplist: HashMap<String, String>,
}

/// One cached portal decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheEntry {
    pub checked: bool,
    pub granted: bool,
}

/// A portal dialog awaiting its `Response` signal.
pub struct PendingPortal {
    /// The request that opened the dialog.
    pub request: AccessRequest,
    /// Object path of the portal request, from the `AccessDevice` reply.
    pub handle: String,
    /// Signal filter watching for the `Response`.
    pub filter: FilterHandle,
    /// Capability to deliver the late verdict.
    pub completer: AsyncCompleter,
}

impl fmt::Debug for PendingPortal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingPortal")
            .field("request", &self.request)
            .field("handle", &self.handle)
            .field("filter", &self.filter)
            .finish()
    }
}

/// State of a client's portal consent flow.
///
/// The slot is claimed with `Issuing` before the `AccessDevice` call goes
/// out; a second portal-gated request arriving while the call is in flight
/// sees the slot taken and is denied.
#[derive(Debug)]
pub enum PortalDialog {
    /// `AccessDevice` call issued, reply not yet received.
    Issuing,
    /// Dialog open, waiting for the `Response` signal.
    Awaiting(PendingPortal),
}

/// Per-client record: policy assignment, portal cache, seen set.
pub struct ClientRecord {
    /// Stable client index.
    pub index: u32,
    /// Index of the assigned policy.
    pub policy: u32,
    /// Process id from the client's credentials.
    pub pid: i32,
    /// Whether the credentials were verified by the transport.
    pub credentials_valid: bool,
    /// Objects whose existence has been revealed to this client.
    seen: HashSet<(Facility, u32)>,
    /// Cached portal decisions, one slot per hook kind.
    pub cache: [CacheEntry; AccessHook::COUNT],
    /// In-flight portal dialog, at most one per client.
    pub pending: Option<PortalDialog>,
    /// Armed grant timer for the pending dialog; dormant when `None`.
    pub grant_timer: Option<JoinHandle<()>>,
}

impl ClientRecord {
    /// Create a record for a newly connected client.
    pub fn new(index: u32, policy: u32, pid: i32, credentials_valid: bool) -> Self {
        Self {
            index,
            policy,
            pid,
            credentials_valid,
            seen: HashSet::new(),
            cache: [CacheEntry::default(); AccessHook::COUNT],
            pending: None,
            grant_timer: None,
        }
    }

    /// Whether the client has been told this object exists.
    pub fn has_seen(&self, facility: Facility, object_index: u32) -> bool {
        self.seen.contains(&(facility, object_index))
    }

    /// Remember that the client learned of this object.
    pub fn record_seen(&mut self, facility: Facility, object_index: u32) -> bool {
        self.seen.insert((facility, object_index))
    }

    /// Forget the object, typically because it was removed.
    pub fn forget_seen(&mut self, facility: Facility, object_index: u32) -> bool {
        self.seen.remove(&(facility, object_index))
    }

    /// Number of objects currently known to the client.
    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    /// Cached portal decision for `hook`, if one was recorded.
    pub fn cached(&self, hook: AccessHook) -> Option<bool> {
        let entry = self.cache[hook.index()];
        entry.checked.then_some(entry.granted)
    }

    /// Record a portal decision for `hook`.
    pub fn cache_decision(&mut self, hook: AccessHook, granted: bool) {
        self.cache[hook.index()] = CacheEntry {
            checked: true,
            granted,
        };
    }

    /// Disarm the grant timer, if armed.
    pub fn disarm_timer(&mut self) {
        if let Some(timer) = self.grant_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for ClientRecord {
    fn drop(&mut self) {
        self.disarm_timer();
    }
}

impl fmt::Debug for ClientRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRecord")
            .field("index", &self.index)
            .field("policy", &self.policy)
            .field("pid", &self.pid)
            .field("seen", &self.seen.len())
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

/// Registry of connected clients keyed by client index.
#[derive(Default)]
pub struct ClientMap {
    clients: DashMap<u32, ClientRecord>,
}

impl ClientMap {
    /// Create an empty client map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record for a newly connected client, replacing any stale one.
    pub fn put(&self, index: u32, policy: u32, pid: i32, credentials_valid: bool) {
        self.clients
            .insert(index, ClientRecord::new(index, policy, pid, credentials_valid));
    }

    /// Remove the record for a disconnected client.
    pub fn remove(&self, index: u32) -> Option<ClientRecord> {
        self.clients.remove(&index).map(|(_, record)| record)
    }

    /// Whether a record exists for the client.
    pub fn contains(&self, index: u32) -> bool {
        self.clients.contains_key(&index)
    }

    /// Run `f` against the client's record, if connected.
    pub fn with<R>(&self, index: u32, f: impl FnOnce(&ClientRecord) -> R) -> Option<R> {
        self.clients.get(&index).map(|record| f(&record))
    }

    /// Run `f` against the client's record mutably, if connected.
    pub fn with_mut<R>(&self, index: u32, f: impl FnOnce(&mut ClientRecord) -> R) -> Option<R> {
        self.clients.get_mut(&index).map(|mut record| f(&mut record))
    }

    /// Indices of all connected clients.
    pub fn indices(&self) -> Vec<u32> {
        self.clients.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of connected clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is connected.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seen_set_round_trip() {
        let mut record = ClientRecord::new(4, 0, 100, true);

        assert!(!record.has_seen(Facility::SinkInput, 77));
        assert!(record.record_seen(Facility::SinkInput, 77));
        assert!(record.has_seen(Facility::SinkInput, 77));

        // admitting the same object twice leaves a single entry
        assert!(!record.record_seen(Facility::SinkInput, 77));
        assert_eq!(record.seen_len(), 1);

        assert!(record.forget_seen(Facility::SinkInput, 77));
        assert!(!record.has_seen(Facility::SinkInput, 77));
        assert!(!record.forget_seen(Facility::SinkInput, 77));

        assert!(record.record_seen(Facility::SinkInput, 77));
        assert_eq!(record.seen_len(), 1);
    }

    #[test]
    fn test_seen_set_distinguishes_facilities() {
        let mut record = ClientRecord::new(4, 0, 100, true);

        record.record_seen(Facility::Sink, 3);
        assert!(!record.has_seen(Facility::Source, 3));
        assert!(record.has_seen(Facility::Sink, 3));
    }

    #[test]
    fn test_decision_cache() {
        let mut record = ClientRecord::new(11, 1, 100, true);

        assert_eq!(record.cached(AccessHook::ConnectPlayback), None);

        record.cache_decision(AccessHook::ConnectPlayback, true);
        assert_eq!(record.cached(AccessHook::ConnectPlayback), Some(true));
        // other hooks stay unchecked
        assert_eq!(record.cached(AccessHook::ConnectRecord), None);

        record.cache_decision(AccessHook::ConnectRecord, false);
        assert_eq!(record.cached(AccessHook::ConnectRecord), Some(false));
    }

    #[test]
    fn test_client_map_lifecycle() {
        let map = ClientMap::new();
        assert!(map.is_empty());

        map.put(7, 0, 1234, true);
        assert!(map.contains(7));
        assert_eq!(map.with(7, |cd| cd.policy), Some(0));

        map.with_mut(7, |cd| cd.policy = 1);
        assert_eq!(map.with(7, |cd| cd.policy), Some(1));

        let record = map.remove(7).unwrap();
        assert_eq!(record.index, 7);
        assert!(!map.contains(7));
        assert_eq!(map.with(7, |cd| cd.policy), None);
    }

    #[test]
    fn test_put_replaces_stale_record() {
        let map = ClientMap::new();
        map.put(7, 0, 1234, true);
        map.with_mut(7, |cd| {
            cd.record_seen(Facility::Sink, 1);
        });

        map.put(7, 1, 99, false);
        assert_eq!(map.with(7, |cd| cd.seen_len()), Some(0));
        assert_eq!(map.with(7, |cd| cd.policy), Some(1));
    }
}
