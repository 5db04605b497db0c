//! Call registry
//!
//! Owns every [`CallRecord`] and keeps it in exactly one of three partitions:
//! pending-inbound, pending-outbound and active. Each partition sits behind
//! its own lock, and an operation locks only the partitions it reads or
//! writes. Those that need several take them together, always in the order
//! inbound, outbound, active, so a concurrent reader sees a call either where
//! it was or where it moved to, never in both places and never in neither.
//!
//! Locks are only held for map operations. Callers that need to talk to the
//! engine get a [`CallEntry`] with a pinned handle and issue the command after
//! the registry has released its locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::call::{CallDirection, CallId, CallRecord, Partition};
use crate::engine::ProtocolCall;
use crate::error::{SessionError, SessionResult};

type PartitionMap = HashMap<CallId, CallRecord>;

/// Read-only view of a registered call
#[derive(Clone)]
pub struct CallEntry {
    pub call_id: CallId,
    pub direction: CallDirection,
    pub partition: Partition,
    /// Engine call object, kept alive for as long as the entry is held
    pub call: Arc<dyn ProtocolCall>,
}

impl std::fmt::Debug for CallEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEntry")
            .field("call_id", &self.call_id)
            .field("direction", &self.direction)
            .field("partition", &self.partition)
            .finish()
    }
}

impl CallEntry {
    fn from_record(record: &CallRecord, partition: Partition) -> Self {
        Self {
            call_id: record.call_id().clone(),
            direction: record.direction(),
            partition,
            call: record.call().clone(),
        }
    }
}

/// Partition sizes and lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub pending_inbound: usize,
    pub pending_outbound: usize,
    pub active: usize,
    pub total_inbound: u64,
    pub total_outbound: u64,
    pub total_promoted: u64,
    pub total_removed: u64,
}

impl RegistryStats {
    pub fn total(&self) -> usize {
        self.pending_inbound + self.pending_outbound + self.active
    }
}

#[derive(Debug, Default)]
struct Counters {
    inbound: AtomicU64,
    outbound: AtomicU64,
    promoted: AtomicU64,
    removed: AtomicU64,
}

const ALL_PARTITIONS: [Partition; 3] = [
    Partition::PendingInbound,
    Partition::PendingOutbound,
    Partition::Active,
];

/// Guards for a subset of the partitions, acquired in registry order
struct Locked<'a> {
    inbound: Option<MutexGuard<'a, PartitionMap>>,
    outbound: Option<MutexGuard<'a, PartitionMap>>,
    active: Option<MutexGuard<'a, PartitionMap>>,
}

impl Locked<'_> {
    /// `None` when the partition was not locked
    fn map(&self, partition: Partition) -> Option<&PartitionMap> {
        match partition {
            Partition::PendingInbound => self.inbound.as_deref(),
            Partition::PendingOutbound => self.outbound.as_deref(),
            Partition::Active => self.active.as_deref(),
        }
    }

    fn map_mut(&mut self, partition: Partition) -> Option<&mut PartitionMap> {
        match partition {
            Partition::PendingInbound => self.inbound.as_deref_mut(),
            Partition::PendingOutbound => self.outbound.as_deref_mut(),
            Partition::Active => self.active.as_deref_mut(),
        }
    }

    fn get(&self, partition: Partition, call_id: &CallId) -> Option<&CallRecord> {
        self.map(partition).and_then(|map| map.get(call_id))
    }

    fn take(&mut self, partition: Partition, call_id: &CallId) -> Option<CallRecord> {
        self.map_mut(partition).and_then(|map| map.remove(call_id))
    }

    fn len(&self, partition: Partition) -> usize {
        self.map(partition).map_or(0, PartitionMap::len)
    }

    fn locate(&self, call_id: &CallId) -> Option<Partition> {
        ALL_PARTITIONS
            .into_iter()
            .find(|p| self.get(*p, call_id).is_some())
    }
}

/// Thread-safe store of all calls known to the session manager
#[derive(Debug, Default)]
pub struct CallRegistry {
    pending_inbound: Mutex<PartitionMap>,
    pending_outbound: Mutex<PartitionMap>,
    active: Mutex<PartitionMap>,
    counters: Counters,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the given partitions, always inbound, then outbound, then active
    fn lock(&self, partitions: &[Partition]) -> Locked<'_> {
        let wants = |partition| partitions.contains(&partition);
        let inbound = wants(Partition::PendingInbound).then(|| self.pending_inbound.lock());
        let outbound = wants(Partition::PendingOutbound).then(|| self.pending_outbound.lock());
        let active = wants(Partition::Active).then(|| self.active.lock());
        Locked {
            inbound,
            outbound,
            active,
        }
    }

    fn lock_all(&self) -> Locked<'_> {
        self.lock(&ALL_PARTITIONS)
    }

    /// Add a call received from the network
    pub fn insert_inbound(&self, record: CallRecord) -> SessionResult<()> {
        self.insert(Partition::PendingInbound, record)?;
        self.counters.inbound.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Add a call placed by the local user
    pub fn insert_outbound(&self, record: CallRecord) -> SessionResult<()> {
        self.insert(Partition::PendingOutbound, record)?;
        self.counters.outbound.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn insert(&self, partition: Partition, record: CallRecord) -> SessionResult<()> {
        let mut all = self.lock_all();
        let call_id = record.call_id().clone();
        if let Some(existing) = all.locate(&call_id) {
            tracing::warn!("Call {} already registered in {}", call_id, existing);
            return Err(SessionError::CallAlreadyExists { call_id });
        }
        if let Some(map) = all.map_mut(partition) {
            map.insert(call_id.clone(), record);
        }
        tracing::debug!("Registered call {} in {}", call_id, partition);
        Ok(())
    }

    /// Move a call from either pending partition into active
    ///
    /// Returns the partition the call came from, or `None` when it is in
    /// neither pending partition (already active, or gone).
    pub fn promote_to_active(&self, call_id: &CallId) -> Option<Partition> {
        let mut all = self.lock_all();
        let (from, mut record) = [Partition::PendingInbound, Partition::PendingOutbound]
            .into_iter()
            .find_map(|from| all.take(from, call_id).map(|record| (from, record)))?;
        record.mark_promoted();
        if let Some(active) = all.map_mut(Partition::Active) {
            active.insert(call_id.clone(), record);
        }
        drop(all);

        self.counters.promoted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Promoted call {} from {} to active", call_id, from);
        Some(from)
    }

    /// Remove a call from whichever partition holds it
    pub fn remove(&self, call_id: &CallId) -> Option<CallRecord> {
        let mut all = self.lock_all();
        let partition = all.locate(call_id)?;
        let record = all.take(partition, call_id);
        drop(all);

        if record.is_some() {
            self.counters.removed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Removed call {} from {}", call_id, partition);
        }
        record
    }

    /// Look a call up in active, then pending-inbound, then pending-outbound
    pub fn find(&self, call_id: &CallId) -> Option<CallEntry> {
        self.find_in(
            &[Partition::Active, Partition::PendingInbound, Partition::PendingOutbound],
            call_id,
        )
    }

    /// Look a call up in the given partitions, first match wins
    pub fn find_in(&self, partitions: &[Partition], call_id: &CallId) -> Option<CallEntry> {
        let locked = self.lock(partitions);
        partitions.iter().find_map(|partition| {
            locked
                .get(*partition, call_id)
                .map(|record| CallEntry::from_record(record, *partition))
        })
    }

    pub fn locate(&self, call_id: &CallId) -> Option<Partition> {
        self.lock_all().locate(call_id)
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.locate(call_id).is_some()
    }

    pub fn stats(&self) -> RegistryStats {
        let all = self.lock_all();
        RegistryStats {
            pending_inbound: all.len(Partition::PendingInbound),
            pending_outbound: all.len(Partition::PendingOutbound),
            active: all.len(Partition::Active),
            total_inbound: self.counters.inbound.load(Ordering::Relaxed),
            total_outbound: self.counters.outbound.load(Ordering::Relaxed),
            total_promoted: self.counters.promoted.load(Ordering::Relaxed),
            total_removed: self.counters.removed.load(Ordering::Relaxed),
        }
    }

    /// Ids held by one partition, sorted
    pub fn ids(&self, partition: Partition) -> Vec<CallId> {
        let locked = self.lock(&[partition]);
        let mut ids: Vec<CallId> = locked
            .map(partition)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Entries of every partition, in lookup order
    pub fn entries(&self) -> Vec<CallEntry> {
        let all = self.lock_all();
        let mut entries = Vec::new();
        for partition in [Partition::Active, Partition::PendingInbound, Partition::PendingOutbound] {
            let mut part: Vec<CallEntry> = all
                .map(partition)
                .into_iter()
                .flat_map(|map| map.values())
                .map(|record| CallEntry::from_record(record, partition))
                .collect();
            part.sort_by(|a, b| a.call_id.cmp(&b.call_id));
            entries.extend(part);
        }
        entries
    }

    pub fn is_empty(&self) -> bool {
        self.stats().total() == 0
    }

    /// Release every record, returning them to the caller
    pub fn drain(&self) -> Vec<CallRecord> {
        let mut all = self.lock_all();
        let mut records: Vec<CallRecord> = Vec::new();
        for partition in ALL_PARTITIONS {
            if let Some(map) = all.map_mut(partition) {
                records.extend(map.drain().map(|(_, r)| r));
            }
        }
        drop(all);

        if !records.is_empty() {
            tracing::debug!("Released {} calls from the registry", records.len());
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallInfo, CallState, HangupCode};
    use crate::error::EngineResult;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    struct StubCall(CallId);

    impl ProtocolCall for StubCall {
        fn call_id(&self) -> CallId {
            self.0.clone()
        }

        fn info(&self) -> EngineResult<CallInfo> {
            Ok(CallInfo {
                call_id: self.0.clone(),
                remote_uri: "sip:bob@example.com".to_string(),
                local_uri: "sip:alice@example.com".to_string(),
                state: CallState::Null,
                state_text: "NULL".to_string(),
                media: vec![],
            })
        }

        fn accept(&self) -> EngineResult<()> {
            Ok(())
        }

        fn terminate(&self, _code: HangupCode) -> EngineResult<()> {
            Ok(())
        }

        fn connect_audio_device(&self) -> EngineResult<()> {
            Ok(())
        }
    }

    fn stub(id: &str) -> Arc<dyn ProtocolCall> {
        Arc::new(StubCall(CallId::from(id)))
    }

    #[test]
    fn test_insert_and_find() {
        let registry = CallRegistry::new();
        registry.insert_inbound(CallRecord::inbound(stub("in-1"))).unwrap();
        registry.insert_outbound(CallRecord::outbound(stub("out-1"))).unwrap();

        let entry = registry.find(&CallId::from("in-1")).unwrap();
        assert_eq!(entry.partition, Partition::PendingInbound);
        assert_eq!(entry.direction, CallDirection::Inbound);
        assert_eq!(
            registry.locate(&CallId::from("out-1")),
            Some(Partition::PendingOutbound)
        );
        assert!(registry.find(&CallId::from("missing")).is_none());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let registry = CallRegistry::new();
        registry.insert_inbound(CallRecord::inbound(stub("c1"))).unwrap();
        registry.promote_to_active(&CallId::from("c1"));

        let err = registry
            .insert_outbound(CallRecord::outbound(stub("c1")))
            .unwrap_err();
        assert!(matches!(err, SessionError::CallAlreadyExists { .. }));

        let stats = registry.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.pending_outbound, 0);
        assert_eq!(stats.total_outbound, 0);
    }

    #[test]
    fn test_promote_is_idempotent() {
        let registry = CallRegistry::new();
        let id = CallId::from("c1");
        registry.insert_outbound(CallRecord::outbound(stub("c1"))).unwrap();

        assert_eq!(registry.promote_to_active(&id), Some(Partition::PendingOutbound));
        assert_eq!(registry.promote_to_active(&id), None);
        assert_eq!(registry.ids(Partition::Active), vec![id.clone()]);
        assert!(registry.ids(Partition::PendingOutbound).is_empty());
        assert_eq!(registry.stats().total_promoted, 1);
    }

    #[test]
    fn test_remove_from_any_partition() {
        let registry = CallRegistry::new();
        registry.insert_inbound(CallRecord::inbound(stub("a"))).unwrap();
        registry.insert_outbound(CallRecord::outbound(stub("b"))).unwrap();
        registry.insert_outbound(CallRecord::outbound(stub("c"))).unwrap();
        registry.promote_to_active(&CallId::from("c"));

        for id in ["a", "b", "c"] {
            let record = registry.remove(&CallId::from(id)).unwrap();
            assert_eq!(record.call_id().as_str(), id);
        }
        assert!(registry.remove(&CallId::from("a")).is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.stats().total_removed, 3);
    }

    #[test]
    fn test_find_in_respects_partition_order() {
        let registry = CallRegistry::new();
        registry.insert_outbound(CallRecord::outbound(stub("x"))).unwrap();
        let id = CallId::from("x");

        assert!(registry.find_in(&[Partition::PendingInbound], &id).is_none());
        let entry = registry
            .find_in(&[Partition::PendingInbound, Partition::PendingOutbound], &id)
            .unwrap();
        assert_eq!(entry.partition, Partition::PendingOutbound);
    }

    #[test]
    fn test_promoted_at_is_stamped() {
        let registry = CallRegistry::new();
        let id = CallId::from("p");
        registry.insert_inbound(CallRecord::inbound(stub("p"))).unwrap();
        registry.promote_to_active(&id);
        let record = registry.remove(&id).unwrap();
        assert!(record.promoted_at().is_some());
        assert!(record.promoted_at().unwrap() >= record.created_at());
    }

    #[test]
    fn test_drain_releases_everything() {
        let registry = CallRegistry::new();
        registry.insert_inbound(CallRecord::inbound(stub("a"))).unwrap();
        registry.insert_outbound(CallRecord::outbound(stub("b"))).unwrap();
        registry.promote_to_active(&CallId::from("b"));

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
        assert!(registry.drain().is_empty());
    }

    #[test]
    fn test_single_partition_lookup_ignores_other_partitions() {
        let registry = Arc::new(CallRegistry::new());
        registry.insert_inbound(CallRecord::inbound(stub("in"))).unwrap();
        registry.insert_outbound(CallRecord::outbound(stub("out"))).unwrap();
        let active = registry.active.lock();

        let (tx, rx) = mpsc::channel();
        let reader = {
            let registry = registry.clone();
            thread::spawn(move || {
                let found = registry
                    .find_in(&[Partition::PendingInbound], &CallId::from("in"))
                    .map(|entry| entry.partition);
                let outbound = registry.ids(Partition::PendingOutbound);
                let _ = tx.send((found, outbound));
            })
        };

        let result = rx.recv_timeout(Duration::from_secs(2));
        drop(active);
        reader.join().unwrap();
        let (found, outbound) = result.expect("lookup waited on the active partition");
        assert_eq!(found, Some(Partition::PendingInbound));
        assert_eq!(outbound, vec![CallId::from("out")]);
    }

    #[test]
    fn test_concurrent_promotion_keeps_partitions_disjoint() {
        let registry = Arc::new(CallRegistry::new());
        let ids: Vec<CallId> = (0..200).map(|i| CallId::new(format!("call-{}", i))).collect();
        for (i, id) in ids.iter().enumerate() {
            let call = stub(id.as_str());
            if i % 2 == 0 {
                registry.insert_inbound(CallRecord::inbound(call)).unwrap();
            } else {
                registry.insert_outbound(CallRecord::outbound(call)).unwrap();
            }
        }

        let writer = {
            let registry = registry.clone();
            let ids = ids.clone();
            thread::spawn(move || {
                for id in &ids {
                    registry.promote_to_active(id);
                }
                for id in ids.iter().step_by(3) {
                    registry.remove(id);
                }
            })
        };

        let reader = {
            let registry = registry.clone();
            let ids = ids.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    for id in &ids {
                        if let Some(entry) = registry.find(id) {
                            assert_eq!(&entry.call_id, id);
                        }
                    }
                    let stats = registry.stats();
                    assert!(stats.total() <= ids.len());
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();

        let mut seen = std::collections::HashSet::new();
        for partition in [Partition::PendingInbound, Partition::PendingOutbound, Partition::Active] {
            for id in registry.ids(partition) {
                assert!(seen.insert(id), "call present in two partitions");
            }
        }
        let removed = ids.iter().step_by(3).count();
        assert_eq!(registry.stats().active, ids.len() - removed);
        assert_eq!(registry.stats().pending_inbound + registry.stats().pending_outbound, 0);
    }
}
