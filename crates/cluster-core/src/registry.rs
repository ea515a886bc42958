//! Membership registry for tracking cluster instances.
//!
//! The registry is a tracker's authoritative local view of the cluster:
//! instance id → last known [`Instance`]. It changes only through
//! registration on CONNECT, merging a peer's SYNC_INSTANCES snapshot, or an
//! explicit administrative removal.
//!
//! Merging is additive. Entries absent from a snapshot are never evicted,
//! and conflicting descriptors for one id resolve last-write-wins, so
//! applying snapshots repeatedly or in any order converges on the union of
//! everything seen.

use crate::{Instance, InstanceId, Role};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// What a single upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First time this instance id was seen
    Added,
    /// Host, port, secret or role changed
    Updated,
    /// Identical descriptor already present
    Unchanged,
}

/// Counts from applying a snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl MergeSummary {
    /// Whether the merge modified the registry.
    pub fn changed(&self) -> bool {
        self.added > 0 || self.updated > 0
    }

    fn record(&mut self, registration: Registration) {
        match registration {
            Registration::Added => self.added += 1,
            Registration::Updated => self.updated += 1,
            Registration::Unchanged => self.unchanged += 1,
        }
    }
}

/// Shared, internally synchronized instance map.
///
/// Writers (register, merge, remove) are serialized; snapshot readers run
/// concurrently with each other. No lock is held beyond a single call.
#[derive(Debug, Default)]
pub struct Registry {
    instances: RwLock<HashMap<InstanceId, Instance>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh an instance keyed by its id.
    pub fn register(&self, instance: Instance) -> Registration {
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        upsert(&mut instances, instance)
    }

    /// Apply a peer's snapshot under a single write lock.
    pub fn merge<I>(&self, snapshot: I) -> MergeSummary
    where
        I: IntoIterator<Item = Instance>,
    {
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        let mut summary = MergeSummary::default();
        for instance in snapshot {
            summary.record(upsert(&mut instances, instance));
        }
        summary
    }

    /// All instances, ordered by instance id.
    pub fn snapshot(&self) -> Vec<Instance> {
        let instances = self.instances.read().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot: Vec<Instance> = instances.values().cloned().collect();
        snapshot.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        snapshot
    }

    /// Instances with the given role, ordered by instance id.
    pub fn with_role(&self, role: Role) -> Vec<Instance> {
        self.snapshot()
            .into_iter()
            .filter(|instance| instance.role == role)
            .collect()
    }

    pub fn get(&self, instance_id: &InstanceId) -> Option<Instance> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .cloned()
    }

    /// Administrative removal. Merging never removes entries.
    pub fn remove(&self, instance_id: &InstanceId) -> Option<Instance> {
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_id)
    }

    pub fn contains(&self, instance_id: &InstanceId) -> bool {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(instance_id)
    }

    pub fn len(&self) -> usize {
        self.instances.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn upsert(instances: &mut HashMap<InstanceId, Instance>, instance: Instance) -> Registration {
    match instances.get_mut(&instance.instance_id) {
        Some(existing) if *existing == instance => Registration::Unchanged,
        Some(existing) => {
            *existing = instance;
            Registration::Updated
        }
        None => {
            instances.insert(instance.instance_id.clone(), instance);
            Registration::Added
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Server;
    use std::sync::Arc;

    fn instance(id: &str, host: &str, role: Role) -> Instance {
        Instance::new(id.parse().unwrap(), Server::new(host, 1024, "s"), role)
    }

    fn a() -> Instance {
        instance("aaaaaaaa", "10.0.0.1", Role::Storage)
    }

    fn b() -> Instance {
        instance("bbbbbbbb", "10.0.0.2", Role::Storage)
    }

    fn b_moved() -> Instance {
        instance("bbbbbbbb", "10.0.0.22", Role::Tracker)
    }

    fn c() -> Instance {
        instance("cccccccc", "10.0.0.3", Role::Tracker)
    }

    // ==================== Registration ====================

    #[test]
    fn test_register_new_update_unchanged() {
        let registry = Registry::new();

        assert_eq!(registry.register(b()), Registration::Added);
        assert_eq!(registry.register(b()), Registration::Unchanged);
        assert_eq!(registry.register(b_moved()), Registration::Updated);

        assert_eq!(registry.len(), 1);
        let stored = registry.get(&"bbbbbbbb".parse().unwrap()).unwrap();
        assert_eq!(stored.server.host, "10.0.0.22");
        assert_eq!(stored.role, Role::Tracker);
    }

    #[test]
    fn test_remove_is_explicit() {
        let registry = Registry::new();
        registry.register(a());
        registry.register(b());

        let removed = registry.remove(&a().instance_id).unwrap();
        assert_eq!(removed, a());
        assert!(!registry.contains(&a().instance_id));
        assert!(registry.remove(&a().instance_id).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_sorted_by_id() {
        let registry = Registry::new();
        registry.register(c());
        registry.register(a());
        registry.register(b());

        let ids: Vec<String> = registry
            .snapshot()
            .iter()
            .map(|i| i.instance_id.to_string())
            .collect();
        assert_eq!(ids, vec!["aaaaaaaa", "bbbbbbbb", "cccccccc"]);
    }

    #[test]
    fn test_with_role() {
        let registry = Registry::new();
        registry.merge(vec![a(), b(), c()]);
        assert_eq!(registry.with_role(Role::Tracker), vec![c()]);
        assert_eq!(registry.with_role(Role::Storage), vec![a(), b()]);
    }

    // ==================== Merge ====================

    #[test]
    fn test_merge_is_idempotent() {
        let once = Registry::new();
        once.register(a());
        once.merge(vec![b(), c()]);

        let twice = Registry::new();
        twice.register(a());
        twice.merge(vec![b(), c()]);
        let second = twice.merge(vec![b(), c()]);

        assert_eq!(once.snapshot(), twice.snapshot());
        assert!(!second.changed());
        assert_eq!(second.unchanged, 2);
    }

    #[test]
    fn test_merge_union_never_evicts() {
        let registry = Registry::new();
        registry.register(a());
        registry.register(b());

        let summary = registry.merge(vec![b_moved(), c()]);

        assert_eq!(
            summary,
            MergeSummary {
                added: 1,
                updated: 1,
                unchanged: 0
            }
        );
        assert_eq!(registry.snapshot(), vec![a(), b_moved(), c()]);
    }

    #[test]
    fn test_merge_interleaved_sources_converge() {
        let left = Registry::new();
        left.register(a());
        left.merge(vec![c()]);
        left.merge(vec![b_moved()]);
        left.merge(vec![c(), b_moved()]);

        let right = Registry::new();
        right.merge(vec![b_moved(), c()]);
        right.register(a());
        right.merge(vec![c()]);

        assert_eq!(left.snapshot(), right.snapshot());
        assert_eq!(left.snapshot(), vec![a(), b_moved(), c()]);
    }

    #[test]
    fn test_merge_last_write_wins() {
        let registry = Registry::new();
        registry.merge(vec![b()]);
        registry.merge(vec![b_moved()]);
        assert_eq!(registry.snapshot(), vec![b_moved()]);

        registry.merge(vec![b()]);
        assert_eq!(registry.snapshot(), vec![b()]);
    }

    #[test]
    fn test_merge_empty_snapshot() {
        let registry = Registry::new();
        registry.register(a());
        let summary = registry.merge(Vec::new());
        assert_eq!(summary, MergeSummary::default());
        assert_eq!(registry.len(), 1);
    }

    // ==================== Concurrency ====================

    #[test]
    fn test_concurrent_registrations() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("{:04}{:04}", t, i);
                        registry.register(instance(&id, "10.0.0.1", Role::Storage));
                        let _ = registry.snapshot();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 400);
    }
}
