//! Client Registry
//!
//! Maps client ids to their handlers. The accept loop inserts, each
//! client's own task removes itself on disconnect, and `send`/`broadcast`
//! look handlers up, all concurrently. Readers take a snapshot of the
//! `Arc`ed handlers under the read lock and do their I/O after releasing
//! it, so a slow client never blocks registration or removal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Server-assigned client identifier. Never reused within a server's lifetime.
pub type ClientId = u64;

/// Concurrent id → handler map with a monotonic id allocator.
#[derive(Debug)]
pub struct ClientRegistry<H> {
    clients: RwLock<HashMap<ClientId, Arc<H>>>,
    next_id: AtomicU64,
}

impl<H> Default for ClientRegistry<H> {
    fn default() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<H> ClientRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next client id.
    pub fn allocate_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, id: ClientId, handler: Arc<H>) {
        self.write().insert(id, handler);
    }

    pub fn remove(&self, id: ClientId) -> Option<Arc<H>> {
        self.write().remove(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<H>> {
        self.read().get(&id).cloned()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.read().contains_key(&id)
    }

    /// Returns the registered handlers, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<H>> {
        let clients = self.read();
        let mut ids: Vec<&ClientId> = clients.keys().collect();
        ids.sort_unstable();
        ids.into_iter().map(|id| Arc::clone(&clients[id])).collect()
    }

    /// Returns the registered ids in ascending order.
    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ClientId, Arc<H>>> {
        self.clients.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ClientId, Arc<H>>> {
        self.clients.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_ids_are_monotonic() {
        let registry: ClientRegistry<()> = ClientRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        registry.insert(a, Arc::new(()));
        registry.remove(a);
        let c = registry.allocate_id();

        assert_eq!((a, b, c), (0, 1, 2));
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = ClientRegistry::new();
        let id = registry.allocate_id();
        registry.insert(id, Arc::new("handler"));

        assert!(registry.contains(id));
        assert_eq!(registry.get(id).as_deref(), Some(&"handler"));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_ordered_and_detached() {
        let registry = ClientRegistry::new();
        for _ in 0..5 {
            let id = registry.allocate_id();
            registry.insert(id, Arc::new(id));
        }

        let snapshot = registry.snapshot();
        registry.remove(2);

        let seen: Vec<u64> = snapshot.iter().map(|h| **h).collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(registry.ids(), vec![0, 1, 3, 4]);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let registry = Arc::new(ClientRegistry::<()>::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    (0..100)
                        .map(|_| {
                            let id = registry.allocate_id();
                            registry.insert(id, Arc::new(()));
                            id
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();

        assert_eq!(all.len(), 800);
        assert_eq!(registry.len(), 800);
    }
}
