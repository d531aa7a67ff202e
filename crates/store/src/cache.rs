use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use vigil_core::{CachedObject, ChangeEvent, ObjectKey, Tombstone};

use crate::lister::Lister;

/// Immutable view of the cache between two writes.
pub struct CacheSnapshot<T> {
    pub(crate) items: FxHashMap<ObjectKey, CachedObject<T>>,
}

impl<T> Default for CacheSnapshot<T> {
    fn default() -> Self { Self { items: FxHashMap::default() } }
}

impl<T> CacheSnapshot<T> {
    pub fn get(&self, key: &ObjectKey) -> Option<&CachedObject<T>> { self.items.get(key) }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// All objects, ordered by key.
    pub fn sorted(&self) -> Vec<&CachedObject<T>> {
        let mut v: Vec<_> = self.items.values().collect();
        v.sort_by(|a, b| a.key.cmp(&b.key));
        v
    }
}

/// Object cache for one kind. Written by a single informer; read through [`Lister`]s.
///
/// Every write publishes a fresh snapshot, so readers never observe a half-applied change
/// and never block the writer.
pub struct Indexer<T> {
    snap: Arc<ArcSwap<CacheSnapshot<T>>>,
    kind: String,
}

impl<T> Indexer<T> {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { snap: Arc::new(ArcSwap::from_pointee(CacheSnapshot::default())), kind: kind.into() }
    }

    pub fn lister(&self) -> Lister<T> { Lister::new(Arc::clone(&self.snap)) }

    pub fn current(&self) -> Arc<CacheSnapshot<T>> { self.snap.load_full() }

    pub fn get_by_key(&self, key: &ObjectKey) -> Option<CachedObject<T>> {
        self.snap.load().items.get(key).cloned()
    }

    pub fn len(&self) -> usize { self.snap.load().items.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn commit(&self, items: FxHashMap<ObjectKey, CachedObject<T>>) {
        let len = items.len();
        self.snap.store(Arc::new(CacheSnapshot { items }));
        metrics::gauge!("informer_cache_objects", len as f64, "kind" => self.kind.clone());
    }

    /// Store `obj`, returning `Added` or `Updated`.
    ///
    /// An object whose version matches the cached one leaves the cache untouched; the
    /// returned `Updated` then carries equal versions.
    pub fn upsert(&self, obj: CachedObject<T>) -> ChangeEvent<T> {
        let cur = self.snap.load_full();
        match cur.items.get(&obj.key) {
            Some(old) if old.same_version(&obj) => ChangeEvent::Updated { old: old.clone(), new: obj },
            Some(old) => {
                let old = old.clone();
                let mut items = cur.items.clone();
                items.insert(obj.key.clone(), obj.clone());
                self.commit(items);
                ChangeEvent::Updated { old, new: obj }
            }
            None => {
                let mut items = cur.items.clone();
                items.insert(obj.key.clone(), obj.clone());
                self.commit(items);
                ChangeEvent::Added(obj)
            }
        }
    }

    pub fn delete(&self, obj: CachedObject<T>) -> ChangeEvent<T> {
        let cur = self.snap.load_full();
        if cur.items.contains_key(&obj.key) {
            let mut items = cur.items.clone();
            items.remove(&obj.key);
            self.commit(items);
        }
        ChangeEvent::Deleted(Tombstone::Observed(obj))
    }

    /// Replace the whole content with a fresh list.
    ///
    /// Objects already cached come back as `Updated` (equal versions when unchanged);
    /// cached objects missing from the list come back as `Deleted` with an unknown final state.
    pub fn replace(&self, list: Vec<CachedObject<T>>) -> Vec<ChangeEvent<T>> {
        let cur = self.snap.load_full();
        let mut items: FxHashMap<ObjectKey, CachedObject<T>> = FxHashMap::default();
        items.reserve(list.len());
        let mut events = Vec::with_capacity(list.len());
        for obj in list {
            match cur.items.get(&obj.key) {
                Some(old) => events.push(ChangeEvent::Updated { old: old.clone(), new: obj.clone() }),
                None => events.push(ChangeEvent::Added(obj.clone())),
            }
            items.insert(obj.key.clone(), obj);
        }
        let mut gone: Vec<&CachedObject<T>> = cur.items.values().filter(|o| !items.contains_key(&o.key)).collect();
        gone.sort_by(|a, b| a.key.cmp(&b.key));
        for last in gone {
            events.push(ChangeEvent::Deleted(Tombstone::FinalStateUnknown { key: last.key.clone(), last_known: last.clone() }));
        }
        self.commit(items);
        events
    }

    /// Redeliver every cached object as an unchanged update.
    pub fn resync(&self) -> Vec<ChangeEvent<T>> {
        let cur = self.snap.load_full();
        cur.sorted().into_iter().map(|o| ChangeEvent::Updated { old: o.clone(), new: o.clone() }).collect()
    }
}
