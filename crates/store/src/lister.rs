use std::sync::Arc;

use arc_swap::ArcSwap;
use vigil_core::{CachedObject, ObjectKey, Selector};

use crate::cache::CacheSnapshot;

/// Read-only view over an [`Indexer`](crate::Indexer).
///
/// Every call reads one snapshot; results never change after they are returned.
pub struct Lister<T> {
    snap: Arc<ArcSwap<CacheSnapshot<T>>>,
}

impl<T> Clone for Lister<T> {
    fn clone(&self) -> Self { Self { snap: Arc::clone(&self.snap) } }
}

impl<T> Lister<T> {
    pub(crate) fn new(snap: Arc<ArcSwap<CacheSnapshot<T>>>) -> Self { Self { snap } }

    /// Objects matching `selector`, ordered by key.
    pub fn list(&self, selector: &Selector) -> Vec<CachedObject<T>> {
        let snap = self.snap.load();
        snap.sorted().into_iter().filter(|o| selector.matches(&o.labels)).cloned().collect()
    }

    /// Like [`Lister::list`], restricted to one namespace.
    pub fn list_namespace(&self, namespace: &str, selector: &Selector) -> Vec<CachedObject<T>> {
        let snap = self.snap.load();
        snap.sorted()
            .into_iter()
            .filter(|o| o.key.namespace.as_deref() == Some(namespace) && selector.matches(&o.labels))
            .cloned()
            .collect()
    }

    /// `namespace` is `None` for cluster-scoped kinds.
    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<CachedObject<T>> {
        let key = ObjectKey { namespace: namespace.map(str::to_string), name: name.to_string() };
        self.get_by_key(&key)
    }

    pub fn get_by_key(&self, key: &ObjectKey) -> Option<CachedObject<T>> {
        self.snap.load().get(key).cloned()
    }

    pub fn len(&self) -> usize { self.snap.load().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
