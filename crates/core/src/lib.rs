//! Vigil core types: object keys, cached objects, change events, sync results.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod backoff;
pub mod selector;

pub use selector::{Selector, SelectorError};

/// Kubernetes labels as key/value pairs.
pub type Labels = SmallVec<[(String, String); 8]>;

/// Identity of one object of a kind: `namespace/name`, or `name` when cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    /// Split a queue key back into namespace and name.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(*name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::namespaced(*ns, *name)),
            _ => Err(KeyError::Malformed(key.to_string())),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

/// Last observed state of one object, as held by the cache.
///
/// The payload is shared; cloning a `CachedObject` never copies the object itself.
#[derive(Debug)]
pub struct CachedObject<T> {
    pub key: ObjectKey,
    /// Opaque version token; equal versions mean the object did not change.
    pub resource_version: String,
    pub labels: Labels,
    pub obj: Arc<T>,
}

impl<T> Clone for CachedObject<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            resource_version: self.resource_version.clone(),
            labels: self.labels.clone(),
            obj: Arc::clone(&self.obj),
        }
    }
}

impl<T> CachedObject<T> {
    pub fn new(key: ObjectKey, resource_version: impl Into<String>, obj: T) -> Self {
        Self { key, resource_version: resource_version.into(), labels: Labels::new(), obj: Arc::new(obj) }
    }

    pub fn with_labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.labels = labels.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn same_version(&self, other: &Self) -> bool {
        self.resource_version == other.resource_version
    }
}

/// Last known state of a deleted object.
#[derive(Debug)]
pub enum Tombstone<T> {
    /// The delete was observed on the watch stream.
    Observed(CachedObject<T>),
    /// The object was missing from a relist; the delete itself was never seen.
    FinalStateUnknown { key: ObjectKey, last_known: CachedObject<T> },
}

impl<T> Clone for Tombstone<T> {
    fn clone(&self) -> Self {
        match self {
            Tombstone::Observed(o) => Tombstone::Observed(o.clone()),
            Tombstone::FinalStateUnknown { key, last_known } => {
                Tombstone::FinalStateUnknown { key: key.clone(), last_known: last_known.clone() }
            }
        }
    }
}

impl<T> Tombstone<T> {
    /// Key of the deleted object, whichever way the deletion was noticed.
    pub fn key(&self) -> &ObjectKey {
        match self {
            Tombstone::Observed(o) => &o.key,
            Tombstone::FinalStateUnknown { key, .. } => key,
        }
    }

    pub fn last_known(&self) -> &CachedObject<T> {
        match self {
            Tombstone::Observed(o) => o,
            Tombstone::FinalStateUnknown { last_known, .. } => last_known,
        }
    }
}

/// A cache change as seen by event handlers.
#[derive(Debug)]
pub enum ChangeEvent<T> {
    Added(CachedObject<T>),
    Updated { old: CachedObject<T>, new: CachedObject<T> },
    Deleted(Tombstone<T>),
}

impl<T> Clone for ChangeEvent<T> {
    fn clone(&self) -> Self {
        match self {
            ChangeEvent::Added(o) => ChangeEvent::Added(o.clone()),
            ChangeEvent::Updated { old, new } => ChangeEvent::Updated { old: old.clone(), new: new.clone() },
            ChangeEvent::Deleted(t) => ChangeEvent::Deleted(t.clone()),
        }
    }
}

impl<T> ChangeEvent<T> {
    pub fn key(&self) -> &ObjectKey {
        match self {
            ChangeEvent::Added(o) => &o.key,
            ChangeEvent::Updated { new, .. } => &new.key,
            ChangeEvent::Deleted(t) => t.key(),
        }
    }

    /// Short label used for metrics and logs.
    pub fn verb(&self) -> &'static str {
        match self {
            ChangeEvent::Added(_) => "added",
            ChangeEvent::Updated { .. } => "updated",
            ChangeEvent::Deleted(_) => "deleted",
        }
    }

    /// True for updates that carry no new version (periodic resync, relist).
    pub fn is_resync(&self) -> bool {
        matches!(self, ChangeEvent::Updated { old, new } if old.same_version(new))
    }
}

/// Element of an inbound list+watch stream.
#[derive(Debug)]
pub enum WatchEvent<T> {
    /// Full, consistent list of every object; emitted on start and on every relist.
    Restarted(Vec<CachedObject<T>>),
    Applied(CachedObject<T>),
    Deleted(CachedObject<T>),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("watch: {0}")]
    Watch(String),
}

pub type WatchStream<T> = BoxStream<'static, Result<WatchEvent<T>, SourceError>>;

/// Supplier of list+watch streams for one object kind.
///
/// Each call to `watch` opens a fresh stream that starts with a `Restarted` snapshot.
/// Errors signal a disconnect; the stream may recover on its own or end.
pub trait ChangeSource<T>: Send + Sync + 'static {
    fn watch(&self) -> WatchStream<T>;
}

/// Successful outcomes of one sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    /// The object is gone from the cache; nothing left to reconcile.
    NotFound,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("invalid resource key: {0}")]
    MalformedKey(#[from] KeyError),
    #[error("{0}")]
    Transient(String),
}

impl SyncError {
    pub fn transient(reason: impl Into<String>) -> Self { SyncError::Transient(reason.into()) }

    /// Malformed keys can never succeed, so they are dropped instead of retried.
    pub fn is_retryable(&self) -> bool { !matches!(self, SyncError::MalformedKey(_)) }
}

pub type SyncResult = Result<SyncOutcome, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_display() {
        let k = ObjectKey::namespaced("ns1", "pod-a");
        assert_eq!(k.to_string(), "ns1/pod-a");
        assert_eq!(ObjectKey::parse("ns1/pod-a").unwrap(), k);
        assert_eq!(ObjectKey::cluster("node-1").to_string(), "node-1");
        assert_eq!(ObjectKey::parse("node-1").unwrap(), ObjectKey::cluster("node-1"));
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(ObjectKey::parse("").is_err());
        assert!(ObjectKey::parse("a/b/c").is_err());
        assert!(ObjectKey::parse("/name").is_err());
        assert!(ObjectKey::parse("ns/").is_err());
        assert!("x/y".parse::<ObjectKey>().is_ok());
    }

    #[test]
    fn cluster_scoped_keys_sort_first() {
        let mut keys = vec![ObjectKey::namespaced("a", "x"), ObjectKey::cluster("z")];
        keys.sort();
        assert_eq!(keys[0], ObjectKey::cluster("z"));
    }

    #[test]
    fn resync_updates_are_detected() {
        let a = CachedObject::new(ObjectKey::cluster("n"), "7", ());
        let b = CachedObject::new(ObjectKey::cluster("n"), "8", ());
        assert!(ChangeEvent::Updated { old: a.clone(), new: a.clone() }.is_resync());
        assert!(!ChangeEvent::Updated { old: a.clone(), new: b }.is_resync());
        assert!(!ChangeEvent::Added(a).is_resync());
    }

    #[test]
    fn tombstone_key_survives_unknown_final_state() {
        let last = CachedObject::new(ObjectKey::namespaced("ns", "gone"), "3", 5u8);
        let t = Tombstone::FinalStateUnknown { key: last.key.clone(), last_known: last };
        let ev = ChangeEvent::Deleted(t);
        assert_eq!(ev.key().to_string(), "ns/gone");
        assert_eq!(ev.verb(), "deleted");
    }

    #[test]
    fn labels_are_looked_up_by_key() {
        let o = CachedObject::new(ObjectKey::cluster("n"), "1", ()).with_labels([("app", "web")]);
        assert_eq!(o.label("app"), Some("web"));
        assert_eq!(o.label("tier"), None);
    }

    #[test]
    fn malformed_key_errors_are_not_retryable() {
        let e: SyncError = ObjectKey::parse("a/b/c").unwrap_err().into();
        assert!(!e.is_retryable());
        assert!(SyncError::transient("boom").is_retryable());
    }

    #[test]
    fn key_serializes_with_optional_namespace() {
        let v = serde_json::to_value(ObjectKey::cluster("n")).unwrap();
        assert_eq!(v, serde_json::json!({ "namespace": null, "name": "n" }));
    }
}
