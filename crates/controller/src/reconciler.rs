use vigil_core::{CachedObject, SyncError};

/// Kind-specific reconciliation, run by workers for objects still present in the cache.
#[async_trait::async_trait]
pub trait Reconciler<T>: Send + Sync + 'static
where
    T: Send + Sync + 'static,
{
    /// Kind name used for queue names, spans and metrics labels.
    fn kind(&self) -> &'static str;

    /// One-line description for change and listing logs.
    fn summarize(&self, obj: &CachedObject<T>) -> String { obj.key.to_string() }

    /// Errors are retried with back-off.
    async fn reconcile(&self, obj: &CachedObject<T>) -> Result<(), SyncError>;
}
