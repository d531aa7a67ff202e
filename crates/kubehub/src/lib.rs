//! Vigil kubehub: cluster connection and list+watch wiring for the informers.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::path::Path;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    runtime::watcher::{self, Event},
    Client, Config, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use vigil_core::{CachedObject, ChangeSource, ObjectKey, SourceError, WatchEvent, WatchStream};

/// Build a client from an explicit kubeconfig, or from the environment
/// (in-cluster service account, `KUBECONFIG`, `~/.kube/config`).
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    let client = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let cfg = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?;
            Client::try_from(cfg).context("building kube client")?
        }
        None => Client::try_default().await.context("building default kube client")?,
    };
    info!(kubeconfig = ?kubeconfig, "kube client ready");
    Ok(client)
}

/// Namespaced API limited to `namespace`, or spanning all namespaces.
pub fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn strip_managed_fields<K: Resource>(obj: &mut K) {
    obj.meta_mut().managed_fields = None;
}

/// Shape a kube object for the cache: key, version, labels.
pub fn to_cached<K: Resource>(mut obj: K) -> CachedObject<K> {
    strip_managed_fields(&mut obj);
    let name = obj.name_any();
    let key = match obj.meta().namespace.as_deref().filter(|ns| !ns.is_empty()) {
        Some(ns) => ObjectKey::namespaced(ns, name),
        None => ObjectKey::cluster(name),
    };
    let rv = obj.resource_version().unwrap_or_default();
    let labels: Vec<(String, String)> = obj.labels().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    CachedObject::new(key, rv, obj).with_labels(labels)
}

fn source_error(e: watcher::Error) -> SourceError {
    match e {
        watcher::Error::InitialListFailed(e) => SourceError::Connect(e.to_string()),
        other => SourceError::Watch(other.to_string()),
    }
}

/// List+watch over a kube API, surfaced as a [`ChangeSource`].
///
/// The underlying watcher relists (yielding `Restarted`) whenever its resource version
/// expires; errors are passed through and the stream keeps going.
pub struct KubeSource<K> {
    api: Api<K>,
    config: watcher::Config,
}

impl<K> KubeSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(api: Api<K>) -> Self { Self::with_config(api, watcher::Config::default()) }

    pub fn with_config(api: Api<K>, config: watcher::Config) -> Self { Self { api, config } }

    /// Restrict the watch to objects matching a label selector.
    pub fn labels(mut self, selector: &str) -> Self {
        self.config = self.config.labels(selector);
        self
    }
}

impl<K> ChangeSource<K> for KubeSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn watch(&self) -> WatchStream<K> {
        debug!(kind = %std::any::type_name::<K>(), "opening watch");
        watcher::watcher(self.api.clone(), self.config.clone())
            .map(|res| match res {
                Ok(Event::Applied(o)) => Ok(WatchEvent::Applied(to_cached(o))),
                Ok(Event::Deleted(o)) => Ok(WatchEvent::Deleted(to_cached(o))),
                Ok(Event::Restarted(list)) => {
                    metrics::counter!("kubehub_relists_total", 1u64);
                    Ok(WatchEvent::Restarted(list.into_iter().map(to_cached).collect()))
                }
                Err(e) => Err(source_error(e)),
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Node, Pod};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ManagedFieldsEntry, ObjectMeta};
    use std::collections::BTreeMap;

    #[test]
    fn namespaced_object_is_keyed_by_namespace_and_name() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("pod-a".into()),
                namespace: Some("ns1".into()),
                resource_version: Some("42".into()),
                labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                managed_fields: Some(vec![ManagedFieldsEntry::default()]),
                ..Default::default()
            },
            ..Default::default()
        };
        let c = to_cached(pod);
        assert_eq!(c.key.to_string(), "ns1/pod-a");
        assert_eq!(c.resource_version, "42");
        assert_eq!(c.label("app"), Some("web"));
        assert!(c.obj.metadata.managed_fields.is_none());
    }

    #[test]
    fn cluster_scoped_object_uses_name_only() {
        let node = Node {
            metadata: ObjectMeta { name: Some("node-1".into()), ..Default::default() },
            ..Default::default()
        };
        let c = to_cached(node);
        assert_eq!(c.key, ObjectKey::cluster("node-1"));
        assert_eq!(c.resource_version, "");
    }
}
