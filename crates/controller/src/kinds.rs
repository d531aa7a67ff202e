//! Node, Pod and Deployment reconcilers, plus constructors wiring them to a cluster.
//!
//! The reconcilers only observe: they log what they see and never write back.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{Api, Client};
use tracing::info;
use vigil_core::{CachedObject, SyncError};
use vigil_kubehub::{scoped_api, KubeSource};

use crate::controller::ResourceController;
use crate::reconciler::Reconciler;
use crate::ManagerConfig;

/// Status of the node's `Ready` condition (`True`, `False`, `Unknown`), if reported.
pub fn node_ready(node: &Node) -> Option<&str> {
    node.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "Ready")
        .map(|c| c.status.as_str())
}

pub fn pod_phase(pod: &Pod) -> &str {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("Unknown")
}

pub fn available_replicas(deploy: &Deployment) -> i32 {
    deploy.status.as_ref().and_then(|s| s.available_replicas).unwrap_or(0)
}

fn format_labels(obj: &CachedObject<impl Sized>) -> String {
    obj.labels.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NodeReconciler;

#[async_trait::async_trait]
impl Reconciler<Node> for NodeReconciler {
    fn kind(&self) -> &'static str { "node" }

    fn summarize(&self, obj: &CachedObject<Node>) -> String {
        format!("{} ready={}", obj.key, node_ready(&obj.obj).unwrap_or("Unknown"))
    }

    async fn reconcile(&self, obj: &CachedObject<Node>) -> Result<(), SyncError> {
        info!(
            name = %obj.key.name,
            version = %obj.resource_version,
            ready = node_ready(&obj.obj).unwrap_or("Unknown"),
            labels = %format_labels(obj),
            "processing node"
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PodReconciler;

#[async_trait::async_trait]
impl Reconciler<Pod> for PodReconciler {
    fn kind(&self) -> &'static str { "pod" }

    fn summarize(&self, obj: &CachedObject<Pod>) -> String {
        format!("{} phase={}", obj.key, pod_phase(&obj.obj))
    }

    async fn reconcile(&self, obj: &CachedObject<Pod>) -> Result<(), SyncError> {
        info!(key = %obj.key, version = %obj.resource_version, phase = pod_phase(&obj.obj), "processing pod");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeploymentReconciler;

#[async_trait::async_trait]
impl Reconciler<Deployment> for DeploymentReconciler {
    fn kind(&self) -> &'static str { "deployment" }

    fn summarize(&self, obj: &CachedObject<Deployment>) -> String {
        format!("{} available={}", obj.key, available_replicas(&obj.obj))
    }

    async fn reconcile(&self, obj: &CachedObject<Deployment>) -> Result<(), SyncError> {
        info!(
            key = %obj.key,
            version = %obj.resource_version,
            available = available_replicas(&obj.obj),
            "processing deployment"
        );
        Ok(())
    }
}

pub fn node_controller(client: Client, config: &ManagerConfig) -> ResourceController<Node, NodeReconciler> {
    let source = KubeSource::new(Api::<Node>::all(client));
    ResourceController::new(Arc::new(source), NodeReconciler, config)
}

pub fn pod_controller(client: Client, config: &ManagerConfig) -> ResourceController<Pod, PodReconciler> {
    let source = KubeSource::new(scoped_api::<Pod>(client, config.namespace.as_deref()));
    ResourceController::new(Arc::new(source), PodReconciler, config)
}

pub fn deployment_controller(
    client: Client,
    config: &ManagerConfig,
) -> ResourceController<Deployment, DeploymentReconciler> {
    let source = KubeSource::new(scoped_api::<Deployment>(client, config.namespace.as_deref()));
    ResourceController::new(Arc::new(source), DeploymentReconciler, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus, PodStatus};
    use vigil_core::ObjectKey;

    #[test]
    fn node_summary_reports_ready_condition() {
        let node = Node {
            status: Some(NodeStatus {
                conditions: Some(vec![
                    NodeCondition { type_: "MemoryPressure".into(), status: "False".into(), ..Default::default() },
                    NodeCondition { type_: "Ready".into(), status: "True".into(), ..Default::default() },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let obj = CachedObject::new(ObjectKey::cluster("node-1"), "7", node);
        assert_eq!(NodeReconciler.summarize(&obj), "node-1 ready=True");
        assert_eq!(node_ready(&Node::default()), None);
    }

    #[test]
    fn pod_phase_defaults_to_unknown() {
        assert_eq!(pod_phase(&Pod::default()), "Unknown");
        let pod = Pod { status: Some(PodStatus { phase: Some("Running".into()), ..Default::default() }), ..Default::default() };
        let obj = CachedObject::new(ObjectKey::namespaced("ns1", "pod-a"), "3", pod);
        assert_eq!(PodReconciler.summarize(&obj), "ns1/pod-a phase=Running");
    }

    #[test]
    fn deployment_summary_counts_available_replicas() {
        let deploy = Deployment {
            status: Some(DeploymentStatus { available_replicas: Some(2), ..Default::default() }),
            ..Default::default()
        };
        let obj = CachedObject::new(ObjectKey::namespaced("ns1", "web"), "11", deploy);
        assert_eq!(DeploymentReconciler.summarize(&obj), "ns1/web available=2");
        assert_eq!(available_replicas(&Deployment::default()), 0);
    }

    #[tokio::test]
    async fn observational_reconcilers_always_succeed() {
        let obj = CachedObject::new(ObjectKey::namespaced("ns1", "pod-a"), "1", Pod::default())
            .with_labels([("app", "web")]);
        assert!(PodReconciler.reconcile(&obj).await.is_ok());
        let node = CachedObject::new(ObjectKey::cluster("n"), "1", Node::default()).with_labels([("zone", "a")]);
        assert_eq!(format_labels(&node), "zone=a");
        assert!(NodeReconciler.reconcile(&node).await.is_ok());
    }
}
