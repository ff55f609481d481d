//! Port discovery from the pod specification

use crate::error::{KprofError, Result};
use crate::models::{PortCandidate, Target};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tracing::debug;

/// Source of the ports a pod declares
#[async_trait]
pub trait PortResolver: Send + Sync {
    /// List declared TCP ports, containers and ports in declaration order
    async fn resolve(&self, target: &Target) -> Result<Vec<PortCandidate>>;
}

/// Reads the live pod spec from the cluster
#[derive(Clone)]
pub struct KubePortResolver {
    client: Client,
}

impl KubePortResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PortResolver for KubePortResolver {
    async fn resolve(&self, target: &Target) -> Result<Vec<PortCandidate>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let pod = pods
            .get(&target.pod)
            .await
            .map_err(|e| KprofError::from_kube(e, &target.namespace, &target.pod))?;

        let candidates = candidates_from_pod(&pod);
        debug!(
            pod = %target.pod,
            namespace = %target.namespace,
            count = candidates.len(),
            "Resolved declared ports"
        );
        Ok(candidates)
    }
}

/// Extract TCP port candidates from a pod
///
/// A port without a protocol is TCP, which is the API server default.
pub fn candidates_from_pod(pod: &Pod) -> Vec<PortCandidate> {
    let Some(spec) = pod.spec.as_ref() else {
        return Vec::new();
    };

    spec.containers
        .iter()
        .flat_map(|container| {
            container
                .ports
                .iter()
                .flatten()
                .filter(|port| port.protocol.as_deref().unwrap_or("TCP") == "TCP")
                .filter_map(move |port| {
                    u16::try_from(port.container_port)
                        .ok()
                        .map(|p| PortCandidate::new(container.name.clone(), p))
                })
        })
        .collect()
}
