//! Cluster client bootstrapping
//!
//! Loads the kubeconfig once per invocation and keeps the resulting client
//! together with the active context's namespace, so the resolver and the
//! tunnel never read ambient configuration themselves.

use crate::error::{KprofError, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::PathBuf;
use tracing::debug;

/// How to reach the cluster
#[derive(Debug, Clone, Default)]
pub struct ClusterOptions {
    /// Explicit kubeconfig file, otherwise the usual inference rules apply
    pub kubeconfig: Option<PathBuf>,
    /// Context to use instead of the current one
    pub context: Option<String>,
}

/// A connected cluster client plus its default namespace
#[derive(Clone)]
pub struct ClusterContext {
    client: Client,
    default_namespace: String,
}

impl ClusterContext {
    /// Load configuration and build a client
    pub async fn connect(options: &ClusterOptions) -> Result<Self> {
        let kube_options = KubeConfigOptions {
            context: options.context.clone(),
            ..KubeConfigOptions::default()
        };

        let config = match (&options.kubeconfig, &options.context) {
            (Some(path), _) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    KprofError::Transport(format!(
                        "failed to read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &kube_options)
                    .await
                    .map_err(|e| {
                        KprofError::Transport(format!(
                            "failed to load kubeconfig {}: {}",
                            path.display(),
                            e
                        ))
                    })?
            }
            (None, Some(_)) => Config::from_kubeconfig(&kube_options)
                .await
                .map_err(|e| KprofError::Transport(format!("failed to load kubeconfig: {}", e)))?,
            (None, None) => Config::infer().await.map_err(|e| {
                KprofError::Transport(format!("failed to infer cluster configuration: {}", e))
            })?,
        };

        let default_namespace = config.default_namespace.clone();
        debug!(
            cluster_url = %config.cluster_url,
            namespace = %default_namespace,
            "Loaded cluster configuration"
        );

        let client = Client::try_from(config)
            .map_err(|e| KprofError::Transport(format!("failed to create client: {}", e)))?;

        Ok(Self {
            client,
            default_namespace,
        })
    }

    /// Use the requested namespace, falling back to the context's
    pub fn namespace_or_default(&self, requested: Option<&str>) -> String {
        resolve_namespace(requested, &self.default_namespace)
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

fn resolve_namespace(requested: Option<&str>, fallback: &str) -> String {
    match requested {
        Some(ns) if !ns.is_empty() => ns.to_string(),
        _ => fallback.to_string(),
    }
}
