//! Upstream connections into the pod's network namespace

use crate::error::{KprofError, Result};
use crate::models::Target;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// A bidirectional byte stream to a port inside the pod
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed upstream stream handed out by a [`PodDialer`]
pub type TunnelStream = Box<dyn TunnelIo>;

type SessionFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// One dialed connection to the pod
///
/// Besides the byte stream it may carry the session that backs it. The
/// session is awaited after the stream is dropped, so closing the
/// connection to the cluster happens inside the tunnel's shutdown window.
pub struct Upstream {
    stream: TunnelStream,
    session: Option<SessionFuture>,
}

impl Upstream {
    /// A stream with nothing to wind down
    pub fn new(stream: TunnelStream) -> Self {
        Self {
            stream,
            session: None,
        }
    }

    /// A stream whose backing session completes after the stream is closed
    pub fn with_session(
        stream: TunnelStream,
        session: impl Future<Output = ()> + Send + 'static,
    ) -> Self {
        Self {
            stream,
            session: Some(Box::pin(session)),
        }
    }

    pub fn stream(&mut self) -> &mut TunnelStream {
        &mut self.stream
    }

    /// Close the stream and wait for the backing session to end
    pub async fn finish(self) {
        let Upstream { stream, session } = self;
        drop(stream);
        if let Some(session) = session {
            session.await;
        }
    }
}

/// Opens streams to a remote port on the target pod
#[async_trait]
pub trait PodDialer: Send + Sync + 'static {
    /// Verify the target can be forwarded to at all
    async fn check(&self) -> Result<()> {
        Ok(())
    }

    /// Open one stream to `remote_port`
    async fn dial(&self, remote_port: u16) -> Result<Upstream>;
}

/// Port-forwards through the cluster API server
///
/// Every dial upgrades a fresh connection to the pod's `portforward`
/// subresource and carries exactly one local connection.
#[derive(Clone)]
pub struct KubePodDialer {
    pods: Api<Pod>,
    target: Target,
}

impl KubePodDialer {
    pub fn new(client: Client, target: Target) -> Self {
        let pods = Api::namespaced(client, &target.namespace);
        Self { pods, target }
    }
}

#[async_trait]
impl PodDialer for KubePodDialer {
    async fn check(&self) -> Result<()> {
        let pod = self
            .pods
            .get(&self.target.pod)
            .await
            .map_err(|e| KprofError::from_kube(e, &self.target.namespace, &self.target.pod))?;

        let phase = pod
            .status
            .and_then(|status| status.phase)
            .unwrap_or_else(|| "Unknown".to_string());
        if phase != "Running" {
            return Err(KprofError::Tunnel(format!(
                "unable to forward port because pod is not running. Current status={}",
                phase
            )));
        }
        Ok(())
    }

    async fn dial(&self, remote_port: u16) -> Result<Upstream> {
        let mut forwarder = self
            .pods
            .portforward(&self.target.pod, &[remote_port])
            .await
            .map_err(|e| {
                KprofError::Tunnel(format!(
                    "failed to open port-forward to {}:{}: {}",
                    self.target, remote_port, e
                ))
            })?;

        let stream = forwarder.take_stream(remote_port).ok_or_else(|| {
            KprofError::Tunnel(format!("port {} missing from port-forward session", remote_port))
        })?;
        let remote_error = forwarder.take_error(remote_port);

        let pod = self.target.clone();
        let session = async move {
            let reported = async move {
                match remote_error {
                    Some(error) => error.await,
                    None => None,
                }
            };
            let (joined, reported) = tokio::join!(forwarder.join(), reported);

            if let Some(message) = reported {
                warn!(%pod, remote_port, error = %message, "Pod reported a forwarding error");
            }
            if let Err(e) = joined {
                debug!(remote_port, error = %e, "Port-forward session ended with error");
            }
        };

        Ok(Upstream::with_session(Box::new(stream), session))
    }
}
