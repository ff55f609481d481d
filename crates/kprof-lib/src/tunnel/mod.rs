//! Local tunnel to a port inside the target pod
//!
//! The coordinator binds a local listener, announces readiness exactly once,
//! and forwards each accepted connection through a [`PodDialer`] until the
//! shared cancellation scope is cancelled or the upstream fails.

mod dialer;

#[cfg(test)]
mod tests;

pub use dialer::{KubePodDialer, PodDialer, TunnelIo, TunnelStream, Upstream};

use crate::error::{KprofError, Result};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fires once when the tunnel's listener is bound
#[derive(Debug)]
pub struct ReadySignal(oneshot::Sender<SocketAddr>);

/// Observes the [`ReadySignal`]
#[derive(Debug)]
pub struct ReadyWaiter(oneshot::Receiver<SocketAddr>);

/// Create a connected readiness pair
pub fn ready_signal() -> (ReadySignal, ReadyWaiter) {
    let (tx, rx) = oneshot::channel();
    (ReadySignal(tx), ReadyWaiter(rx))
}

impl ReadySignal {
    /// Announce the bound address; consumes the signal
    pub fn fire(self, addr: SocketAddr) {
        if self.0.send(addr).is_err() {
            debug!(%addr, "Nobody is waiting for tunnel readiness");
        }
    }
}

impl ReadyWaiter {
    /// Wait for the bound address
    ///
    /// Returns `None` if the coordinator stopped before binding.
    pub async fn wait(self) -> Option<SocketAddr> {
        self.0.await.ok()
    }
}

/// Listener settings for the tunnel
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Local address the listener binds to
    pub bind_address: IpAddr,
    /// How long in-flight connections get to finish after cancellation
    pub grace: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            grace: Duration::from_secs(5),
        }
    }
}

/// Forwards a local port to a remote port on the target pod
pub struct TunnelCoordinator<D> {
    dialer: Arc<D>,
    remote_port: u16,
    local_port: u16,
    settings: TunnelSettings,
}

impl<D: PodDialer> TunnelCoordinator<D> {
    pub fn new(dialer: Arc<D>, remote_port: u16, local_port: u16, settings: TunnelSettings) -> Self {
        Self {
            dialer,
            remote_port,
            local_port,
            settings,
        }
    }

    /// Run until `cancel` fires or the upstream fails
    ///
    /// Readiness is announced after the listener is bound and before the
    /// first accept. Tolerates never receiving a connection.
    pub async fn run(self, cancel: CancellationToken, ready: ReadySignal) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Tunnel cancelled before the pod check completed");
                return Ok(());
            }
            checked = self.dialer.check() => checked?,
        }

        let addr = SocketAddr::new(self.settings.bind_address, self.local_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| KprofError::Tunnel(format!("failed to listen on {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| KprofError::Tunnel(format!("listener has no local address: {}", e)))?;

        info!(
            local = %local_addr,
            remote_port = self.remote_port,
            "Forwarding from {} -> {}",
            local_addr,
            self.remote_port
        );
        ready.fire(local_addr);

        let connection_cancel = cancel.child_token();
        let mut connections: JoinSet<Result<()>> = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutting down tunnel");
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        debug!(%peer, "Accepted local connection");
                        connections.spawn(forward_connection(
                            self.dialer.clone(),
                            self.remote_port,
                            socket,
                            peer,
                            connection_cancel.clone(),
                        ));
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!(error = %e, "Transient accept failure");
                    }
                    Err(e) => {
                        break Err(KprofError::Tunnel(format!("accept failed on {}: {}", local_addr, e)));
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e),
                    Err(e) => warn!(error = %e, "Forwarding task did not complete"),
                },
            }
        };

        drop(listener);
        connection_cancel.cancel();
        self.drain(&mut connections).await;

        outcome
    }

    async fn drain(&self, connections: &mut JoinSet<Result<()>>) {
        if connections.is_empty() {
            return;
        }

        let drained = tokio::time::timeout(self.settings.grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                grace_ms = self.settings.grace.as_millis() as u64,
                "Aborting forwarded connections after grace period"
            );
            connections.shutdown().await;
        }
    }
}

/// Carry one local connection to the pod
///
/// Only a failure to reach the pod is returned; a connection that breaks
/// after it was established just ends. The upstream session is wound down
/// before this returns.
async fn forward_connection<D: PodDialer>(
    dialer: Arc<D>,
    remote_port: u16,
    mut client: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let mut upstream = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        dialed = dialer.dial(remote_port) => dialed?,
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!(%peer, "Closing forwarded connection");
        }
        copied = copy_bidirectional(&mut client, upstream.stream()) => match copied {
            Ok((sent, received)) => debug!(%peer, sent, received, "Forwarded connection closed"),
            Err(e) => debug!(%peer, error = %e, "Forwarded connection ended"),
        },
    }

    drop(client);
    upstream.finish().await;
    Ok(())
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
