//! Ties port resolution, the tunnel and the viewer together
//!
//! One invocation runs exactly two tasks: the tunnel coordinator and the
//! profile launcher. Whichever finishes first, successfully or not, cancels
//! the shared scope; the orchestrator returns only after both have stopped.


use crate::error::{KprofError, Result};
use crate::launcher::{LaunchReport, ProfileLauncher};
use crate::models::{select_port, PortSelection, ProfileKind, Target};
use crate::ports::free_port;
use crate::resolver::PortResolver;
use crate::tunnel::{ready_signal, PodDialer, TunnelCoordinator, TunnelSettings};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything the operator asked for
#[derive(Debug, Clone)]
pub struct ProfileRequest {
    pub target: Target,
    pub kind: ProfileKind,
    /// Remote port; `None` or `Some(0)` means auto-detect
    pub port: Option<u16>,
    /// Restrict auto-detection to this container
    pub container: Option<String>,
}

impl ProfileRequest {
    fn explicit_port(&self) -> Option<u16> {
        self.port.filter(|p| *p != 0)
    }
}

/// Outcome of a completed invocation
#[derive(Debug, Clone)]
pub struct ProfileSummary {
    pub target: Target,
    pub kind: ProfileKind,
    pub remote_port: u16,
    pub local_port: u16,
    /// `None` if the launcher task did not report (it failed or panicked)
    pub launch: Option<LaunchReport>,
}

/// Which of the two tasks produced a result
enum TaskOutput {
    Tunnel(Result<()>),
    Launcher(Result<LaunchReport>),
}

/// Runs profiling invocations
pub struct Orchestrator<R, D> {
    resolver: R,
    dialer: Arc<D>,
    launcher: ProfileLauncher,
    settings: TunnelSettings,
}

impl<R, D> Orchestrator<R, D>
where
    R: PortResolver,
    D: PodDialer,
{
    pub fn new(resolver: R, dialer: D, launcher: ProfileLauncher, settings: TunnelSettings) -> Self {
        Self {
            resolver,
            dialer: Arc::new(dialer),
            launcher,
            settings,
        }
    }

    /// Decide which remote port to tunnel to
    ///
    /// The resolver is not consulted when the request carries a port.
    pub async fn select_port(&self, request: &ProfileRequest) -> Result<PortSelection> {
        if let Some(port) = request.explicit_port() {
            debug!(port, "Using explicit port");
            return Ok(PortSelection::explicit(port));
        }

        let candidates = self.resolver.resolve(&request.target).await?;
        select_port(None, request.container.as_deref(), &candidates)
    }

    /// Select a port, then tunnel and launch the viewer
    pub async fn run(
        &self,
        request: &ProfileRequest,
        cancel: CancellationToken,
    ) -> Result<ProfileSummary> {
        let selection = self.select_port(request).await?;
        if let Some(warning) = selection.warning() {
            warn!("{}", warning);
        }
        self.run_with_selection(request, &selection, cancel).await
    }

    /// Tunnel to an already selected port and launch the viewer
    pub async fn run_with_selection(
        &self,
        request: &ProfileRequest,
        selection: &PortSelection,
        cancel: CancellationToken,
    ) -> Result<ProfileSummary> {
        let local_port = free_port(self.settings.bind_address).map_err(|e| {
            KprofError::Tunnel(format!("failed to allocate a local tunnel port: {}", e))
        })?;

        info!(
            pod = %request.target,
            profile = %request.kind,
            remote_port = selection.port,
            local_port,
            "Starting profiling session"
        );

        let scope = cancel.child_token();
        let (ready, waiter) = ready_signal();
        let mut tasks = JoinSet::new();

        let coordinator = TunnelCoordinator::new(
            self.dialer.clone(),
            selection.port,
            local_port,
            self.settings.clone(),
        );
        let tunnel_scope = scope.clone();
        tasks.spawn(async move { TaskOutput::Tunnel(coordinator.run(tunnel_scope, ready).await) });

        let launcher = self.launcher.clone();
        let kind = request.kind;
        let launcher_scope = scope.clone();
        tasks.spawn(async move {
            TaskOutput::Launcher(launcher.launch(kind, local_port, waiter, launcher_scope).await)
        });

        let mut first_error: Option<KprofError> = None;
        let mut launch = None;

        while let Some(joined) = tasks.join_next().await {
            scope.cancel();

            let failure = match joined {
                Ok(TaskOutput::Tunnel(Ok(()))) => {
                    debug!("Tunnel stopped");
                    None
                }
                Ok(TaskOutput::Tunnel(Err(e))) => Some(e),
                Ok(TaskOutput::Launcher(Ok(report))) => {
                    debug!(status = ?report.status, "Analysis tool finished");
                    launch = Some(report);
                    None
                }
                Ok(TaskOutput::Launcher(Err(e))) => Some(e),
                Err(e) => Some(KprofError::Tunnel(format!("session task failed: {}", e))),
            };

            if let Some(e) = failure {
                if first_error.is_none() {
                    info!(error = %e, "Stopping profiling session");
                    first_error = Some(e);
                } else {
                    debug!(error = %e, "Suppressed error after shutdown began");
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        Ok(ProfileSummary {
            target: request.target.clone(),
            kind: request.kind,
            remote_port: selection.port,
            local_port,
            launch,
        })
    }
}
