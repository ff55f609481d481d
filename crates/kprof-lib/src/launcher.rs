//! Launching the external profile viewer against the tunnel

use crate::error::{KprofError, Result};
use crate::models::ProfileKind;
use crate::ports::free_port;
use crate::tunnel::ReadyWaiter;
use std::net::{IpAddr, Ipv4Addr};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Path prefix of the pprof HTTP handlers
pub const DIAGNOSTIC_PATH: &str = "debug/pprof";

/// Host name used in the target URL
pub const DEFAULT_TARGET_HOST: &str = "localhost";

/// Build the URL the viewer fetches the profile from
pub fn target_url(host: &str, port: u16, kind: ProfileKind) -> String {
    format!("http://{}:{}/{}/{}", host, port, DIAGNOSTIC_PATH, kind.segment())
}

/// The external analysis tool and its fixed leading arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisTool {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for AnalysisTool {
    fn default() -> Self {
        Self {
            program: "go".to_string(),
            args: vec!["tool".to_string(), "pprof".to_string()],
        }
    }
}

impl AnalysisTool {
    /// Build from a full argv, e.g. `["go", "tool", "pprof"]`
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        match argv.split_first() {
            Some((program, args)) if !program.is_empty() => Ok(Self {
                program: program.clone(),
                args: args.to_vec(),
            }),
            _ => Err(KprofError::Usage(
                "the analysis tool command must not be empty".to_string(),
            )),
        }
    }

    /// Arguments for one run: the fixed prefix, the UI flag, the target
    pub fn invocation_args(&self, ui_port: u16, target: &str) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(format!("-http=:{}", ui_port));
        args.push(target.to_string());
        args
    }
}

/// What happened to the viewer
#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub target_url: String,
    pub ui_port: u16,
    /// `None` when the viewer was never started or was stopped by cancellation
    pub status: Option<ExitStatus>,
}

/// Starts the analysis tool once the tunnel is ready
#[derive(Debug, Clone)]
pub struct ProfileLauncher {
    tool: AnalysisTool,
    target_host: String,
    ui_address: IpAddr,
}

impl Default for ProfileLauncher {
    fn default() -> Self {
        Self::new(AnalysisTool::default())
    }
}

impl ProfileLauncher {
    pub fn new(tool: AnalysisTool) -> Self {
        Self {
            tool,
            target_host: DEFAULT_TARGET_HOST.to_string(),
            ui_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }

    /// Host name put into the target URL
    pub fn with_target_host(mut self, host: impl Into<String>) -> Self {
        self.target_host = host.into();
        self
    }

    pub fn tool(&self) -> &AnalysisTool {
        &self.tool
    }

    /// Wait for the tunnel, then run the viewer until it exits or `cancel` fires
    ///
    /// The child inherits the terminal. On cancellation it is killed and
    /// reaped before this returns.
    pub async fn launch(
        &self,
        kind: ProfileKind,
        tunnel_port: u16,
        ready: ReadyWaiter,
        cancel: CancellationToken,
    ) -> Result<LaunchReport> {
        let target_url = target_url(&self.target_host, tunnel_port, kind);

        let ready_addr = tokio::select! {
            _ = cancel.cancelled() => None,
            addr = ready.wait() => addr,
        };
        let Some(ready_addr) = ready_addr else {
            debug!("Tunnel never became ready, not starting the viewer");
            return Ok(LaunchReport {
                target_url,
                ui_port: 0,
                status: None,
            });
        };
        debug!(tunnel = %ready_addr, "Tunnel ready");

        let ui_port = free_port(self.ui_address)
            .map_err(|e| KprofError::Launcher(format!("failed to allocate a UI port: {}", e)))?;

        let args = self.tool.invocation_args(ui_port, &target_url);
        info!(program = %self.tool.program, ?args, "Starting analysis tool");

        let mut child = Command::new(&self.tool.program)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                KprofError::Launcher(format!("failed to start {}: {}", self.tool.program, e))
            })?;

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Stopping analysis tool");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to stop analysis tool");
                }
                None
            }
            waited = child.wait() => Some(waited.map_err(|e| {
                KprofError::Launcher(format!("failed waiting for {}: {}", self.tool.program, e))
            })?),
        };

        if let Some(status) = status {
            if interrupted(&status) {
                debug!(%status, "Analysis tool was interrupted");
            } else if !status.success() {
                return Err(KprofError::Launcher(format!(
                    "{} exited with {}",
                    self.tool.program, status
                )));
            }
        }

        Ok(LaunchReport {
            target_url,
            ui_port,
            status,
        })
    }
}

/// Whether the child died from the terminal's interrupt
///
/// Ctrl-C reaches the viewer and us at the same time; that is a normal way
/// to end a session, not a viewer failure.
#[cfg(unix)]
fn interrupted(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    const SIGINT: i32 = 2;
    status.signal() == Some(SIGINT)
}

#[cfg(not(unix))]
fn interrupted(_status: &ExitStatus) -> bool {
    false
}
