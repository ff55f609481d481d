//! Profile Go processes running in Kubernetes pods
//!
//! This crate provides:
//! - Discovery of the TCP ports a pod declares
//! - A local tunnel to a port inside the pod
//! - Launching `go tool pprof` against the tunnel
//! - Orchestration of the tunnel and the viewer as one unit

pub mod cluster;
pub mod error;
pub mod launcher;
pub mod models;
pub mod orchestrator;
pub mod ports;
pub mod resolver;
pub mod tunnel;

pub use cluster::{ClusterContext, ClusterOptions};
pub use error::{KprofError, Result};
pub use launcher::{AnalysisTool, LaunchReport, ProfileLauncher};
pub use models::*;
pub use orchestrator::{Orchestrator, ProfileRequest, ProfileSummary};
pub use resolver::{KubePortResolver, PortResolver};
pub use tunnel::{KubePodDialer, PodDialer, TunnelSettings, Upstream};
