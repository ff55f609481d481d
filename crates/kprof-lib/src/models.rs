//! Core data model for a profiling invocation

use crate::error::{KprofError, Result};
use std::fmt;
use std::str::FromStr;

/// The pod to profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub namespace: String,
    pub pod: String,
}

impl Target {
    /// Create a target, rejecting an empty pod name
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Result<Self> {
        let pod = pod.into();
        if pod.trim().is_empty() {
            return Err(KprofError::Usage("a pod name is required".to_string()));
        }

        Ok(Self {
            namespace: namespace.into(),
            pod,
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)
    }
}

/// Which runtime profile to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileKind {
    /// CPU samples
    Cpu,
    /// Heap snapshot
    Memory,
    /// Allocation trace
    Allocs,
}

impl ProfileKind {
    /// Path segment under the pprof diagnostic endpoint
    pub fn segment(&self) -> &'static str {
        match self {
            ProfileKind::Cpu => "profile",
            ProfileKind::Memory => "heap",
            ProfileKind::Allocs => "allocs",
        }
    }

    /// Name of the subcommand selecting this profile
    pub fn command_name(&self) -> &'static str {
        match self {
            ProfileKind::Cpu => "cpu",
            ProfileKind::Memory => "memory",
            ProfileKind::Allocs => "allocs",
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

impl FromStr for ProfileKind {
    type Err = KprofError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(ProfileKind::Cpu),
            "memory" => Ok(ProfileKind::Memory),
            "allocs" => Ok(ProfileKind::Allocs),
            other => Err(KprofError::Usage(format!("unknown profile type: {}", other))),
        }
    }
}

/// A TCP port declared by one of the pod's containers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    pub container: String,
    pub port: u16,
}

impl PortCandidate {
    pub fn new(container: impl Into<String>, port: u16) -> Self {
        Self {
            container: container.into(),
            port,
        }
    }
}

/// Where the selected remote port came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSource {
    /// Supplied on the command line
    Explicit,
    /// Picked from the pod's declared ports
    Detected {
        /// Container that declared the chosen port
        container: String,
        /// Distinct containers left after filtering, first-seen order
        containers: Vec<String>,
        /// Whether a container filter was applied
        filtered: bool,
    },
}

/// The single remote port a tunnel will target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSelection {
    pub port: u16,
    pub source: PortSource,
}

impl PortSelection {
    pub fn explicit(port: u16) -> Self {
        Self {
            port,
            source: PortSource::Explicit,
        }
    }

    /// Warning to show when the choice between containers was arbitrary
    pub fn warning(&self) -> Option<String> {
        match &self.source {
            PortSource::Detected {
                containers,
                filtered: false,
                ..
            } if containers.len() > 1 => Some(format!(
                "multiple containers found: [{}] you can specify one with -c / --container flag",
                containers.join(" ")
            )),
            _ => None,
        }
    }
}

/// Apply the port selection rule
///
/// An explicit non-zero port always wins. Otherwise candidates are filtered
/// by container name (when given) and the first survivor is used. Several
/// surviving containers without a filter is not an error: the first one is
/// kept and [`PortSelection::warning`] reports the ambiguity.
pub fn select_port(
    explicit: Option<u16>,
    container: Option<&str>,
    candidates: &[PortCandidate],
) -> Result<PortSelection> {
    if let Some(port) = explicit.filter(|p| *p != 0) {
        return Ok(PortSelection::explicit(port));
    }

    let survivors: Vec<&PortCandidate> = match container {
        Some(name) => candidates.iter().filter(|c| c.container == name).collect(),
        None => candidates.iter().collect(),
    };

    let first = match survivors.first() {
        Some(first) => *first,
        None => {
            let message = match container {
                Some(name) if !candidates.is_empty() => format!(
                    "no ports found for container {}, you can specify one with -p / --port flag",
                    name
                ),
                _ => "no ports found, you can specify one with -p / --port flag".to_string(),
            };
            return Err(KprofError::NoPort(message));
        }
    };

    let mut containers: Vec<String> = Vec::new();
    for candidate in &survivors {
        if !containers.contains(&candidate.container) {
            containers.push(candidate.container.clone());
        }
    }

    Ok(PortSelection {
        port: first.port,
        source: PortSource::Detected {
            container: first.container.clone(),
            containers,
            filtered: container.is_some(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_containers() -> Vec<PortCandidate> {
        vec![
            PortCandidate::new("app", 6060),
            PortCandidate::new("app", 8080),
            PortCandidate::new("sidecar", 9000),
        ]
    }

    #[test]
    fn test_target_requires_pod_name() {
        assert!(matches!(Target::new("prod", ""), Err(KprofError::Usage(_))));
        assert!(matches!(Target::new("prod", "  "), Err(KprofError::Usage(_))));

        let target = Target::new("prod", "web-7").unwrap();
        assert_eq!(target.to_string(), "prod/web-7");
    }

    #[test]
    fn test_profile_segments() {
        assert_eq!(ProfileKind::Cpu.segment(), "profile");
        assert_eq!(ProfileKind::Memory.segment(), "heap");
        assert_eq!(ProfileKind::Allocs.segment(), "allocs");

        for kind in [ProfileKind::Cpu, ProfileKind::Memory, ProfileKind::Allocs] {
            assert_eq!(kind.command_name().parse::<ProfileKind>().unwrap(), kind);
        }
        assert!("goroutine".parse::<ProfileKind>().is_err());
    }

    #[test]
    fn test_explicit_port_wins() {
        let selection = select_port(Some(8080), Some("sidecar"), &two_containers()).unwrap();
        assert_eq!(selection, PortSelection::explicit(8080));
        assert!(selection.warning().is_none());
    }

    #[test]
    fn test_zero_port_means_auto_detect() {
        let selection = select_port(Some(0), None, &[PortCandidate::new("app", 6060)]).unwrap();
        assert_eq!(selection.port, 6060);
    }

    #[test]
    fn test_single_container_no_warning() {
        let candidates = vec![PortCandidate::new("app", 6060)];
        let selection = select_port(None, None, &candidates).unwrap();

        assert_eq!(selection.port, 6060);
        assert!(selection.warning().is_none());
    }

    #[test]
    fn test_multiple_containers_picks_first_and_warns() {
        let selection = select_port(None, None, &two_containers()).unwrap();

        assert_eq!(selection.port, 6060);
        match &selection.source {
            PortSource::Detected {
                container,
                containers,
                filtered,
            } => {
                assert_eq!(container, "app");
                assert_eq!(containers, &vec!["app".to_string(), "sidecar".to_string()]);
                assert!(!filtered);
            }
            other => panic!("unexpected source: {:?}", other),
        }

        let warning = selection.warning().expect("should warn");
        assert!(warning.contains("app sidecar"));
        assert!(warning.contains("--container"));
    }

    #[test]
    fn test_container_filter() {
        let selection = select_port(None, Some("sidecar"), &two_containers()).unwrap();
        assert_eq!(selection.port, 9000);
        assert!(selection.warning().is_none());
    }

    #[test]
    fn test_filter_matching_nothing_fails() {
        let err = select_port(None, Some("missing"), &two_containers()).unwrap_err();
        assert!(matches!(err, KprofError::NoPort(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_no_candidates_fails() {
        let err = select_port(None, None, &[]).unwrap_err();
        assert!(matches!(err, KprofError::NoPort(_)));
        assert!(err.to_string().contains("--port"));
    }
}
