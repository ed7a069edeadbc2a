//! Container orchestration runtime interface
//!
//! The lifecycle code drives containers only through the
//! [`OrchestrationRuntime`] trait:
//! - `docker compose` / `docker-compose` via [`DockerCompose`]
//! - an in-memory runtime for tests

pub mod compose;
pub mod probe;

#[cfg(test)]
pub(crate) mod testing;

pub use compose::DockerCompose;
pub use probe::probe;

use crate::context::CancelSignal;
use crate::error::{Result, StackError};
use crate::stack::StackDefinition;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").expect("version regex is valid")
});

/// Command dialect accepted by the orchestration runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Standalone `docker-compose` tool
    Legacy,
    /// `docker compose` subcommand
    Integrated,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Legacy => write!(f, "docker-compose"),
            Dialect::Integrated => write!(f, "docker compose"),
        }
    }
}

/// Semantic version reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    /// Parse the first `major.minor[.patch]` found in `raw`.
    ///
    /// Accepts `v2.24.6-desktop.1`, `1.29.2, build 5becea4c` and similar.
    pub fn parse(raw: &str) -> Option<Self> {
        let re = &*VERSION_RE;

        let caps = re.captures(raw)?;
        let major = caps.get(1)?.as_str().parse().ok()?;
        let minor = caps.get(2)?.as_str().parse().ok()?;
        let patch = caps
            .get(3)
            .map(|m| m.as_str().parse::<u64>())
            .transpose()
            .ok()?
            .unwrap_or(0);
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Raw answer of a runtime version query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeVersion {
    pub dialect: Dialect,
    pub raw: String,
}

/// Detected orchestration dialect and version.
///
/// Computed once per process by [`probe`]; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCapability {
    pub dialect: Dialect,
    pub version: Version,
}

impl RuntimeCapability {
    pub fn new(dialect: Dialect, version: Version) -> Self {
        Self { dialect, version }
    }
}

/// Live health of one service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceHealth {
    /// Running and passing its healthcheck (or running without one)
    Healthy,
    /// Running, healthcheck not yet passing
    Starting,
    /// Running, healthcheck failing
    Unhealthy,
    /// Container exists but is not running
    Stopped,
    /// No container exists
    Missing,
}

impl ServiceHealth {
    /// Whether a container process is up
    pub fn is_up(self) -> bool {
        matches!(
            self,
            ServiceHealth::Healthy | ServiceHealth::Starting | ServiceHealth::Unhealthy
        )
    }
}

impl fmt::Display for ServiceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceHealth::Healthy => write!(f, "healthy"),
            ServiceHealth::Starting => write!(f, "starting"),
            ServiceHealth::Unhealthy => write!(f, "unhealthy"),
            ServiceHealth::Stopped => write!(f, "stopped"),
            ServiceHealth::Missing => write!(f, "missing"),
        }
    }
}

/// Result of a per-service start or stop request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOutcome {
    pub service: String,
    pub error: Option<String>,
}

impl ServiceOutcome {
    pub fn ok(service: &str) -> Self {
        Self {
            service: service.to_string(),
            error: None,
        }
    }

    pub fn failed(service: &str, error: impl Into<String>) -> Self {
        Self {
            service: service.to_string(),
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything a runtime needs to address one stack
#[derive(Debug, Clone, Copy)]
pub struct RuntimeCall<'a> {
    pub capability: &'a RuntimeCapability,
    pub definition: &'a StackDefinition,
    pub directory: &'a Path,
    pub cancel: &'a CancelSignal,
}

impl RuntimeCall<'_> {
    /// Project name used for the stack's containers
    pub fn project(&self) -> &str {
        &self.definition.name
    }
}

/// Orchestration runtime trait.
///
/// Implementations must honor `call.cancel`: a cancelled call asks the
/// underlying tool to terminate and returns [`StackError::Cancelled`].
#[async_trait]
pub trait OrchestrationRuntime: Send + Sync {
    /// Report which dialect answers on this host and its version string.
    ///
    /// Fails with `RuntimeUnavailable` when nothing is reachable.
    async fn probe_version(&self) -> Result<RuntimeVersion>;

    /// Request each service to start, in the order given
    async fn bring_up(
        &self,
        call: &RuntimeCall<'_>,
        services: &[String],
    ) -> Result<Vec<ServiceOutcome>>;

    /// Request graceful shutdown of each service, in the order given.
    ///
    /// A service that does not stop within `timeout` is reported as failed
    /// and the remaining services are still processed.
    async fn bring_down(
        &self,
        call: &RuntimeCall<'_>,
        services: &[String],
        timeout: Duration,
    ) -> Result<Vec<ServiceOutcome>>;

    /// Query live health for each service
    async fn service_health(
        &self,
        call: &RuntimeCall<'_>,
        services: &[String],
    ) -> Result<BTreeMap<String, ServiceHealth>>;

    /// Run a command inside a service container and return its stdout
    async fn exec(
        &self,
        call: &RuntimeCall<'_>,
        service: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<String>;

    /// Runtime name (for logging)
    fn name(&self) -> &str;
}

/// Convert a runtime failure into a short message for per-service outcomes
pub(crate) fn describe(err: &StackError) -> String {
    match err {
        StackError::Runtime(msg) => msg.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse_variants() {
        assert_eq!(Version::parse("v2.24.6-desktop.1"), Some(Version::new(2, 24, 6)));
        assert_eq!(Version::parse("1.29.2, build 5becea4c"), Some(Version::new(1, 29, 2)));
        assert_eq!(
            Version::parse("docker-compose version 1.25.0"),
            Some(Version::new(1, 25, 0))
        );
        assert_eq!(Version::parse("2.27"), Some(Version::new(2, 27, 0)));
        assert_eq!(Version::parse("dev"), None);
    }

    #[test]
    fn test_version_ordering() {
        assert!(Version::new(1, 27, 0) < Version::new(1, 29, 2));
        assert!(Version::new(1, 99, 9) < Version::new(2, 0, 0));
    }

    #[test]
    fn test_health_is_up() {
        assert!(ServiceHealth::Starting.is_up());
        assert!(!ServiceHealth::Stopped.is_up());
        assert!(!ServiceHealth::Missing.is_up());
    }
}
