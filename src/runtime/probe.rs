//! Runtime compatibility probing

use super::{Dialect, OrchestrationRuntime, RuntimeCapability, RuntimeVersion, Version};
use crate::context::ExecutionContext;
use crate::error::{Result, StackError};

/// Oldest standalone `docker-compose` release that understands our compose files
pub const MIN_LEGACY_VERSION: Version = Version::new(1, 27, 0);

/// Oldest `docker compose` plugin release supported
pub const MIN_INTEGRATED_VERSION: Version = Version::new(2, 0, 0);

/// Minimum supported version for a dialect
pub fn minimum_version(dialect: Dialect) -> Version {
    match dialect {
        Dialect::Legacy => MIN_LEGACY_VERSION,
        Dialect::Integrated => MIN_INTEGRATED_VERSION,
    }
}

/// Probe the runtime once per context.
///
/// The capability is attached to `ctx`; later calls return it without
/// querying the runtime again. Errors are surfaced as-is, never retried.
pub async fn probe(
    ctx: &ExecutionContext,
    runtime: &dyn OrchestrationRuntime,
) -> Result<RuntimeCapability> {
    if let Ok(capability) = ctx.capability() {
        return Ok(capability.clone());
    }

    let reported = runtime.probe_version().await?;
    let capability = evaluate(&reported)?;

    tracing::debug!(
        "Runtime {} detected: {} {}",
        runtime.name(),
        capability.dialect,
        capability.version
    );

    Ok(ctx.attach_capability(capability).clone())
}

/// Turn a raw version report into a capability, enforcing minimums
pub fn evaluate(reported: &RuntimeVersion) -> Result<RuntimeCapability> {
    let version = Version::parse(&reported.raw).ok_or_else(|| {
        StackError::RuntimeUnavailable(format!(
            "{} reported an unrecognized version '{}'",
            reported.dialect,
            reported.raw.trim()
        ))
    })?;

    let minimum = minimum_version(reported.dialect);
    if version < minimum {
        return Err(StackError::RuntimeUnsupportedVersion {
            dialect: reported.dialect.to_string(),
            found: version.to_string(),
            minimum: minimum.to_string(),
        });
    }

    Ok(RuntimeCapability::new(reported.dialect, version))
}
