//! Stack lifecycle controller

use super::definition::StackDefinition;
use super::store::StackStore;
use super::topology;
use crate::config::StartupFailurePolicy;
use crate::context::ExecutionContext;
use crate::error::{Result, StackError};
use crate::runtime::{OrchestrationRuntime, RuntimeCall, RuntimeCapability, ServiceHealth};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;

/// Live state of a stack, derived from container status at read time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    /// No definition on disk
    Uninitialized,
    /// No service is up
    Stopped,
    /// Every service is healthy
    Running,
    /// Some but not all services are healthy
    Degraded,
}

impl fmt::Display for StackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackState::Uninitialized => write!(f, "uninitialized"),
            StackState::Stopped => write!(f, "stopped"),
            StackState::Running => write!(f, "running"),
            StackState::Degraded => write!(f, "degraded"),
        }
    }
}

/// Derive the stack state from per-service health
pub fn derive_state(services: &[String], health: &BTreeMap<String, ServiceHealth>) -> StackState {
    let state_of = |name: &String| health.get(name).copied().unwrap_or(ServiceHealth::Missing);

    if services.is_empty() || services.iter().all(|s| !state_of(s).is_up()) {
        StackState::Stopped
    } else if services.iter().all(|s| state_of(s) == ServiceHealth::Healthy) {
        StackState::Running
    } else {
        StackState::Degraded
    }
}

/// Lifecycle controller bound to one stack
pub struct LifecycleController {
    /// Stack name
    name: String,
    /// Execution context (settings, capability, cancellation)
    ctx: Arc<ExecutionContext>,
    /// Orchestration runtime
    runtime: Arc<dyn OrchestrationRuntime>,
    /// Definition store
    store: StackStore,
}

impl LifecycleController {
    /// Create a controller for stack `name` under `base_dir`
    pub fn new(
        ctx: Arc<ExecutionContext>,
        runtime: Arc<dyn OrchestrationRuntime>,
        name: &str,
        base_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.to_string(),
            ctx,
            runtime,
            store: StackStore::new(base_dir),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &StackStore {
        &self.store
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub(crate) fn runtime(&self) -> &dyn OrchestrationRuntime {
        self.runtime.as_ref()
    }

    /// Load the current definition from disk
    pub fn definition(&self) -> Result<StackDefinition> {
        self.store.load(&self.name)
    }

    /// Runtime capability and a freshly loaded definition.
    ///
    /// Every transition starts here.
    pub(crate) fn prepare(&self) -> Result<(RuntimeCapability, StackDefinition)> {
        let capability = self.ctx.capability()?.clone();
        self.ctx.cancel_signal().check()?;
        let definition = self.definition()?;
        Ok((capability, definition))
    }

    pub(crate) fn call<'a>(
        &'a self,
        capability: &'a RuntimeCapability,
        definition: &'a StackDefinition,
        directory: &'a std::path::Path,
    ) -> RuntimeCall<'a> {
        RuntimeCall {
            capability,
            definition,
            directory,
            cancel: self.ctx.cancel_signal(),
        }
    }

    /// `Uninitialized -> Stopped`: persist the initial definition.
    ///
    /// Re-creating a stack with the same topology is a no-op.
    pub async fn create(&self, definition: StackDefinition) -> Result<StackDefinition> {
        self.ctx.capability()?;

        if definition.name != self.name {
            return Err(StackError::InvalidDefinition(format!(
                "definition is for stack '{}', controller is bound to '{}'",
                definition.name, self.name
            )));
        }
        definition.validate()?;

        if self.store.exists(&self.name) {
            let existing = self.definition()?;
            if existing.services == definition.services {
                tracing::info!("Stack {} already exists with the same services", self.name);
                return Ok(existing);
            }
            return Err(StackError::StackExists(self.name.clone()));
        }

        self.store.init(&definition)?;
        tracing::info!(
            "Created stack {} with {} services",
            self.name,
            definition.services.len()
        );
        Ok(definition)
    }

    /// Query live container state
    pub async fn status(&self) -> Result<StackState> {
        let capability = self.ctx.capability()?.clone();
        let definition = match self.definition() {
            Ok(definition) => definition,
            Err(StackError::StackNotFound(_)) => return Ok(StackState::Uninitialized),
            Err(e) => return Err(e),
        };
        self.live_state(&capability, &definition).await
    }

    /// Per-service live health
    pub async fn service_health(&self) -> Result<BTreeMap<String, ServiceHealth>> {
        let (capability, definition) = self.prepare()?;
        let dir = self.store.stack_dir(&self.name);
        let call = self.call(&capability, &definition, &dir);
        self.runtime
            .service_health(&call, &definition.service_names())
            .await
    }

    pub(crate) async fn live_state(
        &self,
        capability: &RuntimeCapability,
        definition: &StackDefinition,
    ) -> Result<StackState> {
        let services = definition.service_names();
        if services.is_empty() {
            return Ok(StackState::Stopped);
        }
        let dir = self.store.stack_dir(&self.name);
        let call = self.call(capability, definition, &dir);
        let health = self.runtime.service_health(&call, &services).await?;
        Ok(derive_state(&services, &health))
    }

    /// `Stopped -> Running`: start services in dependency order.
    ///
    /// A service gets its start request only once all of its dependencies
    /// are healthy. Services downstream of a failure are skipped, the
    /// others keep starting. The first failure is reported as
    /// `StartupFailed`; what happens to started services depends on the
    /// configured [`StartupFailurePolicy`].
    pub async fn start(&self) -> Result<()> {
        let (capability, definition) = self.prepare()?;
        let dir = self.store.stack_dir(&self.name);
        let call = self.call(&capability, &definition, &dir);

        let order = topology::start_order(&definition.services)?;
        let health = self.runtime.service_health(&call, &order).await?;
        if derive_state(&order, &health) == StackState::Running {
            tracing::info!("Stack {} is already running", self.name);
            return Ok(());
        }

        tracing::info!("Starting stack {}", self.name);

        let mut started: Vec<String> = Vec::new();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut first_failure: Option<StackError> = None;

        for name in &order {
            let Some(service) = definition.service(name) else {
                continue;
            };

            if let Some(dep) = service.depends_on.iter().find(|d| blocked.contains(*d)) {
                tracing::warn!("Skipping service {}: dependency {} did not start", name, dep);
                blocked.insert(name.clone());
                continue;
            }

            if health.get(name) == Some(&ServiceHealth::Healthy) {
                tracing::debug!("Service {} is already healthy", name);
                continue;
            }

            let outcome = self
                .runtime
                .bring_up(&call, std::slice::from_ref(name))
                .await?
                .into_iter()
                .find(|o| &o.service == name);

            let result = match outcome {
                Some(outcome) if !outcome.is_ok() => Err(StackError::StartupFailed {
                    service: name.clone(),
                    reason: outcome.error.unwrap_or_default(),
                }),
                None => Err(StackError::StartupFailed {
                    service: name.clone(),
                    reason: "runtime did not report a result".to_string(),
                }),
                Some(_) => {
                    started.push(name.clone());
                    self.wait_healthy(&call, name).await
                }
            };

            match result {
                Ok(()) => tracing::info!("Service {} is healthy", name),
                Err(StackError::Cancelled) => return Err(StackError::Cancelled),
                Err(e) => {
                    tracing::warn!("{}", e);
                    blocked.insert(name.clone());
                    first_failure.get_or_insert(e);
                }
            }
        }

        let Some(failure) = first_failure else {
            tracing::info!("Stack {} is running", self.name);
            return Ok(());
        };

        match self.ctx.settings().startup_failure {
            StartupFailurePolicy::LeaveRunning => {
                if !started.is_empty() {
                    tracing::warn!(
                        "Leaving started services running for inspection: {}",
                        started.join(", ")
                    );
                }
            }
            StartupFailurePolicy::RollBack => {
                started.reverse();
                tracing::warn!("Rolling back started services: {}", started.join(", "));
                match self
                    .runtime
                    .bring_down(&call, &started, self.ctx.settings().stop_timeout())
                    .await
                {
                    Ok(outcomes) => {
                        for outcome in outcomes.iter().filter(|o| !o.is_ok()) {
                            tracing::warn!(
                                "Rollback of {} failed: {}",
                                outcome.service,
                                outcome.error.as_deref().unwrap_or_default()
                            );
                        }
                    }
                    Err(e) => tracing::warn!("Rollback of stack {} failed: {}", self.name, e),
                }
            }
        }

        Err(failure)
    }

    /// Poll until `service` reports healthy or the health timeout expires
    async fn wait_healthy(&self, call: &RuntimeCall<'_>, service: &str) -> Result<()> {
        let settings = self.ctx.settings();
        let deadline = Instant::now() + settings.health_timeout();
        let names = [service.to_string()];

        loop {
            let health = self.runtime.service_health(call, &names).await?;
            let current = health.get(service).copied().unwrap_or(ServiceHealth::Missing);
            if current == ServiceHealth::Healthy {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(StackError::StartupFailed {
                    service: service.to_string(),
                    reason: format!(
                        "not healthy after {}s (last state: {})",
                        settings.health_timeout_secs, current
                    ),
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(settings.poll_interval()) => {}
                _ = call.cancel.cancelled() => return Err(StackError::Cancelled),
            }
        }
    }

    /// `Running | Degraded -> Stopped`: best-effort shutdown.
    ///
    /// Every service gets a stop request even if an earlier one fails;
    /// failures are collected into `StopFailed`. Stopping a stopped stack
    /// is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let (capability, definition) = self.prepare()?;
        let dir = self.store.stack_dir(&self.name);
        let call = self.call(&capability, &definition, &dir);

        let order = topology::stop_order(&definition.services)?;
        if order.is_empty() {
            return Ok(());
        }

        let health = self.runtime.service_health(&call, &order).await?;
        if derive_state(&order, &health) == StackState::Stopped {
            tracing::info!("Stack {} is already stopped", self.name);
            return Ok(());
        }

        tracing::info!("Stopping stack {}", self.name);

        let outcomes = self
            .runtime
            .bring_down(&call, &order, self.ctx.settings().stop_timeout())
            .await?;

        let mut failed: Vec<String> = Vec::new();
        for outcome in &outcomes {
            if let Some(error) = &outcome.error {
                tracing::warn!("Service {} did not stop: {}", outcome.service, error);
                failed.push(outcome.service.clone());
            }
        }

        // Confirm against live state
        let after = self.runtime.service_health(&call, &order).await?;
        for name in &order {
            let up = after.get(name).is_some_and(|h| h.is_up());
            if up && !failed.contains(name) {
                tracing::warn!("Service {} is still running after stop", name);
                failed.push(name.clone());
            }
        }

        if failed.is_empty() {
            tracing::info!("Stack {} stopped", self.name);
            Ok(())
        } else {
            Err(StackError::StopFailed { services: failed })
        }
    }
}
