//! In-memory runtime for tests

use super::{
    Dialect, OrchestrationRuntime, RuntimeCall, RuntimeCapability, RuntimeVersion, ServiceHealth,
    ServiceOutcome, Version,
};
use crate::config::Settings;
use crate::context::ExecutionContext;
use crate::error::{Result, StackError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct FakeState {
    version: Option<RuntimeVersion>,
    probes: usize,
    health: BTreeMap<String, ServiceHealth>,
    polls_until_healthy: HashMap<String, usize>,
    never_healthy: HashSet<String>,
    reject_start: HashSet<String>,
    hang_on_stop: HashSet<String>,
    bring_down_error: Option<String>,
    started: Vec<String>,
    stopped: Vec<String>,
    violations: Vec<String>,
    exec_output: Option<std::result::Result<String, String>>,
    exec_calls: Vec<(String, Vec<String>)>,
    exec_hook: Option<Box<dyn Fn() + Send>>,
}

/// Scripted runtime that records every request
pub(crate) struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub(crate) fn new() -> Self {
        let state = FakeState {
            version: Some(RuntimeVersion {
                dialect: Dialect::Integrated,
                raw: "2.24.6".to_string(),
            }),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub(crate) fn set_version(&self, version: Option<RuntimeVersion>) {
        self.with(|s| s.version = version);
    }

    pub(crate) fn probe_count(&self) -> usize {
        self.with(|s| s.probes)
    }

    /// Service reports `Starting` for `polls` health queries after start
    pub(crate) fn healthy_after_polls(&self, service: &str, polls: usize) {
        self.with(|s| s.polls_until_healthy.insert(service.to_string(), polls));
    }

    pub(crate) fn never_healthy(&self, service: &str) {
        self.with(|s| s.never_healthy.insert(service.to_string()));
    }

    pub(crate) fn reject_start(&self, service: &str) {
        self.with(|s| s.reject_start.insert(service.to_string()));
    }

    pub(crate) fn hang_on_stop(&self, service: &str) {
        self.with(|s| s.hang_on_stop.insert(service.to_string()));
    }

    /// Every stop request fails as a whole
    pub(crate) fn fail_bring_down(&self, message: &str) {
        self.with(|s| s.bring_down_error = Some(message.to_string()));
    }

    pub(crate) fn set_health(&self, service: &str, health: ServiceHealth) {
        self.with(|s| s.health.insert(service.to_string(), health));
    }

    pub(crate) fn set_exec_output(&self, output: std::result::Result<&str, &str>) {
        self.with(|s| {
            s.exec_output = Some(output.map(str::to_string).map_err(str::to_string))
        });
    }

    /// Run `hook` while serving each exec request
    pub(crate) fn on_exec(&self, hook: impl Fn() + Send + 'static) {
        self.with(|s| s.exec_hook = Some(Box::new(hook)));
    }

    /// Services that received a start request, in order
    pub(crate) fn started(&self) -> Vec<String> {
        self.with(|s| s.started.clone())
    }

    /// Services that stopped successfully, in order
    pub(crate) fn stopped(&self) -> Vec<String> {
        self.with(|s| s.stopped.clone())
    }

    /// Services started while a dependency was not healthy
    pub(crate) fn ordering_violations(&self) -> Vec<String> {
        self.with(|s| s.violations.clone())
    }

    pub(crate) fn exec_calls(&self) -> Vec<(String, Vec<String>)> {
        self.with(|s| s.exec_calls.clone())
    }

    pub(crate) fn health_of(&self, service: &str) -> ServiceHealth {
        self.with(|s| s.health.get(service).copied().unwrap_or(ServiceHealth::Missing))
    }
}

/// A context whose runtime capability is already attached
pub(crate) fn probed_context(settings: Settings) -> ExecutionContext {
    let ctx = ExecutionContext::new(settings);
    ctx.attach_capability(RuntimeCapability::new(
        Dialect::Integrated,
        Version::new(2, 24, 6),
    ));
    ctx
}

#[async_trait]
impl OrchestrationRuntime for FakeRuntime {
    async fn probe_version(&self) -> Result<RuntimeVersion> {
        self.with(|s| {
            s.probes += 1;
            s.version
                .clone()
                .ok_or_else(|| StackError::RuntimeUnavailable("fake runtime is offline".to_string()))
        })
    }

    async fn bring_up(
        &self,
        call: &RuntimeCall<'_>,
        services: &[String],
    ) -> Result<Vec<ServiceOutcome>> {
        call.cancel.check()?;
        self.with(|s| {
            let mut outcomes = Vec::new();
            for name in services {
                if s.reject_start.contains(name) {
                    outcomes.push(ServiceOutcome::failed(name, "image pull failed"));
                    continue;
                }

                if let Some(spec) = call.definition.service(name) {
                    for dep in &spec.depends_on {
                        if s.health.get(dep) != Some(&ServiceHealth::Healthy) {
                            s.violations.push(format!("{} started before {}", name, dep));
                        }
                    }
                }

                s.started.push(name.clone());
                let pending = s.polls_until_healthy.get(name).copied().unwrap_or(0);
                let health = if s.never_healthy.contains(name) || pending > 0 {
                    ServiceHealth::Starting
                } else {
                    ServiceHealth::Healthy
                };
                s.health.insert(name.clone(), health);
                outcomes.push(ServiceOutcome::ok(name));
            }
            Ok(outcomes)
        })
    }

    async fn bring_down(
        &self,
        call: &RuntimeCall<'_>,
        services: &[String],
        _timeout: Duration,
    ) -> Result<Vec<ServiceOutcome>> {
        call.cancel.check()?;
        self.with(|s| {
            if let Some(message) = &s.bring_down_error {
                return Err(StackError::Runtime(message.clone()));
            }
            let mut outcomes = Vec::new();
            for name in services {
                if s.hang_on_stop.contains(name) {
                    outcomes.push(ServiceOutcome::failed(name, "timed out waiting for stop"));
                    continue;
                }
                if s.health.get(name).is_some_and(|h| h.is_up()) {
                    s.stopped.push(name.clone());
                    s.health.insert(name.clone(), ServiceHealth::Stopped);
                }
                outcomes.push(ServiceOutcome::ok(name));
            }
            Ok(outcomes)
        })
    }

    async fn service_health(
        &self,
        _call: &RuntimeCall<'_>,
        services: &[String],
    ) -> Result<BTreeMap<String, ServiceHealth>> {
        self.with(|s| {
            let mut result = BTreeMap::new();
            for name in services {
                let mut health = s.health.get(name).copied().unwrap_or(ServiceHealth::Missing);
                if health == ServiceHealth::Starting && !s.never_healthy.contains(name) {
                    let pending = s.polls_until_healthy.entry(name.clone()).or_insert(0);
                    if *pending > 0 {
                        *pending -= 1;
                    }
                    if *pending == 0 {
                        health = ServiceHealth::Healthy;
                        s.health.insert(name.clone(), health);
                    }
                }
                result.insert(name.clone(), health);
            }
            Ok(result)
        })
    }

    async fn exec(
        &self,
        call: &RuntimeCall<'_>,
        service: &str,
        command: &[String],
        _timeout: Duration,
    ) -> Result<String> {
        call.cancel.check()?;
        self.with(|s| {
            s.exec_calls.push((service.to_string(), command.to_vec()));
            if let Some(hook) = &s.exec_hook {
                hook();
            }
            match &s.exec_output {
                Some(Ok(stdout)) => Ok(stdout.clone()),
                Some(Err(stderr)) => Err(StackError::Runtime(stderr.clone())),
                None => Err(StackError::Runtime("no exec output scripted".to_string())),
            }
        })
    }

    fn name(&self) -> &str {
        "fake"
    }
}
