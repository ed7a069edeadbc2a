//! Docker Compose runtime
//!
//! Drives `docker compose` (integrated) or `docker-compose` (legacy)
//! through `tokio::process`. Each stack gets a generated
//! `docker-compose.yml` in its directory and uses the stack name as the
//! compose project name.

use super::{
    describe, Dialect, OrchestrationRuntime, RuntimeCall, RuntimeVersion, ServiceHealth,
    ServiceOutcome,
};
use crate::context::CancelSignal;
use crate::error::{Result, StackError};
use crate::stack::{ServiceSpec, StackDefinition};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Generated compose file name inside a stack directory
pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// Label carrying the stack name on every container
pub const STACK_LABEL: &str = "dev.devstack.stack";

/// Time allowed for version queries
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Time allowed for `up`/`ps` style invocations
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Grace period between SIGTERM and kill for an abandoned invocation
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Captured output of one invocation
#[derive(Debug)]
struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn into_stdout(self, what: &str) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(StackError::Runtime(format!("{} failed: {}", what, self.stderr.trim())))
        }
    }
}

/// Docker Compose backed runtime
#[derive(Debug, Clone)]
pub struct DockerCompose {
    /// `docker` binary
    docker_bin: PathBuf,
    /// Standalone `docker-compose` binary
    legacy_bin: PathBuf,
}

impl Default for DockerCompose {
    fn default() -> Self {
        Self {
            docker_bin: PathBuf::from("docker"),
            legacy_bin: PathBuf::from("docker-compose"),
        }
    }
}

impl DockerCompose {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use specific binaries instead of looking them up on `PATH`
    pub fn with_binaries(docker_bin: impl Into<PathBuf>, legacy_bin: impl Into<PathBuf>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            legacy_bin: legacy_bin.into(),
        }
    }

    /// Base compose command for the call's dialect, project and file
    fn compose_command(&self, call: &RuntimeCall<'_>) -> Command {
        let mut cmd = match call.capability.dialect {
            Dialect::Integrated => {
                let mut cmd = Command::new(&self.docker_bin);
                cmd.arg("compose");
                cmd
            }
            Dialect::Legacy => Command::new(&self.legacy_bin),
        };
        cmd.arg("--project-name")
            .arg(call.project())
            .arg("--file")
            .arg(call.directory.join(COMPOSE_FILE))
            .current_dir(call.directory);
        cmd
    }

    /// Write the compose file for the stack
    async fn write_compose_file(&self, call: &RuntimeCall<'_>) -> Result<()> {
        let content = render_compose_file(call.definition)?;
        let path = call.directory.join(COMPOSE_FILE);
        tokio::fs::create_dir_all(call.directory)
            .await
            .map_err(|e| StackError::persistence(call.directory, e))?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| StackError::persistence(&path, e))
    }

    async fn probe_dialect(&self, dialect: Dialect) -> Option<RuntimeVersion> {
        let mut cmd = match dialect {
            Dialect::Integrated => {
                let mut cmd = Command::new(&self.docker_bin);
                cmd.args(["compose", "version", "--short"]);
                cmd
            }
            Dialect::Legacy => {
                let mut cmd = Command::new(&self.legacy_bin);
                cmd.args(["version", "--short"]);
                cmd
            }
        };

        match run(&mut cmd, PROBE_TIMEOUT, &CancelSignal::never()).await {
            Ok(output) if output.success && !output.stdout.trim().is_empty() => Some(RuntimeVersion {
                dialect,
                raw: output.stdout.trim().to_string(),
            }),
            Ok(output) => {
                tracing::debug!("{} not usable: {}", dialect, output.stderr.trim());
                None
            }
            Err(e) => {
                tracing::debug!("{} not usable: {}", dialect, e);
                None
            }
        }
    }

    async fn legacy_health(&self, call: &RuntimeCall<'_>, service: &str) -> Result<ServiceHealth> {
        let mut cmd = self.compose_command(call);
        cmd.args(["ps", "-q", service]);
        let stdout = run(&mut cmd, COMMAND_TIMEOUT, call.cancel)
            .await?
            .into_stdout("ps")?;

        let Some(container) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
            return Ok(ServiceHealth::Missing);
        };

        let mut inspect = Command::new(&self.docker_bin);
        inspect.args([
            "inspect",
            "--format",
            "{{.State.Status}} {{if .State.Health}}{{.State.Health.Status}}{{end}}",
            container,
        ]);
        let stdout = run(&mut inspect, COMMAND_TIMEOUT, call.cancel)
            .await?
            .into_stdout("inspect")?;

        let mut parts = stdout.split_whitespace();
        let state = parts.next().unwrap_or_default();
        let health = parts.next().unwrap_or_default();
        Ok(health_from_state(state, health))
    }
}

#[async_trait]
impl OrchestrationRuntime for DockerCompose {
    async fn probe_version(&self) -> Result<RuntimeVersion> {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(["version", "--format", "{{.Server.Version}}"]);
        let server = run(&mut cmd, PROBE_TIMEOUT, &CancelSignal::never())
            .await
            .map_err(|e| StackError::RuntimeUnavailable(format!("docker is not installed: {}", describe(&e))))?;
        if !server.success {
            return Err(StackError::RuntimeUnavailable(format!(
                "docker daemon is not reachable: {}",
                server.stderr.trim()
            )));
        }
        tracing::debug!("Docker server version {}", server.stdout.trim());

        if let Some(version) = self.probe_dialect(Dialect::Integrated).await {
            return Ok(version);
        }
        if let Some(version) = self.probe_dialect(Dialect::Legacy).await {
            return Ok(version);
        }

        Err(StackError::RuntimeUnavailable(
            "neither 'docker compose' nor 'docker-compose' is installed".to_string(),
        ))
    }

    async fn bring_up(
        &self,
        call: &RuntimeCall<'_>,
        services: &[String],
    ) -> Result<Vec<ServiceOutcome>> {
        self.write_compose_file(call).await?;

        let mut outcomes = Vec::with_capacity(services.len());
        for service in services {
            let mut cmd = self.compose_command(call);
            cmd.args(["up", "--detach", "--no-deps", service.as_str()]);
            tracing::debug!("Starting service {} of {}", service, call.project());

            let outcome = match run(&mut cmd, COMMAND_TIMEOUT, call.cancel).await {
                Ok(output) if output.success => ServiceOutcome::ok(service),
                Ok(output) => ServiceOutcome::failed(service, output.stderr.trim()),
                Err(StackError::Cancelled) => return Err(StackError::Cancelled),
                Err(e) => ServiceOutcome::failed(service, describe(&e)),
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn bring_down(
        &self,
        call: &RuntimeCall<'_>,
        services: &[String],
        timeout: Duration,
    ) -> Result<Vec<ServiceOutcome>> {
        let mut outcomes = Vec::with_capacity(services.len());
        for service in services {
            let mut cmd = self.compose_command(call);
            let secs = timeout.as_secs().to_string();
            cmd.args(["stop", "--timeout", secs.as_str(), service.as_str()]);
            tracing::debug!("Stopping service {} of {}", service, call.project());

            // compose escalates to SIGKILL after the timeout; allow for that
            let limit = timeout + TERMINATE_GRACE * 2;
            let outcome = match run(&mut cmd, limit, call.cancel).await {
                Ok(output) if output.success => ServiceOutcome::ok(service),
                Ok(output) => ServiceOutcome::failed(service, output.stderr.trim()),
                Err(StackError::Cancelled) => return Err(StackError::Cancelled),
                Err(e) => ServiceOutcome::failed(service, describe(&e)),
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn service_health(
        &self,
        call: &RuntimeCall<'_>,
        services: &[String],
    ) -> Result<BTreeMap<String, ServiceHealth>> {
        // The project may have containers even when the file is gone
        self.write_compose_file(call).await?;

        match call.capability.dialect {
            Dialect::Integrated => {
                let mut cmd = self.compose_command(call);
                cmd.args(["ps", "--all", "--format", "json"]);
                let stdout = run(&mut cmd, COMMAND_TIMEOUT, call.cancel)
                    .await?
                    .into_stdout("ps")?;
                let live = parse_ps_output(&stdout);
                Ok(services
                    .iter()
                    .map(|s| (s.clone(), live.get(s).copied().unwrap_or(ServiceHealth::Missing)))
                    .collect())
            }
            Dialect::Legacy => {
                let mut result = BTreeMap::new();
                for service in services {
                    result.insert(service.clone(), self.legacy_health(call, service).await?);
                }
                Ok(result)
            }
        }
    }

    async fn exec(
        &self,
        call: &RuntimeCall<'_>,
        service: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<String> {
        let mut cmd = self.compose_command(call);
        cmd.args(["exec", "-T", service]).args(command);
        tracing::debug!("Executing {:?} in {}", command, service);

        run(&mut cmd, timeout, call.cancel)
            .await?
            .into_stdout(&format!("exec in '{}'", service))
    }

    fn name(&self) -> &str {
        "docker-compose"
    }
}

/// Spawn `cmd`, bounded by `timeout` and `cancel`.
///
/// On timeout or cancellation the child gets SIGTERM, a short grace
/// period, and is then killed.
async fn run(cmd: &mut Command, timeout: Duration, cancel: &CancelSignal) -> Result<CommandOutput> {
    cancel.check()?;

    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| StackError::Runtime(format!("failed to spawn {}: {}", program, e)))?;

    let pid = child.id();
    let output = child.wait_with_output();
    tokio::pin!(output);

    let interrupted = tokio::select! {
        result = &mut output => {
            let output = result.map_err(|e| StackError::Runtime(format!("failed to wait for command: {}", e)))?;
            return Ok(CommandOutput {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        _ = tokio::time::sleep(timeout) => StackError::Runtime(format!(
            "{} timed out after {}s",
            program,
            timeout.as_secs()
        )),
        _ = cancel.cancelled() => StackError::Cancelled,
    };

    terminate(pid);
    if tokio::time::timeout(TERMINATE_GRACE, &mut output).await.is_err() {
        tracing::warn!("Runtime command did not exit after SIGTERM, killing it");
    }
    Err(interrupted)
}

/// Ask a child process to terminate
#[cfg(unix)]
fn terminate(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    // SAFETY: plain signal delivery to a child we spawned
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        tracing::debug!(
            "SIGTERM to {} failed: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

/// Dropping the child kills it; there is no softer request to send
#[cfg(not(unix))]
fn terminate(_pid: Option<u32>) {}

/// Map container state and health strings to [`ServiceHealth`]
pub fn health_from_state(state: &str, health: &str) -> ServiceHealth {
    match state.to_ascii_lowercase().as_str() {
        "running" => match health.to_ascii_lowercase().as_str() {
            "" | "healthy" => ServiceHealth::Healthy,
            "starting" => ServiceHealth::Starting,
            _ => ServiceHealth::Unhealthy,
        },
        "restarting" => ServiceHealth::Unhealthy,
        "" => ServiceHealth::Missing,
        _ => ServiceHealth::Stopped,
    }
}

/// Parse `compose ps --format json`.
///
/// Newer compose versions print one object per line, older ones an array.
pub fn parse_ps_output(text: &str) -> BTreeMap<String, ServiceHealth> {
    let rows: Vec<serde_json::Value> = match serde_json::from_str(text.trim()) {
        Ok(serde_json::Value::Array(rows)) => rows,
        Ok(serde_json::Value::Null) => Vec::new(),
        Ok(row) => vec![row],
        Err(_) => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect(),
    };

    let mut result: BTreeMap<String, ServiceHealth> = BTreeMap::new();
    for row in rows {
        let field = |name: &str| row.get(name).and_then(|v| v.as_str()).unwrap_or_default();
        let service = field("Service");
        if service.is_empty() {
            continue;
        }
        let health = health_from_state(field("State"), field("Health"));
        // With several containers per service the least healthy one wins
        result
            .entry(service.to_string())
            .and_modify(|current| {
                if rank(health) < rank(*current) {
                    *current = health;
                }
            })
            .or_insert(health);
    }
    result
}

fn rank(health: ServiceHealth) -> u8 {
    match health {
        ServiceHealth::Missing => 0,
        ServiceHealth::Stopped => 1,
        ServiceHealth::Unhealthy => 2,
        ServiceHealth::Starting => 3,
        ServiceHealth::Healthy => 4,
    }
}

#[derive(Debug, Serialize)]
struct ComposeFile<'a> {
    services: BTreeMap<&'a str, ComposeService<'a>>,
}

#[derive(Debug, Serialize)]
struct ComposeService<'a> {
    image: &'a str,
    container_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'a [String]>,
    #[serde(skip_serializing_if = "is_empty")]
    ports: &'a [String],
    #[serde(skip_serializing_if = "is_empty")]
    depends_on: &'a [String],
    #[serde(skip_serializing_if = "is_empty")]
    volumes: &'a [String],
    #[serde(skip_serializing_if = "is_empty_map")]
    environment: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    healthcheck: Option<ComposeHealthcheck<'a>>,
    labels: BTreeMap<&'static str, &'a str>,
}

fn is_empty(items: &&[String]) -> bool {
    items.is_empty()
}

fn is_empty_map(map: &&BTreeMap<String, String>) -> bool {
    map.is_empty()
}

#[derive(Debug, Serialize)]
struct ComposeHealthcheck<'a> {
    test: &'a [String],
    interval: String,
    retries: u32,
}

impl<'a> ComposeService<'a> {
    fn from_spec(stack: &'a str, spec: &'a ServiceSpec) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(STACK_LABEL, stack);

        Self {
            image: &spec.image,
            container_name: format!("{}_{}", stack, spec.name),
            command: spec.command.as_deref(),
            ports: &spec.ports,
            depends_on: &spec.depends_on,
            volumes: &spec.volumes,
            environment: &spec.environment,
            healthcheck: spec.healthcheck.as_ref().map(|h| ComposeHealthcheck {
                test: &h.test,
                interval: format!("{}s", h.interval_secs),
                retries: h.retries,
            }),
            labels,
        }
    }
}

/// Render the compose file for a stack definition
pub fn render_compose_file(definition: &StackDefinition) -> Result<String> {
    let file = ComposeFile {
        services: definition
            .services
            .iter()
            .map(|s| (s.name.as_str(), ComposeService::from_spec(&definition.name, s)))
            .collect(),
    };
    serde_yaml::to_string(&file)
        .map_err(|e| StackError::Runtime(format!("failed to render compose file: {}", e)))
}
