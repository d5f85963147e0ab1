//! Lifecycle orchestration: the `start`, `stop`, `status`, `restart` and
//! `gen-gateway-config` state machines.
//!
//! The orchestrator owns all sequencing. Phases are strict barriers: every
//! instance spawn completes before any health probe starts, all health
//! probes pass before the gateway is launched, and on teardown the gateway
//! goes first so it stops accepting traffic for instances about to die.
//! Within a phase, per-instance work runs in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, DeploymentConfig};
use crate::gateway::{self, GatewayError};
use crate::health::{self, Health};
use crate::ports;
use crate::supervisor::{self, ProcessRecord, SpawnError, TerminateOutcome, GATEWAY_NAME};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("pid file {} is in the way; run `stop` first or remove it", .0.display())]
    StalePid(PathBuf),

    #[error("directory {} is not usable: {1}", .0.display())]
    DirectoryUnwritable(PathBuf, std::io::Error),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("instance {0} did not become healthy in time")]
    HealthTimeout(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("gateway did not answer its health check")]
    GatewayHealth,

    #[error("still alive after stop: {}", .0.join(", "))]
    ResidualProcesses(Vec<String>),

    #[error("ports still bound after stop: {0:?}")]
    ResidualPorts(Vec<u16>),

    #[error("gateway rejected the rendered config: {0}")]
    GatewayConfigInvalid(#[source] GatewayError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManagerError {
    /// Stable CLI exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            ManagerError::Config(_) => 2,
            ManagerError::PortInUse(_) | ManagerError::StalePid(_) => 3,
            ManagerError::DirectoryUnwritable(..) | ManagerError::Spawn(_) => 4,
            ManagerError::HealthTimeout(_) => 5,
            ManagerError::Gateway(_) | ManagerError::GatewayHealth => 6,
            ManagerError::ResidualProcesses(_) => 7,
            ManagerError::ResidualPorts(_) => 8,
            ManagerError::GatewayConfigInvalid(_) => 11,
            ManagerError::Io(_) => 1,
        }
    }
}

/// What to do with PID files left behind by a previous invocation when a
/// new `start` begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalePidPolicy {
    /// Leave them; `stop` will still act on them.
    Ignore,
    /// Delete files naming dead processes; live ones are left for
    /// CHECK_PORTS to arbitrate.
    #[default]
    Reclaim,
    /// Refuse to start while any PID file exists.
    Block,
}

/// Everything the lifecycle commands need, threaded explicitly so tests
/// can substitute work roots, binaries and budgets without process-global
/// state.
#[derive(Debug, Clone)]
pub struct Context {
    /// Parent of `pids/`, `logs/` and the rendered gateway config.
    pub work_root: PathBuf,
    /// Executable launched for every server instance.
    pub server_bin: PathBuf,
    /// Reverse-proxy gateway executable.
    pub gateway_bin: PathBuf,
    pub health_attempts: usize,
    pub terminate_timeout: Duration,
    pub port_free_timeout: Duration,
    /// Whether CHECK_PORTS may evict foreign holders of configured ports.
    pub evict: bool,
    pub stale_pid_policy: StalePidPolicy,
    client: reqwest::Client,
}

impl Context {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            server_bin: PathBuf::from("backend-server"),
            gateway_bin: PathBuf::from("nginx"),
            health_attempts: health::DEFAULT_ATTEMPTS,
            terminate_timeout: Duration::from_secs(3),
            port_free_timeout: Duration::from_secs(2),
            evict: true,
            stale_pid_policy: StalePidPolicy::default(),
            client: reqwest::Client::new(),
        }
    }

    pub fn pid_dir(&self) -> PathBuf {
        self.work_root.join("pids")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.work_root.join("logs")
    }

    pub fn gateway_conf(&self) -> PathBuf {
        self.work_root.join("gateway.conf")
    }

    pub fn gateway_pid_path(&self) -> PathBuf {
        self.pid_dir().join(format!("{GATEWAY_NAME}.pid"))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Re-render the gateway config even if one already exists.
    pub generate_gateway: bool,
    /// Run the gateway's config check before launching anything.
    pub validate: bool,
}

/// The `start` state machine.
///
/// LOAD_CONFIG has already happened (the caller passes the loaded config).
/// Any failure after SPAWN_SERVERS rolls back every process spawned by
/// this invocation; processes from prior invocations are never touched.
pub async fn start(
    ctx: &Context,
    config: &DeploymentConfig,
    opts: &StartOptions,
) -> Result<(), ManagerError> {
    ensure_dirs(ctx)?;
    reclaim_stale_pids(ctx)?;

    // CHECK_PORTS
    let port_set = config.port_set();
    let busy: Vec<u16> = port_set
        .iter()
        .copied()
        .filter(|&port| ports::is_port_in_use(port))
        .collect();
    if !busy.is_empty() {
        if !ctx.evict {
            return Err(ManagerError::PortInUse(busy[0]));
        }
        log::warn!("ports {busy:?} are in use, evicting holders");
        let report = ports::force_evict(&busy).await;
        if let Some(&port) = report
            .still_occupied
            .first()
            .or_else(|| report.no_holder.first())
        {
            return Err(ManagerError::PortInUse(port));
        }
    }

    // RENDER_GATEWAY_CONFIG
    let conf_path = ctx.gateway_conf();
    let mut needs_render = opts.generate_gateway || !conf_path.exists();
    if !needs_render && opts.validate {
        needs_render = gateway::check(&ctx.gateway_bin, &conf_path).await.is_err();
    }
    if needs_render {
        let rendered = gateway::render(config, &ctx.gateway_pid_path(), &ctx.log_dir());
        gateway::write_config(&conf_path, &rendered)?;
        log::info!("gateway config rendered");
        if opts.validate {
            gateway::check(&ctx.gateway_bin, &conf_path).await?;
        }
    }

    // SPAWN_SERVERS
    let instances = config.instances();
    let pid_dir = ctx.pid_dir();
    let log_dir = ctx.log_dir();
    let results = join_all(
        instances
            .iter()
            .map(|instance| supervisor::spawn_server(instance, &ctx.server_bin, &pid_dir, &log_dir)),
    )
    .await;

    let mut spawned = Vec::new();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(record) => spawned.push(record),
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }
    if let Some(err) = first_error {
        log::error!("spawn failed, rolling back {} instance(s)", spawned.len());
        rollback(ctx, &spawned).await;
        return Err(err.into());
    }

    // WAIT_HEALTHY
    let checks = join_all(instances.iter().map(|instance| {
        let url = format!(
            "http://127.0.0.1:{}{}/{}/health",
            instance.port,
            config.api_prefix(),
            instance.health_module()
        );
        async move { health::wait_healthy(&ctx.client, &url, ctx.health_attempts).await }
    }))
    .await;
    if let Some(pos) = checks.iter().position(|healthy| !healthy) {
        let name = instances[pos].name.clone();
        log::error!(instance = name.as_str(); "never became healthy, rolling back");
        rollback(ctx, &spawned).await;
        return Err(ManagerError::HealthTimeout(name));
    }

    // SPAWN_GATEWAY
    let gateway_record =
        match supervisor::spawn_gateway(&ctx.gateway_bin, &conf_path, &ctx.gateway_pid_path()).await
        {
            Ok(record) => record,
            Err(err) => {
                log::error!("gateway spawn failed, rolling back");
                rollback(ctx, &spawned).await;
                return Err(err.into());
            }
        };

    // VALIDATE_GATEWAY: end-to-end probe through the gateway's own port.
    let url = gateway_health_url(config);
    if !health::wait_healthy(&ctx.client, &url, ctx.health_attempts).await {
        log::error!("gateway health check failed, rolling back");
        spawned.push(gateway_record);
        rollback(ctx, &spawned).await;
        return Err(ManagerError::GatewayHealth);
    }

    log::info!(
        "fleet ready: {} instance(s) behind 127.0.0.1:{}",
        instances.len(),
        config.gateway.port
    );
    Ok(())
}

/// The `stop` state machine. Acts on whatever PID files exist, independent
/// of which invocation created them. Idempotent: an empty PID directory is
/// a successful no-op.
pub async fn stop(
    ctx: &Context,
    config: &DeploymentConfig,
    timeout: Duration,
) -> Result<(), ManagerError> {
    let records = supervisor::read_pid_files(&ctx.pid_dir())?;
    if records.is_empty() {
        log::info!("nothing to stop");
        return Ok(());
    }

    // TERMINATE_GATEWAY before the servers it fronts.
    let (gateways, servers): (Vec<_>, Vec<_>) =
        records.into_iter().partition(ProcessRecord::is_gateway);
    let mut residual = Vec::new();
    for record in &gateways {
        if supervisor::terminate(record, timeout).await == TerminateOutcome::StillAlive {
            residual.push(record.name.clone());
        }
    }

    // TERMINATE_SERVERS in parallel.
    let outcomes = join_all(
        servers
            .iter()
            .map(|record| supervisor::terminate(record, timeout)),
    )
    .await;
    for (record, outcome) in servers.iter().zip(outcomes) {
        if outcome == TerminateOutcome::StillAlive {
            residual.push(record.name.clone());
        }
    }

    // WAIT_PORTS_FREE
    let port_set = config.port_set();
    let waits = join_all(
        port_set
            .iter()
            .map(|&port| ports::wait_for_port_free(port, ctx.port_free_timeout)),
    )
    .await;
    let lingering: Vec<u16> = port_set
        .iter()
        .zip(waits)
        .filter_map(|(&port, free)| (!free).then_some(port))
        .collect();

    // FORCE_EVICT_IF_NEEDED
    let mut still_occupied = Vec::new();
    if !lingering.is_empty() {
        let report = ports::force_evict(&lingering).await;
        if !report.no_holder.is_empty() {
            // A bound port with no live owner is a draining socket; it
            // releases on its own.
            log::warn!(
                "ports still bound but with no identifiable holder: {:?}",
                report.no_holder
            );
        }
        still_occupied = report.still_occupied;
    }

    if !residual.is_empty() {
        return Err(ManagerError::ResidualProcesses(residual));
    }
    if !still_occupied.is_empty() {
        return Err(ManagerError::ResidualPorts(still_occupied));
    }
    log::info!("fleet stopped");
    Ok(())
}

/// Per-process line of a [`StatusReport`].
#[derive(Debug, Clone)]
pub struct StatusEntry {
    pub name: String,
    /// `None` when no PID file exists for an expected process.
    pub pid: Option<i32>,
    pub alive: bool,
    /// Probed only for live processes.
    pub health: Option<Health>,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub entries: Vec<StatusEntry>,
}

impl StatusReport {
    /// 0 = everything healthy, 9 = degraded, 10 = nothing running.
    pub fn exit_code(&self) -> i32 {
        if !self.entries.iter().any(|entry| entry.alive) {
            return 10;
        }
        let all_healthy = self
            .entries
            .iter()
            .all(|entry| entry.alive && entry.health == Some(Health::Healthy));
        if all_healthy {
            0
        } else {
            9
        }
    }
}

/// The `status` command. Read-only: never mutates PID files or processes.
pub async fn status(
    ctx: &Context,
    config: &DeploymentConfig,
) -> Result<StatusReport, ManagerError> {
    let records = supervisor::read_pid_files(&ctx.pid_dir())?;
    let by_name: HashMap<String, ProcessRecord> = records
        .into_iter()
        .map(|record| (record.name.clone(), record))
        .collect();

    let mut entries = Vec::new();
    let mut probes = Vec::new();

    for instance in config.instances() {
        let pid = by_name.get(&instance.name).map(|record| record.pid);
        let alive = pid.is_some_and(supervisor::is_alive);
        if alive {
            let url = format!(
                "http://127.0.0.1:{}{}/{}/health",
                instance.port,
                config.api_prefix(),
                instance.health_module()
            );
            probes.push((entries.len(), url));
        }
        entries.push(StatusEntry {
            name: instance.name,
            pid,
            alive,
            health: None,
        });
    }

    let pid = by_name.get(GATEWAY_NAME).map(|record| record.pid);
    let alive = pid.is_some_and(supervisor::is_alive);
    if alive {
        probes.push((entries.len(), gateway_health_url(config)));
    }
    entries.push(StatusEntry {
        name: GATEWAY_NAME.to_string(),
        pid,
        alive,
        health: None,
    });

    let results = join_all(probes.iter().map(|(_, url)| health::probe(&ctx.client, url))).await;
    for ((index, _), health) in probes.iter().zip(results) {
        entries[*index].health = Some(health);
    }

    Ok(StatusReport { entries })
}

/// The `restart` command: `stop` then `start` against one loaded config.
pub async fn restart(
    ctx: &Context,
    config: &DeploymentConfig,
    opts: &StartOptions,
    stop_timeout: Duration,
) -> Result<(), ManagerError> {
    stop(ctx, config, stop_timeout).await?;
    start(ctx, config, opts).await
}

/// The `gen-gateway-config` command: render (always written, even when
/// validation later fails), optionally validate. Never touches processes.
pub async fn gen_gateway_config(
    ctx: &Context,
    config: &DeploymentConfig,
    output: &Path,
    validate: bool,
) -> Result<(), ManagerError> {
    let rendered = gateway::render(config, &ctx.gateway_pid_path(), &ctx.log_dir());
    gateway::write_config(output, &rendered)?;
    log::info!("gateway config written to {}", output.display());
    if validate {
        gateway::check(&ctx.gateway_bin, output)
            .await
            .map_err(ManagerError::GatewayConfigInvalid)?;
    }
    Ok(())
}

/// Foreground mode: blocks until SIGINT/SIGTERM, then runs the stop
/// machine. A second signal during shutdown abandons the graceful path and
/// force-kills immediately.
pub async fn run_foreground(
    ctx: &Context,
    config: &DeploymentConfig,
    stop_timeout: Duration,
) -> Result<(), ManagerError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    log::info!("shutdown signal received, stopping fleet");

    let escalate = CancellationToken::new();
    let watcher = {
        let escalate = escalate.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = sigint.recv() => {}
            }
            escalate.cancel();
        })
    };

    let result = tokio::select! {
        result = stop(ctx, config, stop_timeout) => result,
        _ = escalate.cancelled() => {
            log::warn!("second signal received, force killing");
            stop(ctx, config, Duration::ZERO).await
        }
    };
    watcher.abort();
    result
}

/// Terminates every record spawned by the current invocation, in parallel.
async fn rollback(ctx: &Context, records: &[ProcessRecord]) {
    join_all(
        records
            .iter()
            .map(|record| supervisor::terminate(record, ctx.terminate_timeout)),
    )
    .await;
}

fn ensure_dirs(ctx: &Context) -> Result<(), ManagerError> {
    for dir in [ctx.pid_dir(), ctx.log_dir()] {
        std::fs::create_dir_all(&dir)
            .map_err(|err| ManagerError::DirectoryUnwritable(dir.clone(), err))?;
    }
    Ok(())
}

fn reclaim_stale_pids(ctx: &Context) -> Result<(), ManagerError> {
    let records = supervisor::read_pid_files(&ctx.pid_dir())?;
    for record in records {
        match ctx.stale_pid_policy {
            StalePidPolicy::Ignore => {}
            StalePidPolicy::Block => return Err(ManagerError::StalePid(record.pid_path)),
            StalePidPolicy::Reclaim => {
                if supervisor::is_alive(record.pid) {
                    // A live holdover owns its port; CHECK_PORTS arbitrates.
                    log::warn!(
                        instance = record.name.as_str(),
                        pid = record.pid;
                        "pid file from a previous invocation names a live process"
                    );
                } else {
                    log::info!(instance = record.name.as_str(); "reclaiming stale pid file");
                    std::fs::remove_file(&record.pid_path)?;
                }
            }
        }
    }
    Ok(())
}

fn gateway_health_url(config: &DeploymentConfig) -> String {
    format!(
        "http://127.0.0.1:{}{}/{}/health",
        config.gateway.port,
        config.api_prefix(),
        config.gateway_health_module()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::Health;

    fn config(yaml: &str) -> DeploymentConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    const BASIC: &str = r#"
gateway:
  port: 48200
servers:
  svc-a:
    port: 48201
    instances: 1
    modules: [core]
websocket:
  routing_strategy: path
"#;

    fn entry(name: &str, alive: bool, health: Option<Health>) -> StatusEntry {
        StatusEntry {
            name: name.to_string(),
            pid: alive.then_some(1),
            alive,
            health,
        }
    }

    #[test]
    fn status_exit_codes() {
        let report = StatusReport { entries: vec![] };
        assert_eq!(report.exit_code(), 10);

        let report = StatusReport {
            entries: vec![
                entry("svc-a-0", false, None),
                entry(GATEWAY_NAME, false, None),
            ],
        };
        assert_eq!(report.exit_code(), 10);

        let report = StatusReport {
            entries: vec![
                entry("svc-a-0", true, Some(Health::Healthy)),
                entry(GATEWAY_NAME, true, Some(Health::Healthy)),
            ],
        };
        assert_eq!(report.exit_code(), 0);

        let report = StatusReport {
            entries: vec![
                entry("svc-a-0", true, Some(Health::Unreachable)),
                entry(GATEWAY_NAME, true, Some(Health::Healthy)),
            ],
        };
        assert_eq!(report.exit_code(), 9);

        let report = StatusReport {
            entries: vec![
                entry("svc-a-0", true, Some(Health::Healthy)),
                entry(GATEWAY_NAME, false, None),
            ],
        };
        assert_eq!(report.exit_code(), 9);
    }

    #[tokio::test]
    async fn stop_on_empty_pid_dir_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(dir.path());
        stop(&ctx, &config(BASIC), Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn status_without_pid_files_reports_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(dir.path());
        let report = status(&ctx, &config(BASIC)).await.unwrap();
        assert_eq!(report.exit_code(), 10);
        // One line per expected instance plus the gateway.
        assert_eq!(report.entries.len(), 2);
        assert!(report.entries.iter().all(|e| e.pid.is_none() && !e.alive));
    }

    #[tokio::test]
    async fn gen_gateway_config_is_pure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(dir.path());
        let config = config(BASIC);
        let output = dir.path().join("gateway.conf");

        gen_gateway_config(&ctx, &config, &output, false)
            .await
            .unwrap();
        let first = std::fs::read(&output).unwrap();
        gen_gateway_config(&ctx, &config, &output, false)
            .await
            .unwrap();
        let second = std::fs::read(&output).unwrap();
        assert_eq!(first, second);

        // No other filesystem changes: in particular no pids/ or logs/.
        assert!(!ctx.pid_dir().exists());
        assert!(!ctx.log_dir().exists());
    }

    #[tokio::test]
    async fn start_with_busy_port_and_eviction_disabled_aborts_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = Context::new(dir.path());
        ctx.evict = false;

        let config = config(BASIC);
        let listener = std::net::TcpListener::bind(("127.0.0.1", 48201)).unwrap();
        let err = start(&ctx, &config, &StartOptions::default())
            .await
            .unwrap_err();
        drop(listener);

        assert_eq!(err.exit_code(), 3);
        let leftover = supervisor::read_pid_files(&ctx.pid_dir()).unwrap();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn blocked_stale_pid_policy_refuses_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = Context::new(dir.path());
        ctx.stale_pid_policy = StalePidPolicy::Block;
        std::fs::create_dir_all(ctx.pid_dir()).unwrap();
        std::fs::write(ctx.pid_dir().join("svc-a-0.pid"), "999999").unwrap();

        let err = start(&ctx, &config(BASIC), &StartOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(ctx.pid_dir().join("svc-a-0.pid").exists());
    }

    #[tokio::test]
    async fn reclaim_policy_removes_dead_pid_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = Context::new(dir.path());
        ctx.evict = false;
        std::fs::create_dir_all(ctx.pid_dir()).unwrap();
        // PID far above any default pid_max, so it names nothing.
        std::fs::write(ctx.pid_dir().join("svc-a-0.pid"), "9999999").unwrap();

        // Force an abort right after the reclaim step with a busy port.
        let config = config(&BASIC.replace("48200", "48210").replace("48201", "48211"));
        let listener = std::net::TcpListener::bind(("127.0.0.1", 48211)).unwrap();
        let err = start(&ctx, &config, &StartOptions::default())
            .await
            .unwrap_err();
        drop(listener);

        assert_eq!(err.exit_code(), 3);
        assert!(!ctx.pid_dir().join("svc-a-0.pid").exists());
    }
}
