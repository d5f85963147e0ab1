//! Supervision of backend server instances and the gateway process.
//!
//! Spawns detached children, tracks them through PID files, probes
//! liveness, and walks the graceful-then-forced termination ladder.
//! PID files are the only state shared across invocations: whoever reads
//! a PID file later is entitled to act on the process it names.

use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::Instant;

use crate::config::InstanceDescriptor;

/// Name reserved for the gateway's process record and PID file.
pub const GATEWAY_NAME: &str = "gateway";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const FORCE_KILL_WAIT: Duration = Duration::from_secs(1);
const GATEWAY_PID_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SpawnError {
    /// The executable could not be launched.
    #[error("failed to launch {name}: {source}")]
    Launch { name: String, source: io::Error },

    /// The instance log file could not be opened.
    #[error("failed to open log file {}: {source}", .path.display())]
    LogFile { path: PathBuf, source: io::Error },

    /// The PID file could not be written after a successful spawn. The
    /// just-spawned child is killed before this is surfaced so no process
    /// is left untracked.
    #[error("failed to write pid file {}: {source}", .path.display())]
    PidFile { path: PathBuf, source: io::Error },

    /// The gateway never wrote its PID file.
    #[error("gateway did not write {} within {timeout:?}", .path.display())]
    GatewayPid { path: PathBuf, timeout: Duration },
}

/// A process this manager launched or recovered from a PID file.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    /// `{server_name}-{k}` for instances, [`GATEWAY_NAME`] for the gateway.
    pub name: String,
    pub pid: i32,
    /// Bound TCP port; `None` for the gateway (it binds its own port) and
    /// for records recovered from PID files.
    pub port: Option<u16>,
    /// Spawn time; `None` for recovered records.
    pub started_at: Option<Instant>,
    /// `None` for recovered records.
    pub log_path: Option<PathBuf>,
    pub pid_path: PathBuf,
}

impl ProcessRecord {
    pub fn is_gateway(&self) -> bool {
        self.name == GATEWAY_NAME
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Exited within the grace period.
    ExitedGracefully,
    /// Needed SIGKILL.
    ExitedAfterForce,
    /// Survived even SIGKILL (usually an unreachable or zombie-wedged pid).
    StillAlive,
}

/// Launches one server instance, detached from the manager's session.
///
/// stdout/stderr go to `{log_dir}/{name}.log` (truncated per launch), the
/// enabled modules and instance name travel via environment, the bind port
/// via argument. The PID file is written before this returns.
pub async fn spawn_server(
    instance: &InstanceDescriptor,
    server_bin: &Path,
    pid_dir: &Path,
    log_dir: &Path,
) -> Result<ProcessRecord, SpawnError> {
    let log_path = log_dir.join(format!("{}.log", instance.name));
    let log_file = tokio::fs::File::create(&log_path)
        .await
        .map_err(|source| SpawnError::LogFile {
            path: log_path.clone(),
            source,
        })?
        .into_std()
        .await;
    let log_for_stderr = log_file.try_clone().map_err(|source| SpawnError::LogFile {
        path: log_path.clone(),
        source,
    })?;

    let mut cmd = std::process::Command::new(server_bin);
    cmd.arg("--port")
        .arg(instance.port.to_string())
        .arg("--log-file")
        .arg(&log_path)
        .env("ENABLED_MODULES", instance.modules.join(","))
        .env("SERVER_INSTANCE_NAME", &instance.name)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_for_stderr));
    if instance.reload {
        cmd.arg("--reload");
    }
    unsafe {
        // Detach into a new session so the instance survives the manager.
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = Command::from(cmd).spawn().map_err(|source| SpawnError::Launch {
        name: instance.name.clone(),
        source,
    })?;
    let pid = child.id().map(|p| p as i32).ok_or_else(|| SpawnError::Launch {
        name: instance.name.clone(),
        source: io::Error::new(io::ErrorKind::Other, "child exited before its pid was read"),
    })?;

    let pid_path = pid_dir.join(format!("{}.pid", instance.name));
    if let Err(source) = tokio::fs::write(&pid_path, pid.to_string()).await {
        // An untracked process would leak past every later `stop`.
        send_signal(pid, libc::SIGKILL);
        return Err(SpawnError::PidFile {
            path: pid_path,
            source,
        });
    }

    log::info!(instance = instance.name.as_str(), pid = pid; "instance started");
    Ok(ProcessRecord {
        name: instance.name.clone(),
        pid,
        port: Some(instance.port),
        started_at: Some(Instant::now()),
        log_path: Some(log_path),
        pid_path,
    })
}

/// Launches the gateway with the rendered config.
///
/// The immediate child is a short-lived launcher that exits once the
/// gateway has daemonized; the authoritative PID comes from the PID file
/// the gateway itself writes at `pid_path`.
pub async fn spawn_gateway(
    gateway_bin: &Path,
    config_path: &Path,
    pid_path: &Path,
) -> Result<ProcessRecord, SpawnError> {
    // A leftover PID file would race the freshly written one.
    if let Err(err) = tokio::fs::remove_file(pid_path).await {
        if err.kind() != io::ErrorKind::NotFound {
            return Err(SpawnError::PidFile {
                path: pid_path.to_path_buf(),
                source: err,
            });
        }
    }

    let output = Command::new(gateway_bin)
        .arg("-c")
        .arg(config_path)
        .output()
        .await
        .map_err(|source| SpawnError::Launch {
            name: GATEWAY_NAME.to_string(),
            source,
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(SpawnError::Launch {
            name: GATEWAY_NAME.to_string(),
            source: io::Error::new(io::ErrorKind::Other, stderr),
        });
    }

    let pid = wait_for_pid_file(pid_path, GATEWAY_PID_WAIT).await?;
    log::info!(pid = pid; "gateway started");
    Ok(ProcessRecord {
        name: GATEWAY_NAME.to_string(),
        pid,
        port: None,
        started_at: Some(Instant::now()),
        log_path: None,
        pid_path: pid_path.to_path_buf(),
    })
}

async fn wait_for_pid_file(path: &Path, timeout: Duration) -> Result<i32, SpawnError> {
    let start = Instant::now();
    loop {
        if let Ok(raw) = tokio::fs::read_to_string(path).await {
            if let Ok(pid) = raw.trim().parse::<i32>() {
                if pid > 0 {
                    return Ok(pid);
                }
            }
        }
        if start.elapsed() >= timeout {
            return Err(SpawnError::GatewayPid {
                path: path.to_path_buf(),
                timeout,
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Zero-signal liveness probe. EPERM means the process exists but belongs
/// to someone else, which still counts as alive.
pub fn is_alive(pid: i32) -> bool {
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Terminates a supervised process: graceful signal, poll for exit, then
/// SIGKILL on timeout. The PID file is deleted only after a confirmed exit;
/// its deletion is the marker of successful teardown.
pub async fn terminate(record: &ProcessRecord, timeout: Duration) -> TerminateOutcome {
    // The gateway treats SIGQUIT as "finish in-flight requests and exit";
    // server instances get the conventional SIGTERM.
    let signal = if record.is_gateway() {
        libc::SIGQUIT
    } else {
        libc::SIGTERM
    };

    send_signal(record.pid, signal);
    if wait_for_exit(record.pid, timeout).await {
        remove_pid_file(record);
        return TerminateOutcome::ExitedGracefully;
    }

    log::warn!(instance = record.name.as_str(), pid = record.pid; "grace period elapsed, force killing");
    send_signal(record.pid, libc::SIGKILL);
    if wait_for_exit(record.pid, FORCE_KILL_WAIT).await {
        remove_pid_file(record);
        return TerminateOutcome::ExitedAfterForce;
    }

    TerminateOutcome::StillAlive
}

/// Reads every `*.pid` file in `pid_dir` into records, sorted by name.
/// A missing directory reads as an empty fleet; malformed files are
/// skipped with a warning.
pub fn read_pid_files(pid_dir: &Path) -> io::Result<Vec<ProcessRecord>> {
    let entries = match std::fs::read_dir(pid_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut records = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("pid") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let raw = std::fs::read_to_string(&path)?;
        let Ok(pid) = raw.trim().parse::<i32>() else {
            log::warn!(name = stem; "ignoring malformed pid file");
            continue;
        };
        records.push(ProcessRecord {
            name: stem.to_string(),
            pid,
            port: None,
            started_at: None,
            log_path: None,
            pid_path: path,
        });
    }
    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}

async fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if !is_alive(pid) {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn send_signal(pid: i32, signal: i32) {
    unsafe {
        libc::kill(pid, signal);
    }
}

fn remove_pid_file(record: &ProcessRecord) {
    if let Err(err) = std::fs::remove_file(&record.pid_path) {
        if err.kind() != io::ErrorKind::NotFound {
            log::warn!(instance = record.name.as_str(); "failed to remove pid file: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn record_for(pid: i32, pid_path: PathBuf) -> ProcessRecord {
        ProcessRecord {
            name: "svc-a-0".to_string(),
            pid,
            port: None,
            started_at: None,
            log_path: None,
            pid_path,
        }
    }

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id() as i32));
    }

    #[test]
    fn read_pid_files_handles_missing_dir_and_noise() {
        let dir = tempfile::tempdir().unwrap();
        let pid_dir = dir.path().join("pids");
        assert!(read_pid_files(&pid_dir).unwrap().is_empty());

        std::fs::create_dir(&pid_dir).unwrap();
        std::fs::write(pid_dir.join("svc-a-0.pid"), "123").unwrap();
        std::fs::write(pid_dir.join("gateway.pid"), "77\n").unwrap();
        std::fs::write(pid_dir.join("garbage.pid"), "not-a-pid").unwrap();
        std::fs::write(pid_dir.join("notes.txt"), "999").unwrap();

        let records = read_pid_files(&pid_dir).unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["gateway", "svc-a-0"]);
        assert_eq!(records[0].pid, 77);
        assert!(records[0].is_gateway());
        assert_eq!(records[1].pid, 123);
    }

    #[tokio::test]
    async fn terminate_reaps_a_cooperative_process() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("svc-a-0.pid");

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap() as i32;
        std::fs::write(&pid_path, pid.to_string()).unwrap();
        let record = record_for(pid, pid_path.clone());

        // Drive the child's wait concurrently so the exit is reaped and the
        // zero-signal probe observes it.
        let (outcome, _) = tokio::join!(terminate(&record, Duration::from_secs(3)), child.wait());
        assert_eq!(outcome, TerminateOutcome::ExitedGracefully);
        assert!(!pid_path.exists());
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn terminate_of_a_dead_pid_is_graceful_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("svc-a-0.pid");

        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap() as i32;
        child.wait().await.unwrap();
        std::fs::write(&pid_path, pid.to_string()).unwrap();

        let record = record_for(pid, pid_path.clone());
        let outcome = terminate(&record, Duration::from_millis(200)).await;
        assert_eq!(outcome, TerminateOutcome::ExitedGracefully);
        assert!(!pid_path.exists());
    }

    /// Writes an executable stub that ignores the server-shaped arguments
    /// and just stays alive.
    fn write_stub(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt as _;
        let path = dir.join("stub-server");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn spawn_server_writes_pid_and_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let pid_dir = dir.path().join("pids");
        let log_dir = dir.path().join("logs");
        std::fs::create_dir_all(&pid_dir).unwrap();
        std::fs::create_dir_all(&log_dir).unwrap();
        let stub = write_stub(dir.path());

        let instance = InstanceDescriptor {
            name: "svc-a-0".to_string(),
            port: 1,
            modules: vec!["core".to_string()],
            reload: false,
        };
        let record = spawn_server(&instance, &stub, &pid_dir, &log_dir)
            .await
            .unwrap();

        assert!(record.pid > 0);
        assert_eq!(record.port, Some(1));
        let persisted = std::fs::read_to_string(pid_dir.join("svc-a-0.pid")).unwrap();
        assert_eq!(persisted.trim().parse::<i32>().unwrap(), record.pid);
        assert!(log_dir.join("svc-a-0.log").exists());

        let outcome = terminate(&record, Duration::from_secs(2)).await;
        assert_matches!(
            outcome,
            TerminateOutcome::ExitedGracefully | TerminateOutcome::ExitedAfterForce
        );
    }

    #[tokio::test]
    async fn spawn_server_with_missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let instance = InstanceDescriptor {
            name: "svc-a-0".to_string(),
            port: 1,
            modules: vec!["core".to_string()],
            reload: false,
        };
        let err = spawn_server(
            &instance,
            Path::new("/nonexistent/backend-server"),
            dir.path(),
            dir.path(),
        )
        .await
        .unwrap_err();
        assert_matches!(err, SpawnError::Launch { .. });
    }
}
