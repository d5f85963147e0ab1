//! TCP port arbitration.
//!
//! The kernel is the source of truth for port ownership: a port is free iff
//! a loopback bind succeeds. Eviction shells out to `lsof` to find holders
//! and walks the SIGTERM -> SIGKILL ladder.

use std::net::TcpListener;
use std::time::Duration;

use tokio::process::Command;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_GRACE: Duration = Duration::from_millis(300);

/// Checks whether anything is listening on `port`.
///
/// The probe binds with SO_REUSEADDR set (std does this for every listener),
/// so it agrees with the bind the servers themselves will perform right
/// after.
pub fn is_port_in_use(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_err()
}

/// Polls until `port` frees up or `deadline` elapses. Returns whether the
/// port is free.
pub async fn wait_for_port_free(port: u16, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        if !is_port_in_use(port) {
            return true;
        }
        if start.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Outcome of a best-effort eviction pass over a set of ports.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    /// Ports confirmed free after the pass.
    pub freed: Vec<u16>,
    /// Ports that were occupied but had no identifiable holder; usually a
    /// socket in a draining state rather than a live listener.
    pub no_holder: Vec<u16>,
    /// Ports still occupied after every retry.
    pub still_occupied: Vec<u16>,
}

impl EvictionReport {
    pub fn all_freed(&self) -> bool {
        self.still_occupied.is_empty()
    }
}

/// Evicts whichever processes currently hold the given ports.
///
/// Holders get SIGTERM, then SIGKILL after a short grace. The port is then
/// re-checked with backoff (300/600/1200 ms) to give the kernel time to
/// reclaim the binding.
pub async fn force_evict(ports: &[u16]) -> EvictionReport {
    let mut report = EvictionReport::default();
    for &port in ports {
        if !is_port_in_use(port) {
            report.freed.push(port);
            continue;
        }

        let holders = port_holders(port).await;
        if holders.is_empty() {
            log::warn!(port = port; "port is occupied but no holder could be identified");
        } else {
            log::info!(port = port; "evicting {} holder(s)", holders.len());
            for &pid in &holders {
                send_signal(pid, libc::SIGTERM);
            }
            tokio::time::sleep(KILL_GRACE).await;
            for &pid in &holders {
                if process_exists(pid) {
                    send_signal(pid, libc::SIGKILL);
                }
            }
        }

        let backoff = ExponentialBackoff::from_millis(2).factor(150).take(3);
        let released = Retry::spawn(backoff, || async {
            if is_port_in_use(port) {
                Err(())
            } else {
                Ok(())
            }
        })
        .await
        .is_ok();

        match (released, holders.is_empty()) {
            (true, _) => report.freed.push(port),
            (false, true) => report.no_holder.push(port),
            (false, false) => report.still_occupied.push(port),
        }
    }
    report
}

/// PIDs listening on `port`, via `lsof`. Best effort: an inspection failure
/// (including `lsof` being absent) yields an empty list.
async fn port_holders(port: u16) -> Vec<i32> {
    let output = Command::new("lsof")
        .args(["-ti", &format!("tcp:{port}"), "-sTCP:LISTEN"])
        .output()
        .await;
    match output {
        // lsof exits non-zero when nothing matches; stdout is authoritative.
        Ok(out) => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect(),
        Err(err) => {
            log::warn!(port = port; "failed to inspect port holders: {err}");
            Vec::new()
        }
    }
}

fn send_signal(pid: i32, signal: i32) {
    unsafe {
        libc::kill(pid, signal);
    }
}

fn process_exists(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}
