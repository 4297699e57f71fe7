//! OS process and TCP port helpers.
//!
//! Wraps the shell-level plumbing the controller needs: checking and
//! freeing a TCP port, and signalling a process by PID.

use std::time::Duration;

use tracing::{debug, warn};

/// Whether something is already bound to the given TCP port.
pub fn port_in_use(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_err()
}

/// Kill whatever currently holds the given TCP port.
///
/// Best-effort: a missing `lsof` or an empty holder list is not an error.
pub async fn free_port(port: u16) {
    let cmd = format!("lsof -ti tcp:{port} | xargs -r kill -9");
    match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&cmd)
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            debug!(port, "port freed");
        }
        Ok(output) => {
            warn!(port, status = ?output.status, "free_port command failed");
        }
        Err(e) => {
            warn!(port, error = %e, "could not run free_port command");
        }
    }
}

/// Signal a process by PID. `force` sends SIGKILL instead of SIGTERM.
///
/// Returns true if the signal was delivered.
pub async fn terminate(pid: u32, force: bool) -> bool {
    let signal = if force { "-KILL" } else { "-TERM" };
    match tokio::process::Command::new("kill")
        .arg(signal)
        .arg(pid.to_string())
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(e) => {
            warn!(pid, error = %e, "could not signal process");
            false
        }
    }
}

/// Whether a process with the given PID is still alive (signal 0 probe).
pub fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Wait until the PID exits, polling up to `timeout`.
///
/// Returns true if the process exited within the bound.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    !pid_alive(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_in_use_detects_bound_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_in_use(port));
        drop(listener);
        assert!(!port_in_use(port));
    }

    #[test]
    fn pid_alive_for_own_process() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn pid_alive_false_for_unlikely_pid() {
        // PID near the default pid_max ceiling, very unlikely to exist.
        assert!(!pid_alive(4_194_000));
    }

    #[tokio::test]
    async fn terminate_and_wait_for_exit() {
        // Detach the sleep from this process so init reaps it after the
        // kill (an unreaped zombie would still answer signal 0).
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 30 >/dev/null 2>&1 & echo $!")
            .output()
            .unwrap();
        let pid: u32 = String::from_utf8_lossy(&output.stdout).trim().parse().unwrap();
        assert!(pid_alive(pid));

        assert!(terminate(pid, false).await);
        assert!(wait_for_exit(pid, Duration::from_secs(5)).await);
    }
}
