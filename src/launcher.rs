//! `BackendLauncher`: spawns a backend subprocess and waits for it to
//! self-register.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::registry::Registry;

/// Wait budget for self-registration.
const REGISTRATION_WAIT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct LaunchOutcome {
    pub port: u16,
    pub pid: u32,
}

/// Launch a backend rooted at `project_path`, named `session_name`,
/// streaming its stdout/stderr to `logs/session_{name}_{epoch}.log`
/// (relative to `logs_dir`), and poll `registry` until it self-registers
/// under `session_name` or the registration wait budget elapses.
///
/// # Errors
/// `ProxyError::Launch` if the process cannot be spawned or never
/// registers; the error message carries the tail of its log file.
pub async fn launch(
    registry: &Registry,
    proxy_port: u16,
    project_path: &Path,
    session_name: &str,
    logs_dir: &Path,
) -> ProxyResult<LaunchOutcome> {
    if registry.exists(session_name) {
        return Err(ProxyError::launch(format!("a backend named '{session_name}' is already registered")));
    }

    tokio::fs::create_dir_all(logs_dir).await?;
    let epoch = crate::model::now_millis();
    let log_path = logs_dir.join(format!("session_{session_name}_{epoch}.log"));
    let log_file = File::create(&log_path).await?.into_std().await;
    let stderr_file = log_file.try_clone()?;

    let mut command = Command::new(backend_executable());
    command
        .arg("--project-path")
        .arg(project_path)
        .arg("--session-name")
        .arg(session_name)
        .env("PROXY_PORT", proxy_port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(stderr_file));

    let child = command.spawn().map_err(|e| ProxyError::launch(format!("spawn failed: {e}")))?;
    let pid = child.id().unwrap_or(0);
    info!(session_name, pid, project_path = %project_path.display(), "launched backend process");

    // The launcher does not perform registration itself; it polls for the
    // backend's own `proxy/register` call to land in the Registry.
    let deadline = tokio::time::Instant::now() + REGISTRATION_WAIT;
    loop {
        if let Some(info) = registry.get(session_name) {
            if info.pid == Some(pid) {
                return Ok(LaunchOutcome { port: info.port, pid });
            }
        }
        if tokio::time::Instant::now() >= deadline {
            let tail = tail_of_log(&log_path, 500).await;
            warn!(session_name, "backend did not register within 30 seconds");
            return Err(ProxyError::launch(format!(
                "did not register within 30 seconds; log tail: {tail}"
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn backend_executable() -> PathBuf {
    std::env::var_os("MCPREPL_BACKEND_EXECUTABLE")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("mcprepl-backend"))
}

async fn tail_of_log(path: &Path, max_chars: usize) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let len = contents.chars().count();
            if len <= max_chars {
                contents
            } else {
                contents.chars().skip(len - max_chars).collect()
            }
        }
        Err(_) => String::new(),
    }
}

/// Best-effort OS-level termination used by `kill_stale_sessions`.
#[cfg(unix)]
pub fn terminate(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> bool {
    false
}
