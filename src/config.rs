//! Configuration types and file I/O for mcprepl-proxy.
//!
//! `SecurityConfig` is loaded read-only from `.mcprepl/security.json`;
//! `ProxyConfig` carries the tunables named throughout the rest of the
//! crate, with defaults matching the documented values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProxyError, ProxyResult};

/// Security enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    Strict,
    Relaxed,
    Lax,
}

impl Default for SecurityMode {
    fn default() -> Self {
        Self::Lax
    }
}

/// `.mcprepl/security.json`. Consumed read-only by `SecurityGate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub mode: SecurityMode,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub port: u16,
    pub created_at: i64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            mode: SecurityMode::default(),
            api_keys: Vec::new(),
            allowed_ips: Vec::new(),
            port: 0,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

impl SecurityConfig {
    /// Load from `<workspace>/.mcprepl/security.json`. Returns defaults
    /// (mode `lax`) if the file does not exist — first-run ergonomics.
    ///
    /// # Errors
    /// Returns `ProxyError::Configuration` if the file exists but cannot be
    /// parsed.
    pub fn load(workspace: &Path) -> ProxyResult<Self> {
        let path = security_config_path(workspace);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)
            .map_err(|e| ProxyError::configuration(format!("reading {}: {e}", path.display())))?;
        serde_json::from_str(&data)
            .map_err(|e| ProxyError::configuration(format!("parsing {}: {e}", path.display())))
    }

    /// Write the config, creating the `.mcprepl` directory if needed and
    /// restricting file permissions to `0600` on POSIX.
    pub fn save(&self, workspace: &Path) -> ProxyResult<()> {
        let path = security_config_path(workspace);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, data)?;
        restrict_permissions(&path)?;
        Ok(())
    }
}

fn security_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".mcprepl").join("security.json")
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> ProxyResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> ProxyResult<()> {
    Ok(())
}

/// Runtime tunables. Defaults match the values documented throughout
/// the rest of the crate.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Maximum events retained in the EventBus ring.
    pub event_ring_capacity: usize,
    /// Per-subscriber mailbox bound.
    pub subscriber_mailbox_capacity: usize,
    /// HeartbeatMonitor tick period.
    pub heartbeat_tick: Duration,
    /// Staleness threshold before `ready -> disconnected`.
    pub heartbeat_timeout: Duration,
    /// Outage age after which a forward failure demotes to `stopped`.
    pub stopped_after: Duration,
    /// Reconnector probe cadence.
    pub probe_interval: Duration,
    /// Reconnector probe budget.
    pub probe_budget: Duration,
    /// Overall wait budget for one buffered client request.
    pub reconnect_wait_budget: Duration,
    /// `ex`-tool keepalive cadence.
    pub keepalive_fast: Duration,
    /// Default-tool keepalive cadence.
    pub keepalive_slow: Duration,
    /// Backend forward connect timeout.
    pub forward_connect_timeout: Duration,
    /// Backend forward read timeout.
    pub forward_read_timeout: Duration,
    /// Session idleness bound before GC.
    pub session_idle_timeout: Duration,
    /// SSE poll period.
    pub sse_poll_interval: Duration,
    /// EventStore retention window.
    pub event_retention: Duration,
    /// Backend self-registration wait budget.
    pub registration_wait_budget: Duration,
    /// Bind address for the HTTP frontend. Port 0 means "pick a free port
    /// in 40000-49999".
    pub bind_addr: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            event_ring_capacity: 10_000,
            subscriber_mailbox_capacity: 32,
            heartbeat_tick: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(30),
            stopped_after: Duration::from_secs(120),
            probe_interval: Duration::from_secs(1),
            probe_budget: Duration::from_secs(30),
            reconnect_wait_budget: Duration::from_secs(60),
            keepalive_fast: Duration::from_secs(5),
            keepalive_slow: Duration::from_secs(15),
            forward_connect_timeout: Duration::from_secs(5),
            forward_read_timeout: Duration::from_secs(30),
            session_idle_timeout: Duration::from_secs(3600),
            sse_poll_interval: Duration::from_millis(500),
            event_retention: Duration::from_secs(30 * 24 * 3600),
            registration_wait_budget: Duration::from_secs(30),
            bind_addr: "127.0.0.1:0".to_string(),
        }
    }
}

/// Dynamic port scan range.
pub const DYNAMIC_PORT_RANGE: std::ops::RangeInclusive<u16> = 40_000..=49_999;

/// Pick the first free TCP port in `DYNAMIC_PORT_RANGE`.
///
/// # Errors
/// Returns `ProxyError::Configuration` if every port in the range is taken.
pub async fn pick_free_port() -> ProxyResult<u16> {
    for port in DYNAMIC_PORT_RANGE {
        if tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
            return Ok(port);
        }
    }
    Err(ProxyError::configuration("no free port in 40000-49999"))
}

/// Directory used for the PID file and proxy log:
/// `${XDG_CACHE_HOME:-~/.cache}/mcprepl`.
pub fn cache_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|b| b.cache_dir().join("mcprepl"))
        .unwrap_or_else(|| PathBuf::from(".cache/mcprepl"))
}

/// Path to the PID file for a given bound port.
pub fn pid_file_path(port: u16) -> PathBuf {
    cache_dir().join(format!("proxy-{port}.pid"))
}

/// Path to the proxy's own log file for a given bound port.
pub fn log_file_path(port: u16) -> PathBuf {
    cache_dir().join(format!("proxy-{port}.log"))
}

/// Write the PID file, removing a stale one first if its owning process is
/// no longer running.
pub fn write_pid_file(port: u16) -> ProxyResult<()> {
    let dir = cache_dir();
    std::fs::create_dir_all(&dir)?;
    let path = pid_file_path(port);
    if path.exists() {
        remove_if_stale(&path)?;
    }
    std::fs::write(&path, std::process::id().to_string())?;
    Ok(())
}

fn remove_if_stale(path: &Path) -> ProxyResult<()> {
    let contents = std::fs::read_to_string(path).unwrap_or_default();
    let stale = match contents.trim().parse::<i32>() {
        Ok(pid) => !process_is_running(pid),
        Err(_) => true,
    };
    if stale {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

#[cfg(unix)]
fn process_is_running(pid: i32) -> bool {
    // Signal 0 performs no-op existence/permission checks only.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_running(_pid: i32) -> bool {
    true
}

/// Whether a process with `pid` is currently running. Used by the CLI for
/// duplicate-launch detection.
pub fn process_is_running_pub(pid: i32) -> bool {
    process_is_running(pid)
}
