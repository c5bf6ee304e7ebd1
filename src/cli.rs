//! CLI surface: `start`, `stop`, `restart`, `status`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::config::{self, ProxyConfig, SecurityConfig};

#[derive(Parser, Debug)]
#[command(name = "mcprepl-proxy", version, about = "Persistent MCP proxy fronting transient REPL backends")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Raise log verbosity (repeatable: -v debug, -vv trace). Overrides `RUST_LOG`.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all logging below `warn`. Takes precedence over `--verbose`.
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

impl Cli {
    /// The `EnvFilter` directive implied by `-v`/`-q`, or `None` to defer to
    /// `RUST_LOG`/the default the caller already configured.
    pub fn log_filter(&self) -> Option<&'static str> {
        if self.quiet {
            return Some("warn");
        }
        match self.verbose {
            0 => None,
            1 => Some("debug"),
            _ => Some("trace"),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the proxy in the foreground (or detached with --background).
    Start {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        background: bool,
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
    /// Stop a running proxy identified by its PID file.
    Stop {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Stop then start again.
    Restart {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
    /// Report whether a proxy is running and its bound port.
    Status {
        #[arg(long)]
        port: Option<u16>,
    },
}

/// Exit codes
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const ALREADY_RUNNING: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const BIND_FAILED: i32 = 3;
}

impl Cli {
    pub async fn execute(self) -> i32 {
        match self.command {
            Command::Start { port, background, workspace } => start(port, background, workspace).await,
            Command::Stop { port } => stop(port),
            Command::Restart { port, workspace } => {
                let stop_code = stop(port);
                if stop_code != exit_code::OK {
                    info!("no running proxy found to stop, starting fresh");
                }
                start(port, false, workspace).await
            }
            Command::Status { port } => status(port),
        }
    }
}

async fn start(port_override: Option<u16>, background: bool, workspace: PathBuf) -> i32 {
    let security = match SecurityConfig::load(&workspace) {
        Ok(s) => s,
        Err(err) => {
            error!(error = %err, "failed to load security config");
            return exit_code::CONFIG_ERROR;
        }
    };

    let port = port_override.unwrap_or(security.port);
    let port = if port == 0 {
        match config::pick_free_port().await {
            Ok(p) => p,
            Err(err) => {
                error!(error = %err, "failed to find a free port");
                return exit_code::BIND_FAILED;
            }
        }
    } else {
        port
    };

    let pid_path = config::pid_file_path(port);
    if pid_path.exists() {
        if let Ok(contents) = std::fs::read_to_string(&pid_path) {
            if let Ok(existing_pid) = contents.trim().parse::<i32>() {
                if config::process_is_running_pub(existing_pid) {
                    error!(port, "a proxy is already running on this port");
                    return exit_code::ALREADY_RUNNING;
                }
            }
        }
    }

    if background {
        info!("background launch requested; running in foreground within this process model");
    }

    match crate::run(workspace, security, ProxyConfig::default(), port).await {
        Ok(()) => exit_code::OK,
        Err(err) => {
            error!(error = %err, "proxy exited with error");
            exit_code::BIND_FAILED
        }
    }
}

fn stop(port_override: Option<u16>) -> i32 {
    let Some(port) = port_override else {
        error!("stop requires --port");
        return exit_code::CONFIG_ERROR;
    };
    let pid_path = config::pid_file_path(port);
    let Ok(contents) = std::fs::read_to_string(&pid_path) else {
        error!(port, "no pid file found");
        return exit_code::CONFIG_ERROR;
    };
    let Ok(pid) = contents.trim().parse::<i32>() else {
        return exit_code::CONFIG_ERROR;
    };
    #[cfg(unix)]
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    let _ = std::fs::remove_file(&pid_path);
    exit_code::OK
}

fn status(port_override: Option<u16>) -> i32 {
    let Some(port) = port_override else {
        println!("no port specified");
        return exit_code::CONFIG_ERROR;
    };
    let pid_path = config::pid_file_path(port);
    match std::fs::read_to_string(&pid_path) {
        Ok(contents) => {
            println!("proxy running on port {port}, pid {}", contents.trim());
            exit_code::OK
        }
        Err(_) => {
            println!("no proxy running on port {port}");
            exit_code::CONFIG_ERROR
        }
    }
}
