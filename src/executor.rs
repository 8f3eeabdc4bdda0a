//! Execution control
//!
//! Dispatches a validated plan to its execution strategy. The strategy is
//! selected once at construction: local process spawning, or remote agent
//! calls when the plan names a remote host. The mode state machine runs on
//! top of it (spawn, settle, run, terminate) with server cleanup guaranteed
//! on every exit path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ConfigError, ProcessError, Result};
use crate::plan::{Mode, ResolvedPlan};
use crate::process::{self, BackgroundProcess};
use crate::remote::{ChannelSecurity, RpcClient};

/// Settle time before confirming the background server is still alive
const SERVER_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum Strategy {
    Local,
    Remote(RpcClient),
}

/// Runs one resolved plan to completion
#[derive(Debug)]
pub struct Controller {
    strategy: Strategy,
}

impl Controller {
    /// Select the execution strategy from the resolved plan.
    ///
    /// Secure remote channels require the pre-shared `cert_auth_key`;
    /// plaintext must be opted into with `tls_mode: disabled`.
    pub fn from_plan(plan: &ResolvedPlan) -> Result<Self> {
        let strategy = match plan.remote_host() {
            Some(host) => {
                let security = if plan.tls_disabled() {
                    ChannelSecurity::Insecure
                } else {
                    ChannelSecurity::Secure {
                        auth_key: plan.auth_key()?.to_string(),
                        root_cert: plan.get("tls_root_cert").map(PathBuf::from),
                    }
                };
                debug!("remote strategy selected for {}", host);
                Strategy::Remote(RpcClient::new(host, security))
            }
            None => Strategy::Local,
        };
        Ok(Self { strategy })
    }

    pub async fn execute(
        &self,
        plan: &ResolvedPlan,
        mode: Mode,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if let Some(command) = plan.spawn_process() {
            match &self.strategy {
                Strategy::Local => process::spawn_detached(command)?,
                Strategy::Remote(_) => return Err(ConfigError::SpawnWithRemote.into()),
            }
        }
        match &self.strategy {
            Strategy::Local => execute_local(plan, mode).await,
            Strategy::Remote(client) => execute_remote(client, plan, mode, cancel).await,
        }
    }
}

async fn execute_local(plan: &ResolvedPlan, mode: Mode) -> Result<()> {
    match mode {
        Mode::GdbOpenocd => debug_with_server(plan).await,
        Mode::Openocd => server_only(plan).await,
        Mode::Gdb => debug_only(plan).await,
        Mode::Log => Err(ConfigError::NotImplemented("log mode".to_string()).into()),
    }
}

async fn execute_remote(
    client: &RpcClient,
    plan: &ResolvedPlan,
    mode: Mode,
    cancel: &CancellationToken,
) -> Result<()> {
    match mode {
        // The remote agent owns the debug server; hold its lock for the
        // lifetime of the local debugger.
        Mode::GdbOpenocd => client.debug_session(cancel, || run_debugger(plan)).await,
        Mode::Gdb => run_debugger(plan).await,
        Mode::Openocd => remote_server_op(client, plan, cancel).await,
        Mode::Log => Err(ConfigError::NotImplemented("log mode".to_string()).into()),
    }
}

/// Background server plus foreground debugger.
///
/// The server is terminated on every exit path, including a failed
/// debugger run.
async fn debug_with_server(plan: &ResolvedPlan) -> Result<()> {
    let executable = plan.openocd_executable()?;
    let args = plan.openocd_args()?;
    process::ensure_not_running(executable)?;

    let mut server = BackgroundProcess::spawn(executable, args, false)?;
    tokio::time::sleep(SERVER_SETTLE).await;
    if !server.is_running() {
        return Err(ProcessError::PrematureExit {
            name: process::display_name(executable),
            code: server.exit_code().unwrap_or(-1),
        }
        .into());
    }
    info!("debug server up; starting debugger");

    let debug_result = run_debugger(plan).await;
    let shutdown = server.terminate().await;
    debug_result?;
    shutdown
}

async fn server_only(plan: &ResolvedPlan) -> Result<()> {
    let executable = plan.openocd_executable()?;
    let args = plan.openocd_args()?;
    process::ensure_not_running(executable)?;

    let mut server = BackgroundProcess::spawn(executable, args, true)?;
    server.wait().await
}

/// Debugger without a controller-owned server.
///
/// Pipe configurations start the server through the debugger itself, so the
/// adapter must still be free.
async fn debug_only(plan: &ResolvedPlan) -> Result<()> {
    if let Some(executable) = plan.get("openocd_executable") {
        process::ensure_not_running(executable)?;
    }
    run_debugger(plan).await
}

async fn run_debugger(plan: &ResolvedPlan) -> Result<()> {
    process::run_blocking(plan.gdb_executable()?, plan.gdb_args()?).await
}

/// Server-only operations delegated to the remote agent. The first token of
/// the configured arguments selects the sub-operation.
async fn remote_server_op(
    client: &RpcClient,
    plan: &ResolvedPlan,
    cancel: &CancellationToken,
) -> Result<()> {
    let args = plan.openocd_args()?;
    let (command, rest) = match args.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (args, ""),
    };
    match command {
        "program" if !rest.is_empty() => {
            client
                .program_device(Path::new(rest), cancel, print_line)
                .await
        }
        "reset" => client.reset_device(cancel, print_line).await,
        "logstream" if !rest.is_empty() => {
            client.log_stream_create(rest, cancel, print_line).await
        }
        _ => Err(ConfigError::InvalidRpcMode(args.to_string()).into()),
    }
}

fn print_line(line: &str) {
    println!("{line}");
}

/// Human-readable summary of what the plan would run, for dry runs.
pub fn dry_run_description(plan: &ResolvedPlan) -> String {
    let mode = plan.get("mode").unwrap_or_default();
    let mut out = String::new();
    if matches!(mode, "gdb_openocd" | "gdb") {
        out.push_str(&format!(
            "gdb: {} {}\n",
            plan.get("gdb_executable").unwrap_or_default(),
            plan.get("gdb_args").unwrap_or_default()
        ));
    }
    if matches!(mode, "gdb_openocd" | "openocd") {
        out.push_str(&format!(
            "openocd: {} {}\n",
            plan.get("openocd_executable").unwrap_or_default(),
            plan.get("openocd_args").unwrap_or_default()
        ));
    }
    if let Some(spawn) = plan.spawn_process() {
        out.push_str(&format!("spawn: {spawn}\n"));
    }
    out
}
