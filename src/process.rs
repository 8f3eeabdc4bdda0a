//! Local process lifecycle
//!
//! Two process shapes: background (spawned in its own process group, output
//! either visible or discarded) and blocking (spawned and waited on in the
//! foreground). The exclusivity check scans the OS process table by
//! executable name; it is advisory only, the window between check and spawn
//! is not locked.

use std::path::Path;
use std::process::Stdio;

use sysinfo::System;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{ConfigError, ProcessError, Result};

/// A child process detached from the terminal's signal group
#[derive(Debug)]
pub struct BackgroundProcess {
    child: Child,
    name: String,
}

impl BackgroundProcess {
    /// Spawn `executable` with a shell-style argument string.
    ///
    /// `visible` controls whether the child inherits stdout/stderr or has
    /// them discarded.
    pub fn spawn(executable: &str, args: &str, visible: bool) -> Result<Self> {
        let argv = split_arguments(args)?;
        let name = display_name(executable);

        let mut cmd = Command::new(executable);
        cmd.args(&argv);
        if !visible {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        debug!("spawned {} (pid {:?})", name, child.id());

        Ok(Self { child, name })
    }

    /// Non-blocking poll for liveness
    pub fn is_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(_) => false,
        }
    }

    /// Exit code if the process has already exited (-1 for signal exits)
    pub fn exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            _ => None,
        }
    }

    /// Block until the process exits; a non-zero exit code is an error.
    pub async fn wait(&mut self) -> Result<()> {
        let status = self.child.wait().await?;
        if !status.success() {
            return Err(ProcessError::ExitedWithError {
                name: self.name.clone(),
                code: status.code().unwrap_or(-1),
            }
            .into());
        }
        Ok(())
    }

    /// Request termination and reap the process.
    ///
    /// Exit codes of 0 and 1 after a terminate are benign (several debug
    /// tools exit 1 on SIGTERM); anything above 1 is a process failure.
    pub async fn terminate(&mut self) -> Result<()> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return self.check_post_terminate(status.code());
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            debug!("terminating {} (pid {})", self.name, pid);
            let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if rc != 0 {
                warn!("SIGTERM to {} failed: {}", pid, std::io::Error::last_os_error());
            }
        }

        let status = self.child.wait().await?;
        self.check_post_terminate(status.code())
    }

    fn check_post_terminate(&self, code: Option<i32>) -> Result<()> {
        match code {
            Some(code) if code > 1 => Err(ProcessError::ExitedWithError {
                name: self.name.clone(),
                code,
            }
            .into()),
            _ => Ok(()),
        }
    }
}

/// Spawn and wait in the foreground; non-zero exit is an immediate error.
///
/// The child shares the terminal and signal group, so Ctrl-C reaches it
/// directly.
pub async fn run_blocking(executable: &str, args: &str) -> Result<()> {
    let argv = split_arguments(args)?;
    let name = display_name(executable);
    debug!("running {} {}", executable, args);

    let status = Command::new(executable)
        .args(&argv)
        .status()
        .await
        .map_err(|e| ProcessError::SpawnFailed {
            name: name.clone(),
            reason: e.to_string(),
        })?;
    if !status.success() {
        return Err(ProcessError::ExitedWithError {
            name,
            code: status.code().unwrap_or(-1),
        }
        .into());
    }
    Ok(())
}

/// Fire-and-forget spawn of a full command line, detached and visible.
pub fn spawn_detached(command_line: &str) -> Result<()> {
    let mut argv = split_arguments(command_line)?;
    if argv.is_empty() {
        return Err(ConfigError::BadArguments(command_line.to_string()).into());
    }
    let program = argv.remove(0);
    let name = display_name(&program);

    let mut cmd = Command::new(&program);
    cmd.args(&argv);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
        name,
        reason: e.to_string(),
    })?;
    debug!("detached spawn {} (pid {:?})", program, child.id());
    // Not tracked beyond process exit; dropping the handle leaves it running.
    drop(child);
    Ok(())
}

/// Scan the process table for an executable name, returning a pid on match.
pub fn find_process_by_name(name: &str) -> Option<u32> {
    let sys = System::new_all();
    for (pid, process) in sys.processes() {
        if process.name() == name {
            return Some(pid.as_u32());
        }
    }
    None
}

/// Admission control before starting a server: one instance per adapter.
pub fn ensure_not_running(executable: &str) -> Result<()> {
    let name = display_name(executable);
    if let Some(pid) = find_process_by_name(&name) {
        return Err(ProcessError::AlreadyRunning { name, pid }.into());
    }
    Ok(())
}

fn split_arguments(args: &str) -> Result<Vec<String>> {
    shell_words::split(args).map_err(|_| ConfigError::BadArguments(args.to_string()).into())
}

/// Bare executable name used in messages and process-table matching
pub fn display_name(executable: &str) -> String {
    Path::new(executable)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| executable.to_string())
}
