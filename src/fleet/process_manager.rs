// src/fleet/process_manager.rs
//! Launching and signalling worker processes
//!
//! The spawner never touches `tokio::process` directly; it goes through two
//! capabilities so the lifecycle logic can run against real processes or
//! in-memory fakes:
//!
//! - [`ProcessLauncher`]: turns a [`LaunchSpec`] into a running process
//! - [`ProcessHandle`]: non-blocking `is_alive()` and `terminate()`
//!
//! [`CommandLauncher`] is the OS implementation. Workers are started in their
//! own process group and are not killed when the coordinator drops the
//! handle, so a coordinator restart does not take the fleet down with it.

use crate::utils::errors::{FleetError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How hard to ask a process to exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM: let the worker drain and exit
    Graceful,
    /// SIGKILL
    Forceful,
}

/// Capability over one running worker process
pub trait ProcessHandle: Send + Sync + fmt::Debug {
    /// OS process id, if the process was started
    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness probe
    fn is_alive(&self) -> bool;

    /// Send a termination signal; signalling an exited process is not an error
    fn terminate(&self, mode: Termination) -> Result<()>;
}

/// Everything needed to start one instance
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub agent_type: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub work_dir: Option<PathBuf>,
    pub port: u16,
}

/// Starts worker processes
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ProcessHandle>>;
}

/// A worker started through [`CommandLauncher`]
pub struct ChildProcess {
    pid: Option<u32>,
    child: Mutex<Child>,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Mutex::new(child),
        }
    }
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcess").field("pid", &self.pid).finish()
    }
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        // try_wait also reaps the child, so exited workers never linger as zombies
        match self.child.lock().try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("Process {:?} exited with {}", self.pid, status);
                false
            }
            Err(e) => {
                warn!("Failed to poll process {:?}: {}", self.pid, e);
                self.pid.map(signal_probe).unwrap_or(false)
            }
        }
    }

    fn terminate(&self, mode: Termination) -> Result<()> {
        match mode {
            Termination::Graceful => match self.pid {
                Some(pid) => send_sigterm(pid),
                None => Ok(()),
            },
            Termination::Forceful => {
                let mut child = self.child.lock();
                match child.start_kill() {
                    Ok(()) => Ok(()),
                    // already reaped
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
                    Err(e) => Err(FleetError::Io(e)),
                }
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    debug!("Sending SIGTERM to PID {}", pid);
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(FleetError::Io(std::io::Error::from(e))),
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn signal_probe(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn signal_probe(_pid: u32) -> bool {
    false
}

/// Launches workers as OS subprocesses
pub struct CommandLauncher {
    /// Resolved executables, keyed by program reference
    executable_paths: Mutex<HashMap<String, PathBuf>>,
}

impl CommandLauncher {
    pub fn new() -> Self {
        Self {
            executable_paths: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a program reference to an executable path
    pub fn resolve(&self, program: &str, work_dir: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = self.executable_paths.lock().get(program) {
            return Ok(path.clone());
        }

        let path = if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
            let candidate = match work_dir {
                Some(dir) if Path::new(program).is_relative() => dir.join(program),
                _ => PathBuf::from(program),
            };
            if !candidate.is_file() {
                return Err(FleetError::ProgramNotFound {
                    program: program.to_string(),
                    reason: format!("{} is not a file", candidate.display()),
                });
            }
            candidate
        } else {
            which::which(program).map_err(|e| FleetError::ProgramNotFound {
                program: program.to_string(),
                reason: format!("not found in PATH: {}", e),
            })?
        };

        info!("Resolved {} to {:?}", program, path);
        self.executable_paths
            .lock()
            .insert(program.to_string(), path.clone());
        Ok(path)
    }
}

impl Default for CommandLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ProcessHandle>> {
        let executable = self.resolve(&spec.program, spec.work_dir.as_deref())?;

        debug!(
            "Launching {} instance on port {}: {:?} {:?}",
            spec.agent_type, spec.port, executable, spec.args
        );

        let mut command = Command::new(&executable);
        command.args(&spec.args);
        if let Some(dir) = &spec.work_dir {
            command.current_dir(dir);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);

        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|e| FleetError::SpawnFailed {
            agent_type: spec.agent_type.clone(),
            reason: format!("failed to start {:?}: {}", executable, e),
        })?;

        debug!("Process spawned with PID: {:?}", child.id());
        Ok(Arc::new(ChildProcess::new(child)))
    }
}
