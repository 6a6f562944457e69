//! Server process bootstrap.
//!
//! A client may own the lifetime of its server: before connecting it makes
//! sure the server executable is running, and on dispose it terminates it.
//! Liveness is a process lookup by executable name or exact path, so a
//! server started by someone else is reused instead of launched twice.
//!
//! Termination only touches the process this bootstrap launched, or the one
//! it found and adopted in [`ServerBootstrap::ensure_running`]. Other
//! processes running the same executable are left alone.
//!
//! # Example
//!
//! ```ignore
//! use pipelink::bootstrap::ServerBootstrap;
//! use pipelink::codec::JsonLineCodec;
//!
//! let bootstrap = ServerBootstrap::new("/opt/echo/echo-server")
//!     .credentials::<JsonLineCodec, _>(&login)?;
//! bootstrap.ensure_running()?;
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

use crate::codec::LineCodec;
use crate::error::{PipeLinkError, Result};

/// Launches and stops a server executable.
#[derive(Debug)]
pub struct ServerBootstrap {
    executable: PathBuf,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
    adopted: Mutex<Option<Pid>>,
}

impl ServerBootstrap {
    /// Bootstrap for `executable`, launched without arguments.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            child: Mutex::new(None),
            adopted: Mutex::new(None),
        }
    }

    /// Append a raw command-line argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Pass `credentials` as the single command-line argument.
    ///
    /// The value is encoded with codec `C`, so the argument is one line.
    pub fn credentials<C: LineCodec, T: Serialize>(mut self, credentials: &T) -> Result<Self> {
        self.args = vec![C::encode(credentials)?];
        Ok(self)
    }

    /// Path of the server executable.
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Command-line arguments passed on launch.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn child(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn adopted(&self) -> MutexGuard<'_, Option<Pid>> {
        self.adopted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a process for the executable is running.
    pub fn is_running(&self) -> bool {
        self.find_running().is_some()
    }

    fn find_running(&self) -> Option<Pid> {
        let own_pid = Pid::from_u32(std::process::id());
        let system = self.scan();
        system
            .processes()
            .iter()
            .find(|(pid, process)| **pid != own_pid && self.matches(process))
            .map(|(pid, _)| *pid)
    }

    /// Launch the server unless it already runs. Returns true if launched.
    ///
    /// A server found running is adopted: [`terminate`](Self::terminate)
    /// will stop it.
    pub fn ensure_running(&self) -> Result<bool> {
        if let Some(pid) = self.find_running() {
            tracing::debug!(
                executable = %self.executable.display(),
                pid = pid.as_u32(),
                "Server already running"
            );
            *self.adopted() = Some(pid);
            return Ok(false);
        }

        let child = Command::new(&self.executable)
            .args(&self.args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                PipeLinkError::Bootstrap(format!(
                    "failed to launch {}: {}",
                    self.executable.display(),
                    e
                ))
            })?;

        tracing::debug!(
            executable = %self.executable.display(),
            pid = child.id(),
            "Server launched"
        );
        *self.child() = Some(child);
        Ok(true)
    }

    /// Stop the launched child, or the adopted server process.
    pub fn terminate(&self) -> Result<()> {
        let mut failure = None;

        if let Some(mut child) = self.child().take() {
            match child.kill() {
                Ok(()) => {}
                // Already exited
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
                Err(e) => failure = Some(e.to_string()),
            }
            let _ = child.wait();
            tracing::debug!(pid = child.id(), "Server child stopped");
        }

        if let Some(pid) = self.adopted().take() {
            let system = self.scan();
            // The pid may have been reused since it was adopted
            match system.process(pid).filter(|process| self.matches(process)) {
                Some(process) if process.kill() => {
                    tracing::debug!(pid = pid.as_u32(), "Adopted server process killed");
                }
                Some(_) => failure = Some(format!("could not kill process {}", pid)),
                None => {}
            }
        }

        match failure {
            Some(reason) => Err(PipeLinkError::Bootstrap(reason)),
            None => Ok(()),
        }
    }

    fn scan(&self) -> System {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet),
        );
        system
    }

    fn matches(&self, process: &Process) -> bool {
        if process.exe() == Some(self.executable.as_path()) {
            return true;
        }

        let name = process.name();
        let file_name = self.executable.file_name();
        let file_stem = self.executable.file_stem();
        file_name == Some(name) || file_stem == Some(name) || is_same_name(name, file_name)
    }
}

/// Case-insensitive name match, as process names are on Windows.
#[cfg(windows)]
fn is_same_name(name: &OsStr, file_name: Option<&OsStr>) -> bool {
    match (name.to_str(), file_name.and_then(OsStr::to_str)) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

#[cfg(not(windows))]
fn is_same_name(_name: &OsStr, _file_name: Option<&OsStr>) -> bool {
    false
}
