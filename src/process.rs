//! Data structures for tracking services and the processes running them.
//!
//! This module defines the resolved specification for a service (`ServiceSpec`),
//! its lifecycle state (`ServiceState`), and the `ProcessTable` shared between the
//! launcher, the exit waiters and the shutdown path.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Deserialize;

/// The fixed set of service kinds. String forms only exist at the config boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Long-running application run through poetry.
    #[serde(alias = "api", alias = "webapp", alias = "library", alias = "python")]
    App,
    /// Background worker run through poetry.
    Worker,
    /// Frontend dev server run through bun.
    #[serde(alias = "portal")]
    Frontend,
    /// Arbitrary containerized command line.
    #[serde(alias = "docker")]
    Container,
}

impl ServiceKind {
    pub fn label(self) -> &'static str {
        match self {
            ServiceKind::App => "app",
            ServiceKind::Worker => "worker",
            ServiceKind::Frontend => "frontend",
            ServiceKind::Container => "container",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A service resolved against the config and the services root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Unique service name.
    pub name: String,
    pub kind: ServiceKind,
    /// Primary port, exported to the process as `PORT`.
    pub port: Option<u16>,
    /// Hot-reload port (frontends only).
    pub hmr_port: Option<u16>,
    /// Websocket port (frontends only).
    pub ws_port: Option<u16>,
    /// Working directory.
    pub dir: PathBuf,
    /// Subcommand or full command line override, depending on kind.
    pub command: Option<String>,
    pub worker_command: Option<String>,
    pub docker_command: Option<String>,
    /// Global env merged with the service's own (service wins).
    pub env: BTreeMap<String, String>,
    pub repo: Option<String>,
}

impl ServiceSpec {
    /// Creates a spec with no ports, overrides or environment.
    pub fn new(name: impl Into<String>, kind: ServiceKind, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind,
            port: None,
            hmr_port: None,
            ws_port: None,
            dir: dir.into(),
            command: None,
            worker_command: None,
            docker_command: None,
            env: BTreeMap::new(),
            repo: None,
        }
    }

    pub fn is_frontend(&self) -> bool {
        self.kind == ServiceKind::Frontend
    }
}

/// Lifecycle state reported on the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Running,
    Error,
    Stopped,
}

impl ServiceState {
    pub fn label(self) -> &'static str {
        match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Error => "error",
            ServiceState::Stopped => "stopped",
        }
    }
}

/// How a process' output is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Attached to a pseudo-terminal.
    Pty,
    /// Separate stdout and stderr pipes.
    Pipe,
    /// Appended to a log file, no reader in this process.
    File,
}

/// Runtime identity of a launched service.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub service: String,
    pub pid: u32,
    pub pgid: u32,
    pub started_at: Instant,
    pub capture: CaptureMode,
    pub state: ServiceState,
    /// Command line substring used to recognise the process later.
    pub fingerprint: String,
    pub cwd: PathBuf,
}

/// Mutex-guarded map of the handles launched in this session.
///
/// The lock is only held for single map operations, never across IO.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    inner: Arc<Mutex<HashMap<String, ProcessHandle>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly launched process, replacing a previous handle for the same service.
    pub fn track(&self, handle: ProcessHandle) {
        self.lock().insert(handle.service.clone(), handle);
    }

    /// Drops the handle for `service` if it still refers to `pid`, returning it
    /// marked as stopped.
    pub fn release(&self, service: &str, pid: u32) -> Option<ProcessHandle> {
        let mut table = self.lock();
        if table.get(service).map(|h| h.pid) != Some(pid) {
            return None;
        }
        let mut handle = table.remove(service)?;
        handle.state = ServiceState::Stopped;
        Some(handle)
    }

    pub fn get(&self, service: &str) -> Option<ProcessHandle> {
        self.lock().get(service).cloned()
    }

    /// Returns all handles sorted by service name.
    pub fn snapshot(&self) -> Vec<ProcessHandle> {
        let mut handles: Vec<_> = self.lock().values().cloned().collect();
        handles.sort_by(|a, b| a.service.cmp(&b.service));
        handles
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProcessHandle>> {
        // A panic while holding the lock leaves the map itself intact.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
