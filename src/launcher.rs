//! Process launching and output capture.
//!
//! The `Launcher` turns a `ServiceSpec` into a running process in its own process
//! group, wires its output into the shared log channel, and reports lifecycle
//! transitions on the status channel. Launch failures stay local to the service.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use portable_pty::{native_pty_system, Child as PtyChild, CommandBuilder, MasterPty, PtySize};
use tokio::io::{AsyncBufReadExt, AsyncRead};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::events::{EventSenders, StatusUpdate};
use crate::output::{decode_line, LogLine};
use crate::platform::ProcessControl;
use crate::process::{CaptureMode, ProcessHandle, ProcessTable, ServiceKind, ServiceSpec, ServiceState};
use crate::toolchain::{ToolResolver, BUN, POETRY};

/// Delay between consecutive frontend dev server launches.
pub const FRONTEND_STAGGER: Duration = Duration::from_secs(2);

const PTY_ROWS: u16 = 50;
const PTY_COLS: u16 = 200;

/// Fully resolved program, arguments, directory and environment for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Variables added on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl LaunchCommand {
    /// Program file name plus arguments; stable across install locations.
    pub fn fingerprint(&self) -> String {
        let program = Path::new(&self.program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone());
        std::iter::once(program)
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Builds the command for `spec` according to its kind.
pub fn build_command(spec: &ServiceSpec, tools: &ToolResolver) -> Result<LaunchCommand> {
    let (program, args) = match spec.kind {
        ServiceKind::App => {
            let sub = spec.command.clone().unwrap_or_else(|| "dev".to_string());
            (tools.resolve(POETRY), vec!["run".to_string(), sub])
        }
        ServiceKind::Worker => {
            let sub = spec
                .worker_command
                .clone()
                .or_else(|| spec.command.clone())
                .unwrap_or_else(|| "worker".to_string());
            (tools.resolve(POETRY), vec!["run".to_string(), sub])
        }
        ServiceKind::Frontend => {
            let sub = spec.command.clone().unwrap_or_else(|| "dev".to_string());
            (tools.resolve(BUN), vec![sub])
        }
        ServiceKind::Container => {
            let line = spec
                .command
                .as_deref()
                .or(spec.docker_command.as_deref())
                .unwrap_or("");
            let mut parts = shell_words::split(line)
                .with_context(|| format!("failed to parse command for {}", spec.name))?;
            if parts.is_empty() {
                bail!("container service {} missing command", spec.name);
            }
            let program = parts.remove(0);
            (program, parts)
        }
    };

    let mut env = spec.env.clone();
    if let Some(port) = spec.port {
        env.insert("PORT".to_string(), port.to_string());
    }
    Ok(LaunchCommand {
        program,
        args,
        cwd: spec.dir.clone(),
        env,
    })
}

/// A process started on a pseudo-terminal.
pub struct PtyProcess {
    pub pid: u32,
    /// Blocking reader over the terminal's output side.
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn PtyChild + Send + Sync>,
    /// Kept alive until the child exits.
    pub master: Box<dyn MasterPty + Send>,
}

/// Starts commands attached to a pseudo-terminal.
pub trait PtyBackend: Send + Sync {
    fn spawn(&self, command: &LaunchCommand) -> Result<PtyProcess>;
}

/// The host's pseudo-terminal implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativePty;

impl PtyBackend for NativePty {
    fn spawn(&self, command: &LaunchCommand) -> Result<PtyProcess> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to allocate pseudo-terminal")?;

        let mut builder = CommandBuilder::new(&command.program);
        builder.args(&command.args);
        builder.cwd(&command.cwd);
        for (key, value) in &command.env {
            builder.env(key, value);
        }
        // The pty child becomes a session leader, so it heads its own process group.
        let child = pair
            .slave
            .spawn_command(builder)
            .with_context(|| format!("failed to spawn {} on a pseudo-terminal", command.program))?;
        drop(pair.slave);

        let pid = child
            .process_id()
            .ok_or_else(|| anyhow!("pseudo-terminal child has no pid"))?;
        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to attach pseudo-terminal reader")?;
        Ok(PtyProcess {
            pid,
            reader,
            child,
            master: pair.master,
        })
    }
}

/// True when any cause in the chain is a permission error.
pub fn is_permission_denied(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::PermissionDenied || is_eperm(io_err) {
                return true;
            }
        }
        let text = cause.to_string().to_ascii_lowercase();
        text.contains("operation not permitted") || text.contains("permission denied")
    })
}

#[cfg(unix)]
fn is_eperm(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_eperm(_err: &io::Error) -> bool {
    false
}

/// Where launched processes send their output.
#[derive(Debug, Clone)]
pub enum LaunchMode {
    /// Output is read by this process and forwarded to the log channel.
    Attached { use_pty: bool },
    /// Output is appended to `<log_dir>/<service>.log` and the process outlives us.
    Detached { log_dir: PathBuf },
}

pub struct Launcher {
    tools: ToolResolver,
    pty: Arc<dyn PtyBackend>,
    control: Arc<dyn ProcessControl>,
    table: ProcessTable,
    events: EventSenders,
    mode: LaunchMode,
    stagger: Duration,
}

impl Launcher {
    pub fn new(
        tools: ToolResolver,
        pty: Arc<dyn PtyBackend>,
        control: Arc<dyn ProcessControl>,
        table: ProcessTable,
        events: EventSenders,
        mode: LaunchMode,
    ) -> Self {
        Self {
            tools,
            pty,
            control,
            table,
            events,
            mode,
            stagger: FRONTEND_STAGGER,
        }
    }

    #[cfg(test)]
    fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    /// Launches every service, frontends last with a delay between them.
    ///
    /// Returns the handles of the services that started.
    pub async fn launch_all(&self, specs: &[ServiceSpec]) -> Vec<ProcessHandle> {
        let (others, frontends) = launch_order(specs);
        let mut handles = Vec::new();
        for spec in others {
            handles.extend(self.launch(spec).await);
        }
        for (idx, spec) in frontends.into_iter().enumerate() {
            if idx > 0 {
                tokio::time::sleep(self.stagger).await;
            }
            handles.extend(self.launch(spec).await);
        }
        handles
    }

    /// Launches one service, reporting failure as an `error` status and log line.
    pub async fn launch(&self, spec: &ServiceSpec) -> Option<ProcessHandle> {
        self.events
            .status(&spec.name, ServiceState::Starting, None)
            .await;
        match self.try_launch(spec).await {
            Ok(handle) => {
                tracing::info!(
                    service = %spec.name,
                    pid = handle.pid,
                    capture = ?handle.capture,
                    "service started"
                );
                self.table.track(handle.clone());
                self.events
                    .status(&spec.name, ServiceState::Running, Some(handle.pid))
                    .await;
                Some(handle)
            }
            Err(err) => {
                tracing::warn!(service = %spec.name, error = %format!("{:#}", err), "service failed to start");
                self.events.status(&spec.name, ServiceState::Error, None).await;
                self.events
                    .log("ERROR", format!("{}: {:#}", spec.name, err))
                    .await;
                None
            }
        }
    }

    async fn try_launch(&self, spec: &ServiceSpec) -> Result<ProcessHandle> {
        let command = build_command(spec, &self.tools)?;
        if !command.cwd.is_dir() {
            bail!("working directory {} does not exist", command.cwd.display());
        }
        match &self.mode {
            LaunchMode::Detached { log_dir } => self.spawn_detached(spec, &command, log_dir),
            LaunchMode::Attached { use_pty: false } => self.spawn_pipes(spec, &command).await,
            LaunchMode::Attached { use_pty: true } => match self.pty.spawn(&command) {
                Ok(process) => Ok(self.attach_pty(spec, &command, process)),
                Err(err) if is_permission_denied(&err) => {
                    tracing::warn!(service = %spec.name, error = %format!("{:#}", err), "pty not permitted, using pipes");
                    self.events
                        .log(
                            &spec.name,
                            "warning: pseudo-terminal not permitted, falling back to pipes",
                        )
                        .await;
                    self.spawn_pipes(spec, &command).await
                }
                Err(err) => Err(err),
            },
        }
    }

    fn attach_pty(&self, spec: &ServiceSpec, command: &LaunchCommand, process: PtyProcess) -> ProcessHandle {
        let PtyProcess {
            pid,
            reader,
            mut child,
            master,
        } = process;
        let handle = self.handle(spec, command, pid, CaptureMode::Pty);

        let service = spec.name.clone();
        let logs = self.events.logs.clone();
        std::thread::spawn(move || forward_blocking_lines(service, reader, logs));

        let service = spec.name.clone();
        let status = self.events.clone();
        let table = self.table.clone();
        std::thread::spawn(move || {
            let _ = child.wait();
            drop(master);
            record_exit(&table, &service, pid);
            let _ = status
                .status
                .blocking_send(StatusUpdate::new(service, ServiceState::Stopped, Some(pid)));
        });
        handle
    }

    async fn spawn_pipes(&self, spec: &ServiceSpec, command: &LaunchCommand) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.cwd)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", command.program))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("{} exited before it could be tracked", spec.name))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(spec.name.clone(), stdout, self.events.logs.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(spec.name.clone(), stderr, self.events.logs.clone()));
        }

        let handle = self.handle(spec, command, pid, CaptureMode::Pipe);
        let service = spec.name.clone();
        let events = self.events.clone();
        let table = self.table.clone();
        tokio::spawn(async move {
            let _ = child.wait().await;
            record_exit(&table, &service, pid);
            events.status(service, ServiceState::Stopped, Some(pid)).await;
        });
        Ok(handle)
    }

    fn spawn_detached(
        &self,
        spec: &ServiceSpec,
        command: &LaunchCommand,
        log_dir: &Path,
    ) -> Result<ProcessHandle> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("failed to create {}", log_dir.display()))?;
        let log_path = log_dir.join(format!("{}.log", spec.name));
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("failed to open {}", log_path.display()))?;
        let stderr = stdout.try_clone()?;

        let mut cmd = std::process::Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.cwd)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", command.program))?;
        Ok(self.handle(spec, command, child.id(), CaptureMode::File))
    }

    fn handle(&self, spec: &ServiceSpec, command: &LaunchCommand, pid: u32, capture: CaptureMode) -> ProcessHandle {
        ProcessHandle {
            service: spec.name.clone(),
            pid,
            pgid: self.control.process_group(pid).unwrap_or(pid),
            started_at: Instant::now(),
            capture,
            state: ServiceState::Running,
            fingerprint: command.fingerprint(),
            cwd: command.cwd.clone(),
        }
    }
}

/// Releases the handle of an exited process and logs how long it ran.
fn record_exit(table: &ProcessTable, service: &str, pid: u32) {
    if let Some(handle) = table.release(service, pid) {
        tracing::info!(
            service,
            pid,
            state = handle.state.label(),
            uptime = ?handle.started_at.elapsed(),
            "service exited"
        );
    }
}

/// Splits services into (everything else, frontends), keeping input order within each.
pub fn launch_order(specs: &[ServiceSpec]) -> (Vec<&ServiceSpec>, Vec<&ServiceSpec>) {
    specs.iter().partition(|spec| !spec.is_frontend())
}

async fn forward_lines<R>(service: String, reader: R, logs: mpsc::Sender<LogLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = tokio::io::BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if logs
                    .send(LogLine::new(service.clone(), decode_line(&buf)))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

fn forward_blocking_lines(service: String, reader: Box<dyn Read + Send>, logs: mpsc::Sender<LogLine>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        // Linux reports EIO once the terminal's last writer is gone.
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if logs
                    .blocking_send(LogLine::new(service.clone(), decode_line(&buf)))
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{channels, EventReceivers};
    use crate::platform::SystemProcesses;
    use std::collections::HashMap;

    struct DeniedPty;

    impl PtyBackend for DeniedPty {
        fn spawn(&self, _command: &LaunchCommand) -> Result<PtyProcess> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
                .context("failed to allocate pseudo-terminal")
        }
    }

    struct BrokenPty;

    impl PtyBackend for BrokenPty {
        fn spawn(&self, _command: &LaunchCommand) -> Result<PtyProcess> {
            bail!("out of pty devices")
        }
    }

    fn tools() -> ToolResolver {
        ToolResolver::new(HashMap::new(), Vec::new())
    }

    fn launcher(pty: Arc<dyn PtyBackend>, mode: LaunchMode) -> (Launcher, EventReceivers, ProcessTable) {
        let (senders, receivers) = channels();
        let table = ProcessTable::new();
        let launcher = Launcher::new(
            tools(),
            pty,
            Arc::new(SystemProcesses),
            table.clone(),
            senders,
            mode,
        )
        .with_stagger(Duration::ZERO);
        (launcher, receivers, table)
    }

    fn container(name: &str, dir: &Path, command: &str) -> ServiceSpec {
        let mut spec = ServiceSpec::new(name, ServiceKind::Container, dir);
        spec.command = Some(command.to_string());
        spec
    }

    async fn next_status(rx: &mut EventReceivers) -> StatusUpdate {
        tokio::time::timeout(Duration::from_secs(5), rx.status.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn app_runs_through_poetry_with_port() {
        let mut spec = ServiceSpec::new("api", ServiceKind::App, "/srv/api");
        spec.port = Some(8000);
        let command = build_command(&spec, &tools()).unwrap();
        assert_eq!(command.program, "poetry");
        assert_eq!(command.args, vec!["run", "dev"]);
        assert_eq!(command.env["PORT"], "8000");
        assert_eq!(command.fingerprint(), "poetry run dev");
    }

    #[test]
    fn kinds_use_their_default_subcommands() {
        let worker = ServiceSpec::new("jobs", ServiceKind::Worker, "/srv/jobs");
        assert_eq!(build_command(&worker, &tools()).unwrap().args, vec!["run", "worker"]);

        let mut worker = worker;
        worker.worker_command = Some("celery".into());
        assert_eq!(build_command(&worker, &tools()).unwrap().args, vec!["run", "celery"]);

        let web = ServiceSpec::new("web", ServiceKind::Frontend, "/srv/web");
        let command = build_command(&web, &tools()).unwrap();
        assert_eq!((command.program.as_str(), command.args.clone()), ("bun", vec!["dev".to_string()]));
        assert!(!command.env.contains_key("PORT"));
    }

    #[test]
    fn container_splits_command_line() {
        let mut spec = ServiceSpec::new("db", ServiceKind::Container, "/srv/db");
        spec.docker_command = Some("docker compose up 'my db'".into());
        let command = build_command(&spec, &tools()).unwrap();
        assert_eq!(command.program, "docker");
        assert_eq!(command.args, vec!["compose", "up", "my db"]);
        assert_eq!(
            command.fingerprint(),
            "docker compose up my db"
        );
    }

    #[test]
    fn container_without_command_is_an_error() {
        let spec = ServiceSpec::new("db", ServiceKind::Container, "/srv/db");
        let err = build_command(&spec, &tools()).unwrap_err();
        assert_eq!(err.to_string(), "container service db missing command");
    }

    #[test]
    fn frontends_launch_last_in_input_order() {
        let specs = vec![
            ServiceSpec::new("admin", ServiceKind::Frontend, "/a"),
            ServiceSpec::new("api", ServiceKind::App, "/b"),
            ServiceSpec::new("portal", ServiceKind::Frontend, "/c"),
            ServiceSpec::new("worker", ServiceKind::Worker, "/d"),
        ];
        let (others, frontends) = launch_order(&specs);
        let names = |v: Vec<&ServiceSpec>| v.iter().map(|s| s.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(others), vec!["api", "worker"]);
        assert_eq!(names(frontends), vec!["admin", "portal"]);
    }

    #[test]
    fn permission_errors_are_found_in_the_chain() {
        let err = Err::<(), _>(io::Error::from(io::ErrorKind::PermissionDenied))
            .context("failed to allocate pseudo-terminal")
            .unwrap_err();
        assert!(is_permission_denied(&err));
        assert!(!is_permission_denied(&anyhow!("out of pty devices")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn denied_pty_falls_back_to_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let (launcher, mut rx, table) =
            launcher(Arc::new(DeniedPty), LaunchMode::Attached { use_pty: true });
        let spec = container("db", dir.path(), "sh -c 'echo hello'");

        let handle = launcher.launch(&spec).await.unwrap();
        assert_eq!(handle.capture, CaptureMode::Pipe);

        let first = rx.logs.recv().await.unwrap();
        assert_eq!(first.service, "db");
        assert!(first.text.contains("falling back to pipes"));
        let second = tokio::time::timeout(Duration::from_secs(5), rx.logs.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, LogLine::new("db", "hello"));

        assert_eq!(next_status(&mut rx).await.state, ServiceState::Starting);
        let running = next_status(&mut rx).await;
        assert_eq!((running.state, running.pid), (ServiceState::Running, Some(handle.pid)));
        assert_eq!(next_status(&mut rx).await.state, ServiceState::Stopped);
        assert!(table.get("db").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn other_pty_errors_fail_only_that_service() {
        let dir = tempfile::tempdir().unwrap();
        let (launcher, mut rx, table) =
            launcher(Arc::new(BrokenPty), LaunchMode::Attached { use_pty: true });
        let broken = container("db", dir.path(), "sh -c 'echo hello'");
        let missing = container("cache", dir.path(), "");

        let handles = launcher.launch_all(&[broken, missing]).await;
        assert!(handles.is_empty());
        assert!(table.is_empty());

        let mut errors = Vec::new();
        for _ in 0..4 {
            let update = next_status(&mut rx).await;
            if update.state == ServiceState::Error {
                errors.push(update.service);
            }
        }
        assert_eq!(errors, vec!["db", "cache"]);
        let line = rx.logs.recv().await.unwrap();
        assert_eq!(line.service, "ERROR");
        assert!(line.text.starts_with("db: "));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_working_directory_is_reported() {
        let (launcher, mut rx, _table) =
            launcher(Arc::new(NativePty), LaunchMode::Attached { use_pty: false });
        let spec = container("db", Path::new("/nonexistent/floppy-test"), "true");
        assert!(launcher.launch(&spec).await.is_none());
        assert_eq!(next_status(&mut rx).await.state, ServiceState::Starting);
        assert_eq!(next_status(&mut rx).await.state, ServiceState::Error);
        let line = rx.logs.recv().await.unwrap();
        assert!(line.text.contains("does not exist"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn detached_output_goes_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let (launcher, _rx, table) = launcher(
            Arc::new(NativePty),
            LaunchMode::Detached {
                log_dir: log_dir.clone(),
            },
        );
        let spec = container("db", dir.path(), "sh -c 'echo detached'");
        let handle = launcher.launch(&spec).await.unwrap();
        assert_eq!(handle.capture, CaptureMode::File);
        assert_eq!(handle.fingerprint, "sh -c echo detached");
        assert!(table.get("db").is_some());

        let log_path = log_dir.join("db.log");
        let mut contents = String::new();
        for _ in 0..50 {
            contents = std::fs::read_to_string(&log_path).unwrap_or_default();
            if !contents.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(contents.trim(), "detached");
    }

    #[tokio::test(start_paused = true)]
    async fn frontends_start_two_seconds_apart() {
        let (senders, mut receivers) = channels();
        let launcher = Launcher::new(
            tools(),
            Arc::new(NativePty),
            Arc::new(SystemProcesses),
            ProcessTable::new(),
            senders,
            LaunchMode::Attached { use_pty: false },
        );
        let missing = Path::new("/nonexistent/floppy-test");
        let specs = vec![
            ServiceSpec::new("admin", ServiceKind::Frontend, missing),
            ServiceSpec::new("api", ServiceKind::App, missing),
            ServiceSpec::new("portal", ServiceKind::Frontend, missing),
        ];

        let collector = tokio::spawn(async move {
            let mut starts = Vec::new();
            while let Some(update) = receivers.status.recv().await {
                if update.state == ServiceState::Starting {
                    starts.push((update.service, tokio::time::Instant::now()));
                }
            }
            starts
        });
        let began = tokio::time::Instant::now();
        launcher.launch_all(&specs).await;
        drop(launcher);
        let starts = collector.await.unwrap();

        let names: Vec<_> = starts.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["api", "admin", "portal"]);
        assert!(starts[1].1 - began < FRONTEND_STAGGER);
        assert!(starts[2].1 - starts[1].1 >= FRONTEND_STAGGER);
    }
}
