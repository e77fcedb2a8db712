//! The commands behind the CLI: `up`, `stop`, `ps`, `list` and `doctor`.
//!
//! `Orchestrator` wires the config to the port resolver, the launcher, the console
//! and the shutdown coordinator. Every OS-facing collaborator sits behind a trait
//! object so the flows can be driven with fakes.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::app::App;
use crate::config::{services_root, Config};
use crate::console::Console;
use crate::error::UpError;
use crate::events::{channels, EventReceivers};
use crate::launcher::{LaunchMode, Launcher, NativePty, PtyBackend};
use crate::platform::{ProcessControl, SystemProcesses};
use crate::ports::{format_conflicts, resolve_ports, LsofProbe, PortProbe};
use crate::process::{ProcessHandle, ProcessTable, ServiceSpec, ServiceState};
use crate::shutdown::{describe_outcome, GracePeriods, ShutdownCoordinator};
use crate::state::{ProcessEntry, ProcessStore};
use crate::toolchain::{ToolResolver, BUN, POETRY, PYTHON};
use crate::tui;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpOptions {
    /// Leave services running and return immediately.
    pub detached: bool,
    /// Kill whatever holds a required port.
    pub force: bool,
    /// Capture output with pipes instead of a pseudo-terminal.
    pub no_pty: bool,
}

pub struct Orchestrator {
    config: Config,
    config_path: PathBuf,
    root: PathBuf,
    probe: Arc<dyn PortProbe>,
    control: Arc<dyn ProcessControl>,
    pty: Arc<dyn PtyBackend>,
    store: ProcessStore,
    tools: ToolResolver,
    table: ProcessTable,
    grace: GracePeriods,
}

impl Orchestrator {
    /// Uses the host's port probe, process control and pseudo-terminals.
    pub fn new(config: Config, config_path: PathBuf) -> Self {
        let root = services_root(&config_path);
        Self {
            config,
            config_path,
            root,
            probe: Arc::new(LsofProbe),
            control: Arc::new(SystemProcesses),
            pty: Arc::new(NativePty),
            store: ProcessStore::from_env(),
            tools: ToolResolver::from_env(),
            table: ProcessTable::new(),
            grace: GracePeriods::default(),
        }
    }

    fn coordinator(&self) -> ShutdownCoordinator<'_> {
        ShutdownCoordinator {
            probe: self.probe.as_ref(),
            control: self.control.as_ref(),
            store: &self.store,
            table: &self.table,
            grace: self.grace,
        }
    }

    fn launcher(&self, mode: LaunchMode) -> (Launcher, EventReceivers) {
        let (senders, receivers) = channels();
        let launcher = Launcher::new(
            self.tools.clone(),
            Arc::clone(&self.pty),
            Arc::clone(&self.control),
            self.table.clone(),
            senders,
            mode,
        );
        (launcher, receivers)
    }

    /// Resolves the services, clears or reports port conflicts, then launches.
    pub async fn up(&self, names: &[String], options: UpOptions) -> Result<()> {
        let names = self.config.expand(names)?;
        let specs = self.config.resolve(&names, &self.root)?;

        match resolve_ports(
            self.probe.as_ref(),
            self.control.as_ref(),
            &specs,
            options.force,
            self.grace.port,
        )
        .await
        {
            Ok(cleared) if !cleared.is_empty() => {
                println!("Stopped processes holding required ports:");
                println!("{}", format_conflicts(&cleared));
            }
            Ok(_) => {}
            Err(UpError::PortConflicts(conflicts)) => {
                println!("Port conflicts:");
                println!("{}", format_conflicts(&conflicts));
                println!("Run with --force to stop them.");
                return Err(UpError::PortConflicts(conflicts).into());
            }
            Err(err) => return Err(err.into()),
        }

        if options.detached {
            self.up_detached(&specs).await
        } else {
            self.up_attached(&specs, options.no_pty).await
        }
    }

    async fn up_detached(&self, specs: &[ServiceSpec]) -> Result<()> {
        let log_dir = self.store.dir().join("logs");
        let (launcher, receivers) = self.launcher(LaunchMode::Detached {
            log_dir: log_dir.clone(),
        });
        let printer = tokio::spawn(print_events(receivers));
        let handles = launcher.launch_all(specs).await;
        drop(launcher);
        let _ = printer.await;

        self.persist(&handles);
        println!("Logs: {}", log_dir.display());
        Ok(())
    }

    async fn up_attached(&self, specs: &[ServiceSpec], no_pty: bool) -> Result<()> {
        // Nothing is launched unless the console can take the terminal.
        let mut terminal = tui::init_terminal()?;

        let (launcher, receivers) = self.launcher(LaunchMode::Attached { use_pty: !no_pty });
        let store = self.store.clone();
        let to_launch = specs.to_vec();
        let launching = tokio::spawn(async move {
            let handles = launcher.launch_all(&to_launch).await;
            persist_handles(&store, &handles);
        });

        let mut console = Console::new(App::new(specs), receivers);
        if let Some(url) = self.config.stats.database_url.as_deref() {
            console = console.with_database(url);
        }
        if self.config.stats.docker {
            console = console.with_docker();
        }

        let outcome = console.run(&mut terminal).await;
        let restored = tui::restore_terminal(terminal);
        self.finish_session(specs, launching, outcome).await?;
        restored?;
        Ok(())
    }

    /// Records and, unless the console ended cleanly without a quit, stops what
    /// this session launched.
    async fn finish_session(
        &self,
        specs: &[ServiceSpec],
        launching: JoinHandle<()>,
        outcome: Result<bool>,
    ) -> Result<()> {
        launching.abort();
        let _ = launching.await;
        // Handles launched before the abort were never persisted by the task.
        self.persist(&self.table.snapshot());

        if let Err(err) = &outcome {
            tracing::warn!(error = %format!("{:#}", err), "console failed, stopping services");
        }
        if !matches!(outcome, Ok(false)) {
            println!("Stopping services...");
            let names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
            self.report_stop(specs, &names).await;
        }
        outcome.map(|_| ())
    }

    fn persist(&self, handles: &[ProcessHandle]) {
        persist_handles(&self.store, handles);
    }

    /// Stops the named services (bundles expand), or everything running.
    pub async fn stop(&self, names: &[String]) -> Result<()> {
        let specs = self.config.all_specs(&self.root);
        let targets = if names.is_empty() {
            Vec::new()
        } else {
            self.config.expand(names).unwrap_or_else(|_| names.to_vec())
        };
        if !self.report_stop(&specs, &targets).await {
            println!("No services running");
        }
        Ok(())
    }

    async fn report_stop(&self, specs: &[ServiceSpec], names: &[String]) -> bool {
        let outcomes = self.coordinator().stop(specs, names).await;
        for (name, outcome) in &outcomes {
            let port = specs.iter().find(|s| &s.name == name).and_then(|s| s.port);
            println!("{}", describe_outcome(name, port, outcome));
        }
        !outcomes.is_empty()
    }

    pub fn ps(&self, quiet: bool) -> Result<()> {
        let specs = self.config.all_specs(&self.root);
        let running = self.coordinator().detect(&specs);
        if quiet {
            for name in running.keys() {
                println!("{}", name);
            }
            return Ok(());
        }
        if running.is_empty() {
            println!("No services running");
            return Ok(());
        }
        println!("{:<24} {:<10} {:>6} {:>8}", "SERVICE", "STATUS", "PORT", "PID");
        for (name, found) in &running {
            let port = found
                .port()
                .or_else(|| specs.iter().find(|s| &s.name == name).and_then(|s| s.port))
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            let pid = found
                .pid()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<24} {:<10} {:>6} {:>8}",
                name,
                ServiceState::Running.label(),
                port,
                pid
            );
        }
        Ok(())
    }

    pub fn list(&self, grouped: bool) -> Result<()> {
        let specs = self.config.all_specs(&self.root);
        if grouped {
            let mut by_kind: BTreeMap<_, Vec<&ServiceSpec>> = BTreeMap::new();
            for spec in &specs {
                by_kind.entry(spec.kind).or_default().push(spec);
            }
            for (kind, members) in by_kind {
                println!("{}:", kind);
                for spec in members {
                    println!("  {}", service_line(spec, &self.root));
                }
            }
        } else {
            println!(
                "{:<20} {:<10} {:>6}  {:<30} {}",
                "SERVICE", "TYPE", "PORT", "PATH", "REPO"
            );
            for spec in &specs {
                println!("{}", service_line(spec, &self.root));
            }
        }
        if !self.config.bundles.is_empty() {
            println!();
            println!("Bundles:");
            for (name, members) in &self.config.bundles {
                println!("  {:<18} {}", name, members.join(", "));
            }
        }
        Ok(())
    }

    /// Prints where everything resolves to and what is missing.
    pub fn doctor(&self) -> Result<()> {
        println!("config:        {}", self.config_path.display());
        println!("services root: {}", self.root.display());
        println!("state file:    {}", self.store.path().display());
        for tool in [POETRY, BUN, PYTHON] {
            println!("{:<14} {}", format!("{}:", tool.name), self.tools.resolve(tool));
        }
        for program in ["lsof", "docker", "psql"] {
            let found = locate(program, std::env::var_os("PATH"))
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "not found".to_string());
            println!("{:<14} {}", format!("{}:", program), found);
        }
        let missing: Vec<_> = self
            .config
            .all_specs(&self.root)
            .into_iter()
            .filter(|spec| !spec.dir.is_dir())
            .collect();
        if missing.is_empty() {
            println!("all service directories present");
        } else {
            println!("missing service directories:");
            for spec in missing {
                println!("  {:<18} {}", spec.name, spec.dir.display());
            }
        }
        Ok(())
    }
}

fn persist_handles(store: &ProcessStore, handles: &[ProcessHandle]) {
    if handles.is_empty() {
        return;
    }
    if let Err(err) = store.record(handles.iter().map(ProcessEntry::from)) {
        tracing::warn!(error = %format!("{:#}", err), "failed to record process state");
    }
}

/// Prints launch progress for detached mode until every sender is gone.
async fn print_events(mut receivers: EventReceivers) {
    let mut logs_open = true;
    let mut status_open = true;
    while logs_open || status_open {
        tokio::select! {
            update = receivers.status.recv(), if status_open => match update {
                Some(update) if update.state == ServiceState::Running => {
                    match update.pid {
                        Some(pid) => println!("Started {} (pid {})", update.service, pid),
                        None => println!("Started {}", update.service),
                    }
                }
                Some(_) => {}
                None => status_open = false,
            },
            line = receivers.logs.recv(), if logs_open => match line {
                Some(line) if line.service == "ERROR" => println!("Failed to start {}", line.text),
                Some(line) => println!("[{}] {}", line.service, line.text),
                None => logs_open = false,
            },
        }
    }
}

fn service_line(spec: &ServiceSpec, root: &Path) -> String {
    let port = spec
        .port
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    let path = spec.dir.strip_prefix(root).unwrap_or(&spec.dir);
    format!(
        "{:<20} {:<10} {:>6}  {:<30} {}",
        spec.name,
        spec.kind,
        port,
        path.display(),
        spec.repo.as_deref().unwrap_or("-")
    )
}

/// Executable `program` found on `paths`.
fn locate(program: &str, paths: Option<OsString>) -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    which::which_in(program, paths, cwd).ok()
}
