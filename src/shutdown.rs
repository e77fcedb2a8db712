//! Stopping services, in this session or started by an earlier one.
//!
//! Services with a primary port are stopped through whoever listens on it.
//! Portless services are stopped by signalling the process group recorded at launch,
//! after checking that the pid still belongs to them.

use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

use crate::platform::{is_no_such_process, ProcessControl, Signal, SignalTarget};
use crate::ports::PortProbe;
use crate::process::{ProcessTable, ServiceSpec, ServiceState};
use crate::state::{entry_is_live, ProcessStore};

/// How long to wait between the polite and the forced signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GracePeriods {
    /// After SIGTERM to a port owner.
    pub port: Duration,
    /// After SIGTERM to a process group.
    pub group: Duration,
}

impl Default for GracePeriods {
    fn default() -> Self {
        Self {
            port: Duration::from_millis(500),
            group: Duration::from_secs(1),
        }
    }
}

/// Sends SIGTERM, waits `grace`, then SIGKILL. A target that is already gone is success.
pub async fn terminate(
    control: &dyn ProcessControl,
    target: SignalTarget,
    grace: Duration,
) -> io::Result<()> {
    match control.signal(target, Signal::Terminate) {
        Ok(()) => {}
        Err(err) if is_no_such_process(&err) => return Ok(()),
        Err(err) => return Err(err),
    }
    if !grace.is_zero() {
        tokio::time::sleep(grace).await;
    }
    match control.signal(target, Signal::Kill) {
        Err(err) if !is_no_such_process(&err) => Err(err),
        _ => Ok(()),
    }
}

/// How a running service was found, which decides how it is stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Running {
    /// Listening on its primary port.
    Port { port: u16, pids: Vec<u32> },
    /// Known process group, from this session or a verified state entry.
    Group { pid: u32, pgid: u32 },
}

impl Running {
    pub fn pid(&self) -> Option<u32> {
        match self {
            Running::Port { pids, .. } => pids.first().copied(),
            Running::Group { pid, .. } => Some(*pid),
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Running::Port { port, .. } => Some(*port),
            Running::Group { .. } => None,
        }
    }
}

/// Outcome of stopping one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
    Failed(String),
}

pub struct ShutdownCoordinator<'a> {
    pub probe: &'a dyn PortProbe,
    pub control: &'a dyn ProcessControl,
    pub store: &'a ProcessStore,
    pub table: &'a ProcessTable,
    pub grace: GracePeriods,
}

impl ShutdownCoordinator<'_> {
    /// Finds which of `specs` are running right now, keyed by service name.
    ///
    /// State entries that fail verification are pruned from the store.
    pub fn detect(&self, specs: &[ServiceSpec]) -> BTreeMap<String, Running> {
        let persisted = self.store.load().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "ignoring unreadable process state");
            Default::default()
        });
        let mut stale = Vec::new();
        let mut running = BTreeMap::new();
        for spec in specs {
            if let Some(port) = spec.port {
                match self.probe.listeners(port) {
                    Ok(owners) if !owners.is_empty() => {
                        let pids = owners.iter().map(|o| o.pid).collect();
                        running.insert(spec.name.clone(), Running::Port { port, pids });
                        continue;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(service = %spec.name, port, error = %err, "could not check port");
                    }
                }
            }
            if let Some(handle) = self.table.get(&spec.name) {
                if handle.state == ServiceState::Running && self.control.is_alive(handle.pid) {
                    running.insert(
                        spec.name.clone(),
                        Running::Group {
                            pid: handle.pid,
                            pgid: handle.pgid,
                        },
                    );
                    continue;
                }
            }
            if let Some(entry) = persisted.entries.get(&spec.name) {
                if entry_is_live(self.control, entry) {
                    let pgid = self
                        .control
                        .process_group(entry.pid)
                        .unwrap_or(entry.pgid);
                    running.insert(
                        spec.name.clone(),
                        Running::Group {
                            pid: entry.pid,
                            pgid,
                        },
                    );
                } else {
                    stale.push(spec.name.clone());
                }
            }
        }
        if !stale.is_empty() {
            tracing::debug!(services = ?stale, "pruning stale process entries");
            if let Err(err) = self.store.remove(&stale) {
                tracing::warn!(error = %err, "failed to prune process state");
            }
        }
        running
    }

    /// Stops the named services, or every running one when `names` is empty.
    ///
    /// Never fails; each targeted service gets an outcome.
    pub async fn stop(
        &self,
        specs: &[ServiceSpec],
        names: &[String],
    ) -> Vec<(String, StopOutcome)> {
        let running = self.detect(specs);
        let targets: Vec<String> = if names.is_empty() {
            running.keys().cloned().collect()
        } else {
            names.to_vec()
        };

        let mut outcomes = Vec::new();
        for name in targets {
            let outcome = match running.get(&name) {
                None => StopOutcome::NotRunning,
                Some(found) => match self.stop_one(&name, found).await {
                    Ok(()) => StopOutcome::Stopped,
                    Err(err) => StopOutcome::Failed(err.to_string()),
                },
            };
            outcomes.push((name, outcome));
        }

        let handled: Vec<String> = outcomes
            .iter()
            .filter(|(_, outcome)| *outcome != StopOutcome::NotRunning)
            .map(|(name, _)| name.clone())
            .collect();
        if let Err(err) = self.store.remove(&handled) {
            tracing::warn!(error = %err, "failed to update process state");
        }
        outcomes
    }

    async fn stop_one(&self, service: &str, running: &Running) -> io::Result<()> {
        match running {
            Running::Port { port, pids } => {
                tracing::info!(service, port, ?pids, "stopping port owners");
                let mut result = Ok(());
                for pid in pids {
                    if let Err(err) =
                        terminate(self.control, SignalTarget::Process(*pid), self.grace.port).await
                    {
                        result = Err(err);
                    }
                }
                // The launcher's own process group may outlive the port owner.
                if let Some(handle) = self.table.get(service) {
                    if self.control.is_alive(handle.pid) {
                        terminate(self.control, SignalTarget::Group(handle.pgid), self.grace.group)
                            .await?;
                    }
                }
                result
            }
            Running::Group { pid, pgid } => {
                tracing::info!(service, pid, pgid, "stopping process group");
                let target = if *pgid > 0 {
                    SignalTarget::Group(*pgid)
                } else {
                    SignalTarget::Process(*pid)
                };
                terminate(self.control, target, self.grace.group).await
            }
        }
    }
}

/// One line per outcome, as printed by `stop`.
pub fn describe_outcome(service: &str, running_port: Option<u16>, outcome: &StopOutcome) -> String {
    match (outcome, running_port) {
        (StopOutcome::Stopped, _) => format!("Stopped {}", service),
        (StopOutcome::NotRunning, _) => format!("{} is not running", service),
        (StopOutcome::Failed(err), Some(port)) => {
            format!("Failed to stop {} (port {}): {}", service, port, err)
        }
        (StopOutcome::Failed(err), None) => format!("Failed to stop {}: {}", service, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProbe, RecordingControl};
    use crate::process::ServiceKind;
    use crate::state::ProcessEntry;
    use tempfile::tempdir;

    fn zero() -> GracePeriods {
        GracePeriods {
            port: Duration::ZERO,
            group: Duration::ZERO,
        }
    }

    fn store_with(dir: &std::path::Path, entries: Vec<ProcessEntry>) -> ProcessStore {
        let store = ProcessStore::new(dir.join("state.json"));
        store.record(entries).unwrap();
        store
    }

    fn entry(service: &str, pid: u32, cmdline: &str) -> ProcessEntry {
        ProcessEntry {
            service: service.to_string(),
            pid,
            pgid: pid,
            cwd: "/srv".to_string(),
            cmdline: cmdline.to_string(),
        }
    }

    #[tokio::test]
    async fn stops_port_services_through_their_listener() {
        let dir = tempdir().unwrap();
        let store = ProcessStore::new(dir.path().join("state.json"));
        let probe = FakeProbe::with_owner(8000, 4242);
        let control = RecordingControl::default();
        let table = ProcessTable::new();
        let coordinator = ShutdownCoordinator {
            probe: &probe,
            control: &control,
            store: &store,
            table: &table,
            grace: zero(),
        };
        let mut api = ServiceSpec::new("api", ServiceKind::App, "/srv/api");
        api.port = Some(8000);
        let outcomes = coordinator.stop(&[api], &[]).await;
        assert_eq!(outcomes, vec![("api".to_string(), StopOutcome::Stopped)]);
        assert_eq!(
            control.sent(),
            vec![
                (SignalTarget::Process(4242), Signal::Terminate),
                (SignalTarget::Process(4242), Signal::Kill),
            ]
        );
    }

    #[tokio::test]
    async fn stops_portless_services_by_group_after_verifying_fingerprint() {
        let dir = tempdir().unwrap();
        let store = store_with(
            dir.path(),
            vec![
                entry("worker", 700, "poetry run worker"),
                entry("reused", 800, "poetry run dev"),
            ],
        );
        let probe = FakeProbe::default();
        let mut control = RecordingControl::default();
        control
            .command_lines
            .insert(700, "/usr/bin/python poetry run worker".to_string());
        control
            .command_lines
            .insert(800, "/usr/sbin/sshd -D".to_string());
        let table = ProcessTable::new();
        let coordinator = ShutdownCoordinator {
            probe: &probe,
            control: &control,
            store: &store,
            table: &table,
            grace: zero(),
        };
        let specs = vec![
            ServiceSpec::new("worker", ServiceKind::Worker, "/srv/worker"),
            ServiceSpec::new("reused", ServiceKind::App, "/srv/reused"),
        ];
        let outcomes = coordinator.stop(&specs, &[]).await;
        assert_eq!(outcomes, vec![("worker".to_string(), StopOutcome::Stopped)]);
        assert_eq!(
            control.sent(),
            vec![
                (SignalTarget::Group(700), Signal::Terminate),
                (SignalTarget::Group(700), Signal::Kill),
            ]
        );
        assert!(store.load().unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn named_service_that_is_not_running_is_reported() {
        let dir = tempdir().unwrap();
        let store = ProcessStore::new(dir.path().join("state.json"));
        let probe = FakeProbe::default();
        let control = RecordingControl::default();
        let table = ProcessTable::new();
        let coordinator = ShutdownCoordinator {
            probe: &probe,
            control: &control,
            store: &store,
            table: &table,
            grace: zero(),
        };
        let specs = vec![ServiceSpec::new("api", ServiceKind::App, "/srv/api")];
        let outcomes = coordinator.stop(&specs, &["api".to_string()]).await;
        assert_eq!(outcomes, vec![("api".to_string(), StopOutcome::NotRunning)]);
        assert!(control.sent().is_empty());
    }

    #[test]
    fn outcome_lines() {
        assert_eq!(describe_outcome("api", Some(8000), &StopOutcome::Stopped), "Stopped api");
        assert_eq!(
            describe_outcome("api", Some(8000), &StopOutcome::Failed("EPERM".into())),
            "Failed to stop api (port 8000): EPERM"
        );
    }
}
