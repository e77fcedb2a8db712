//! Port requirements, occupancy probing and conflict resolution.
//!
//! All ports a batch of services needs are checked before anything is launched, so a
//! conflict either aborts the whole batch or, with `force`, clears the way first.

use std::collections::BTreeMap;
use std::fmt;
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::error::UpError;
use crate::platform::{run_blocking, ProcessControl, SignalTarget};
use crate::process::ServiceSpec;
use crate::shutdown::terminate;

/// Websocket port the frontend bundler opens when none is configured.
pub const VITE_DEFAULT_WS_PORT: u16 = 24678;

/// A process listening on a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOwner {
    pub pid: u32,
    pub description: String,
}

/// A required port that is already taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConflict {
    pub port: u16,
    /// Labels of the requesting services, e.g. `web (HMR)`.
    pub services: Vec<String>,
    pub owners: Vec<PortOwner>,
}

impl fmt::Display for PortConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owners = self
            .owners
            .iter()
            .map(|o| o.description.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "port {} needed by {} is in use by {}",
            self.port,
            self.services.join(", "),
            owners
        )
    }
}

/// Reports who is listening on a TCP port.
pub trait PortProbe: Send + Sync {
    /// Listeners on `port`. An error means occupancy is unknown.
    fn listeners(&self, port: u16) -> Result<Vec<PortOwner>>;
}

/// Probes ports with `lsof`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LsofProbe;

impl PortProbe for LsofProbe {
    fn listeners(&self, port: u16) -> Result<Vec<PortOwner>> {
        let output = run_blocking(|| {
            Command::new("lsof")
                .args(["-nP", &format!("-iTCP:{}", port), "-sTCP:LISTEN"])
                .output()
        })
        .context("failed to run lsof")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.trim().is_empty() {
                return Ok(Vec::new());
            }
            bail!("lsof failed: {}", stderr.trim());
        }
        Ok(parse_lsof(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parses `lsof` rows into owners, one per pid.
pub fn parse_lsof(stdout: &str) -> Vec<PortOwner> {
    let mut owners: BTreeMap<u32, PortOwner> = BTreeMap::new();
    for line in stdout.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 3 {
            continue;
        }
        let Ok(pid) = cols[1].parse::<u32>() else {
            continue;
        };
        owners.entry(pid).or_insert_with(|| PortOwner {
            pid,
            description: format!("{} (pid {}, {})", cols[0], pid, cols[2]),
        });
    }
    owners.into_values().collect()
}

/// Every port the services need, each with the labels of who needs it.
pub fn required_ports(specs: &[ServiceSpec]) -> BTreeMap<u16, Vec<String>> {
    let mut ports: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    let mut add = |port: u16, label: String| {
        if port > 0 {
            ports.entry(port).or_default().push(label);
        }
    };
    for spec in specs {
        if let Some(port) = spec.port {
            add(port, format!("{} (main)", spec.name));
        }
        if spec.is_frontend() {
            if let Some(port) = spec.hmr_port {
                add(port, format!("{} (HMR)", spec.name));
            }
            if let Some(port) = spec.ws_port {
                add(port, format!("{} (WebSocket)", spec.name));
            }
            add(
                VITE_DEFAULT_WS_PORT,
                format!("{} (Vite default WebSocket)", spec.name),
            );
        }
    }
    ports
}

/// Probes every required port. Probe failures are logged and treated as free.
pub fn find_conflicts(
    probe: &dyn PortProbe,
    required: &BTreeMap<u16, Vec<String>>,
) -> Vec<PortConflict> {
    let mut conflicts = Vec::new();
    for (port, services) in required {
        match probe.listeners(*port) {
            Ok(owners) if owners.is_empty() => {}
            Ok(owners) => conflicts.push(PortConflict {
                port: *port,
                services: services.clone(),
                owners,
            }),
            Err(err) => {
                tracing::warn!(port, error = %err, "could not check port, assuming free");
            }
        }
    }
    conflicts
}

/// Checks the ports for `specs` and, when `force` is set, kills whoever holds them.
///
/// Returns the conflicts that were cleared (empty when every port was free).
pub async fn resolve_ports(
    probe: &dyn PortProbe,
    control: &dyn ProcessControl,
    specs: &[ServiceSpec],
    force: bool,
    grace: Duration,
) -> Result<Vec<PortConflict>, UpError> {
    let conflicts = find_conflicts(probe, &required_ports(specs));
    if conflicts.is_empty() {
        return Ok(conflicts);
    }
    if !force {
        return Err(UpError::PortConflicts(conflicts));
    }
    for conflict in &conflicts {
        for owner in &conflict.owners {
            tracing::warn!(port = conflict.port, pid = owner.pid, "killing port owner");
            if let Err(err) = terminate(control, SignalTarget::Process(owner.pid), grace).await {
                tracing::warn!(port = conflict.port, pid = owner.pid, error = %err, "failed to kill port owner");
            }
        }
    }
    Ok(conflicts)
}

/// Human-readable report, one conflict per line.
pub fn format_conflicts(conflicts: &[PortConflict]) -> String {
    conflicts
        .iter()
        .map(|c| format!("  {}", c))
        .collect::<Vec<_>>()
        .join("\n")
}
