use thiserror::Error;

use crate::ports::PortConflict;

/// Errors that abort `up` before any process is touched.
#[derive(Debug, Error)]
pub enum UpError {
    #[error("no services to start")]
    NoServices,

    #[error("unknown service or bundle: {0}")]
    UnknownService(String),

    #[error("port conflicts: {}", format_ports(.0))]
    PortConflicts(Vec<PortConflict>),
}

fn format_ports(conflicts: &[PortConflict]) -> String {
    conflicts
        .iter()
        .map(|c| c.port.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
