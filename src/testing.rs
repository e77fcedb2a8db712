//! Fakes for the OS-facing traits, shared by the module tests.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

use anyhow::{bail, Result};

use crate::platform::{ProcessControl, Signal, SignalTarget};
use crate::ports::{PortOwner, PortProbe};

/// Probe answering from a fixed map of occupied ports.
#[derive(Default)]
pub struct FakeProbe {
    pub occupied: HashMap<u16, Vec<PortOwner>>,
    pub broken: Vec<u16>,
}

impl FakeProbe {
    pub fn with_owner(port: u16, pid: u32) -> Self {
        let mut occupied = HashMap::new();
        occupied.insert(
            port,
            vec![PortOwner {
                pid,
                description: format!("python (pid {}, dev)", pid),
            }],
        );
        Self {
            occupied,
            broken: Vec::new(),
        }
    }
}

impl PortProbe for FakeProbe {
    fn listeners(&self, port: u16) -> Result<Vec<PortOwner>> {
        if self.broken.contains(&port) {
            bail!("lsof not installed");
        }
        Ok(self.occupied.get(&port).cloned().unwrap_or_default())
    }
}

/// Records every signal instead of sending it. Pids with a command line are alive.
#[derive(Default)]
pub struct RecordingControl {
    pub sent: Mutex<Vec<(SignalTarget, Signal)>>,
    pub command_lines: HashMap<u32, String>,
}

impl RecordingControl {
    pub fn sent(&self) -> Vec<(SignalTarget, Signal)> {
        self.sent.lock().unwrap().clone()
    }
}

impl ProcessControl for RecordingControl {
    fn command_line(&self, pid: u32) -> Option<String> {
        self.command_lines.get(&pid).cloned()
    }

    fn process_group(&self, pid: u32) -> Option<u32> {
        self.command_lines.contains_key(&pid).then_some(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.command_lines.contains_key(&pid)
    }

    fn signal(&self, target: SignalTarget, signal: Signal) -> io::Result<()> {
        self.sent.lock().unwrap().push((target, signal));
        Ok(())
    }
}
