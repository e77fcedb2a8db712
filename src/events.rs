//! Channels and events that connect the launcher, the readers and the console.
//!
//! Producers (line readers, exit waiters, the launcher itself) only ever hold
//! `EventSenders`; the console owns the matching `EventReceivers`.

use crossterm::event::{KeyEvent, MouseEvent};
use tokio::sync::mpsc;

use crate::output::LogLine;
use crate::process::ServiceState;

/// Capacity of the shared log channel. A full channel blocks the sending reader.
pub const LOG_CHANNEL_CAPACITY: usize = 2048;
/// Capacity of the shared status channel.
pub const STATUS_CHANNEL_CAPACITY: usize = 64;

/// A lifecycle transition for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub service: String,
    pub state: ServiceState,
    pub pid: Option<u32>,
}

impl StatusUpdate {
    pub fn new(service: impl Into<String>, state: ServiceState, pid: Option<u32>) -> Self {
        Self {
            service: service.into(),
            state,
            pid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSenders {
    pub logs: mpsc::Sender<LogLine>,
    pub status: mpsc::Sender<StatusUpdate>,
}

impl EventSenders {
    pub async fn log(&self, service: impl Into<String>, text: impl Into<String>) {
        let _ = self.logs.send(LogLine::new(service, text)).await;
    }

    pub async fn status(&self, service: impl Into<String>, state: ServiceState, pid: Option<u32>) {
        let _ = self.status.send(StatusUpdate::new(service, state, pid)).await;
    }
}

#[derive(Debug)]
pub struct EventReceivers {
    pub logs: mpsc::Receiver<LogLine>,
    pub status: mpsc::Receiver<StatusUpdate>,
}

/// Creates the bounded log and status channels.
pub fn channels() -> (EventSenders, EventReceivers) {
    let (log_tx, log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
    let (status_tx, status_rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
    (
        EventSenders {
            logs: log_tx,
            status: status_tx,
        },
        EventReceivers {
            logs: log_rx,
            status: status_rx,
        },
    )
}

/// Input delivered to the console loop from outside the tick.
#[derive(Debug, Clone)]
pub enum InputEvent {
    /// A keyboard event received from the user.
    Key(KeyEvent),
    /// A mouse event received from the user.
    Mouse(MouseEvent),
    /// The terminal window was resized.
    Resize,
    /// SIGINT or SIGTERM arrived while the dashboard was running.
    Interrupt,
}
