//! The live console loop.
//!
//! A 100ms ticker drains the log and status channels into the `App`, hands over
//! finished stats fetches and redraws. Terminal input and termination signals arrive
//! on a separate channel and are applied between ticks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::app::{App, AppAction};
use crate::clipboard;
use crate::events::{EventReceivers, InputEvent};
use crate::stats::{
    DatabaseStats, DockerSource, DockerStats, PostgresSource, StatsPoller, StatsSource,
    STATS_EVERY_TICKS,
};
use crate::tui::{self, TuiTerminal};

pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

const INPUT_CHANNEL_CAPACITY: usize = 256;

pub struct Console<D = PostgresSource, K = DockerSource>
where
    D: StatsSource<Snapshot = DatabaseStats>,
    K: StatsSource<Snapshot = DockerStats>,
{
    pub app: App,
    receivers: EventReceivers,
    database: Option<StatsPoller<D>>,
    docker: Option<StatsPoller<K>>,
    tick_count: u64,
}

impl Console {
    pub fn new(app: App, receivers: EventReceivers) -> Self {
        Self::with_sources(app, receivers, None, None)
    }

    pub fn with_database(mut self, url: &str) -> Self {
        self.app.enable_database_panel();
        self.database = Some(StatsPoller::new(PostgresSource::new(url)));
        self
    }

    pub fn with_docker(mut self) -> Self {
        self.app.enable_docker_panel();
        self.docker = Some(StatsPoller::new(DockerSource));
        self
    }
}

impl<D, K> Console<D, K>
where
    D: StatsSource<Snapshot = DatabaseStats>,
    K: StatsSource<Snapshot = DockerStats>,
{
    /// A console polling the given sources; each one present enables its panel.
    pub fn with_sources(
        mut app: App,
        receivers: EventReceivers,
        database: Option<D>,
        docker: Option<K>,
    ) -> Self {
        if database.is_some() {
            app.enable_database_panel();
        }
        if docker.is_some() {
            app.enable_docker_panel();
        }
        Self {
            app,
            receivers,
            database: database.map(StatsPoller::new),
            docker: docker.map(StatsPoller::new),
            tick_count: 0,
        }
    }

    /// Runs until the user quits. Returns whether the session was interrupted.
    pub async fn run(mut self, terminal: &mut TuiTerminal) -> Result<bool> {
        let (input_tx, mut input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        spawn_input_listener(input_tx.clone(), Arc::clone(&stop));
        spawn_signal_listener(input_tx);

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        let result = loop {
            tokio::select! {
                Some(event) = input_rx.recv() => {
                    if matches!(event, InputEvent::Resize) {
                        let _ = terminal.autoresize();
                    }
                    self.on_input(event);
                }
                _ = ticker.tick() => self.on_tick(),
            }
            if let Err(err) = tui::draw(&mut self.app, terminal) {
                break Err(err.into());
            }
            if self.app.should_quit {
                break Ok(self.app.interrupted);
            }
        };
        stop.store(true, Ordering::Relaxed);
        result
    }

    /// Drains everything queued, applies stats results and re-renders the log pane.
    pub fn on_tick(&mut self) {
        while let Ok(line) = self.receivers.logs.try_recv() {
            self.app.append_log(line);
        }
        while let Ok(update) = self.receivers.status.try_recv() {
            self.app.apply_status(update);
        }
        if let Some(result) = self.database.as_ref().and_then(StatsPoller::take) {
            self.app.apply_database(result);
        }
        if let Some(result) = self.docker.as_ref().and_then(StatsPoller::take) {
            self.app.apply_docker(result);
        }

        self.tick_count += 1;
        if self.tick_count % STATS_EVERY_TICKS == 1 {
            if let Some(poller) = &self.database {
                poller.kick();
            }
            if let Some(poller) = &self.docker {
                poller.kick();
            }
        }
        self.app.rebuild();
    }

    pub fn on_input(&mut self, event: InputEvent) {
        let action = match event {
            InputEvent::Key(key) => self.app.handle_key(key),
            InputEvent::Mouse(mouse) => self.app.handle_mouse(mouse),
            InputEvent::Resize => AppAction::None,
            InputEvent::Interrupt => self.app.quit(),
        };
        if let AppAction::Copy(text) = action {
            let result = clipboard::copy_text(&text);
            let message = clipboard::copy_feedback(&result);
            match result {
                Ok(_) => self.app.set_status_message(message),
                Err(err) => {
                    tracing::warn!(error = %format!("{:#}", err), "clipboard copy failed");
                    self.app.set_status_warning_for(message, Duration::from_secs(3));
                }
            }
        }
        self.app.rebuild();
    }
}

fn spawn_input_listener(tx: mpsc::Sender<InputEvent>, stop: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            if !crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
                continue;
            }
            let event = match crossterm::event::read() {
                Ok(crossterm::event::Event::Key(key)) => InputEvent::Key(key),
                Ok(crossterm::event::Event::Mouse(mouse)) => InputEvent::Mouse(mouse),
                Ok(crossterm::event::Event::Resize(_, _)) => InputEvent::Resize,
                _ => continue,
            };
            if tx.blocking_send(event).is_err() {
                break;
            }
        }
    });
}

fn spawn_signal_listener(tx: mpsc::Sender<InputEvent>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = tx.send(InputEvent::Interrupt).await;
    });
}
