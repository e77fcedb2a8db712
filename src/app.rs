//! Dashboard state and input handling.
//!
//! `App` owns everything the console shows: the merged log ring, the service rows,
//! per-service filters and colors, the log selection and the stats panels. It is
//! mutated only by the console loop; rendering lives in `tui`.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers, MouseButton, MouseEvent, MouseEventKind};
use ratatui::style::Color;

use crate::events::StatusUpdate;
use crate::output::{sanitize_text, LogBuffer, LogLine, LOG_BUFFER_CAPACITY};
use crate::process::{ServiceSpec, ServiceState};
use crate::stats::{DatabaseStats, DockerStats, Fetched};

/// Service colors, handed out in first-seen order.
pub const PALETTE: [u8; 10] = [2, 3, 4, 5, 6, 9, 10, 11, 12, 13];

const WHEEL_LINES: usize = 3;

/// Which pane receives navigation keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    Logs,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    /// Typing the service-name filter.
    Filter,
}

/// Actions the console performs on behalf of the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    None,
    Quit,
    /// Put the text on the clipboard.
    Copy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
}

/// Screen area of the log text, set by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogViewport {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRow {
    pub name: String,
    /// `None` until the first status update.
    pub status: Option<ServiceState>,
    pub port: Option<u16>,
    pub pid: Option<u32>,
}

/// Content of an optional stats panel.
#[derive(Debug, Clone, PartialEq)]
pub enum PanelState<T> {
    Loading,
    Ready(T),
    Failed(String),
}

impl<T> From<Fetched<T>> for PanelState<T> {
    fn from(result: Fetched<T>) -> Self {
        match result {
            Ok(value) => PanelState::Ready(value),
            Err(err) => PanelState::Failed(err),
        }
    }
}

/// One line of the rendered log pane: `[service] text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedLine {
    pub service: String,
    pub text: String,
    /// Char offset of this line within the whole pane content.
    pub start: usize,
    /// Length in chars of the `[service]` prefix.
    pub prefix_len: usize,
}

impl RenderedLine {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

#[derive(Debug, Clone)]
struct StatusMessage {
    text: String,
    at: Instant,
    ttl: Duration,
    level: StatusLevel,
}

#[derive(Debug)]
pub struct App {
    logs: LogBuffer,
    rows: BTreeMap<String, ServiceRow>,
    filters: HashMap<String, bool>,
    colors: HashMap<String, Color>,
    pub focus: Focus,
    pub input_mode: InputMode,
    /// Case-insensitive substring filter over service rows.
    pub filter_text: String,
    /// Cursor within the filtered rows.
    pub selected: usize,
    pub follow: bool,
    /// Index of the first visible rendered line.
    pub scroll: usize,
    pub log_view_height: usize,
    rendered: Vec<RenderedLine>,
    content_chars: usize,
    selection: Option<(usize, usize)>,
    selecting: bool,
    log_viewport: Option<LogViewport>,
    pub database: Option<PanelState<DatabaseStats>>,
    pub docker: Option<PanelState<DockerStats>>,
    pub interrupted: bool,
    pub should_quit: bool,
    status_message: Option<StatusMessage>,
}

impl App {
    /// Seeds one row per service with its primary port.
    pub fn new(specs: &[ServiceSpec]) -> Self {
        let rows = specs
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    ServiceRow {
                        name: spec.name.clone(),
                        status: None,
                        port: spec.port,
                        pid: None,
                    },
                )
            })
            .collect();
        Self {
            logs: LogBuffer::new(LOG_BUFFER_CAPACITY),
            rows,
            filters: HashMap::new(),
            colors: HashMap::new(),
            focus: Focus::Logs,
            input_mode: InputMode::Normal,
            filter_text: String::new(),
            selected: 0,
            follow: true,
            scroll: 0,
            log_view_height: 0,
            rendered: Vec::new(),
            content_chars: 0,
            selection: None,
            selecting: false,
            log_viewport: None,
            database: None,
            docker: None,
            interrupted: false,
            should_quit: false,
            status_message: None,
        }
    }

    pub fn enable_database_panel(&mut self) {
        self.database = Some(PanelState::Loading);
    }

    pub fn enable_docker_panel(&mut self) {
        self.docker = Some(PanelState::Loading);
    }

    pub fn apply_database(&mut self, result: Fetched<DatabaseStats>) {
        self.database = Some(result.into());
    }

    pub fn apply_docker(&mut self, result: Fetched<DockerStats>) {
        self.docker = Some(result.into());
    }

    pub fn append_log(&mut self, line: LogLine) {
        let service = if line.service.is_empty() {
            "INFO".to_string()
        } else {
            line.service
        };
        self.see(&service);
        let dropped = self.logs.push(LogLine::new(service, sanitize_text(&line.text)));
        if dropped && !self.follow && self.scroll > 0 {
            self.scroll -= 1;
        }
    }

    pub fn apply_status(&mut self, update: StatusUpdate) {
        self.see(&update.service);
        let row = self
            .rows
            .entry(update.service.clone())
            .or_insert_with(|| ServiceRow {
                name: update.service.clone(),
                status: None,
                port: None,
                pid: None,
            });
        row.status = Some(update.state);
        if update.pid.is_some() {
            row.pid = update.pid;
        }
    }

    /// First sight of a service: visible, and the next palette color.
    fn see(&mut self, service: &str) {
        self.filters.entry(service.to_string()).or_insert(true);
        if !self.colors.contains_key(service) {
            let color = Color::Indexed(PALETTE[self.colors.len() % PALETTE.len()]);
            self.colors.insert(service.to_string(), color);
        }
    }

    pub fn color_of(&self, service: &str) -> Color {
        self.colors.get(service).copied().unwrap_or(Color::Reset)
    }

    pub fn is_visible(&self, service: &str) -> bool {
        self.filters.get(service).copied().unwrap_or(true)
    }

    #[cfg(test)]
    pub fn log_len(&self) -> usize {
        self.logs.len()
    }

    /// Rows matching the text filter, sorted by name.
    pub fn visible_rows(&self) -> Vec<&ServiceRow> {
        let needle = self.filter_text.to_lowercase();
        self.rows
            .values()
            .filter(|row| needle.is_empty() || row.name.to_lowercase().contains(&needle))
            .collect()
    }

    pub fn toggle_selected(&mut self) {
        let rows = self.visible_rows();
        if rows.is_empty() {
            return;
        }
        let idx = self.selected.min(rows.len() - 1);
        let name = rows[idx].name.clone();
        self.selected = idx;
        let visible = self.is_visible(&name);
        self.filters.insert(name, !visible);
    }

    /// Sets the filter of every row currently matching the text filter.
    pub fn set_visible_filters(&mut self, visible: bool) {
        let names: Vec<String> = self.visible_rows().iter().map(|r| r.name.clone()).collect();
        for name in names {
            self.filters.insert(name, visible);
        }
    }

    fn move_selection(&mut self, delta: isize) {
        let count = self.visible_rows().len();
        if count == 0 {
            self.selected = 0;
            return;
        }
        let next = self.selected as isize + delta;
        self.selected = next.clamp(0, count as isize - 1) as usize;
    }

    /// Re-renders the log pane content from the buffer and the filters.
    pub fn rebuild(&mut self) {
        let mut rendered = Vec::with_capacity(self.logs.len());
        let mut offset = 0;
        for line in self.logs.iter() {
            if !self.is_visible(&line.service) {
                continue;
            }
            let prefix = format!("[{}]", line.service);
            let prefix_len = prefix.chars().count();
            let text = format!("{} {}", prefix, line.text);
            let len = text.chars().count();
            rendered.push(RenderedLine {
                service: line.service.clone(),
                text,
                start: offset,
                prefix_len,
            });
            offset += len + 1;
        }
        self.content_chars = offset.saturating_sub(1);
        self.rendered = rendered;

        if let Some((start, end)) = self.selection {
            if start.max(end) > self.content_chars {
                self.clear_selection();
            }
        }
        let max = self.max_scroll();
        if self.follow {
            self.scroll = max;
        } else {
            self.scroll = self.scroll.min(max);
        }
    }

    pub fn rendered(&self) -> &[RenderedLine] {
        &self.rendered
    }

    /// Lines that fit in the log viewport at the current scroll position.
    pub fn visible_lines(&self) -> &[RenderedLine] {
        let start = self.scroll.min(self.rendered.len());
        let end = (start + self.log_view_height.max(1)).min(self.rendered.len());
        &self.rendered[start..end]
    }

    fn max_scroll(&self) -> usize {
        self.rendered.len().saturating_sub(self.log_view_height.max(1))
    }

    pub fn at_bottom(&self) -> bool {
        self.scroll >= self.max_scroll()
    }

    pub fn scroll_up(&mut self, amount: usize) {
        self.scroll = self.scroll.saturating_sub(amount);
        self.follow = self.at_bottom();
    }

    pub fn scroll_down(&mut self, amount: usize) {
        self.scroll = (self.scroll + amount).min(self.max_scroll());
        self.follow = self.at_bottom();
    }

    pub fn scroll_to_top(&mut self) {
        self.scroll = 0;
        self.follow = self.at_bottom();
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll = self.max_scroll();
        self.follow = true;
    }

    pub fn set_log_view_height(&mut self, height: usize) {
        self.log_view_height = height;
        let max = self.max_scroll();
        if self.follow {
            self.scroll = max;
        } else {
            self.scroll = self.scroll.min(max);
        }
    }

    pub fn set_log_viewport(&mut self, viewport: LogViewport) {
        self.log_viewport = Some(viewport);
    }

    /// Normalized, non-empty selection as char offsets.
    pub fn selection_range(&self) -> Option<(usize, usize)> {
        let (start, end) = self.selection?;
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        let end = end.min(self.content_chars);
        (start < end).then_some((start, end))
    }

    pub fn selection_text(&self) -> Option<String> {
        let (start, end) = self.selection_range()?;
        let content = self
            .rendered
            .iter()
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Some(content.chars().skip(start).take(end - start).collect())
    }

    pub fn clear_selection(&mut self) {
        self.selection = None;
        self.selecting = false;
    }

    /// Char offset under a screen cell of the log viewport.
    fn offset_at(&self, column: u16, row: u16) -> Option<usize> {
        let viewport = self.log_viewport?;
        if row < viewport.y || row >= viewport.y + viewport.height {
            return None;
        }
        if column < viewport.x || column >= viewport.x + viewport.width {
            return None;
        }
        let line = self.rendered.get(self.scroll + (row - viewport.y) as usize)?;
        let col = ((column - viewport.x) as usize).min(line.char_len());
        Some(line.start + col)
    }

    pub fn handle_mouse(&mut self, mouse: MouseEvent) -> AppAction {
        if self.focus != Focus::Logs {
            return AppAction::None;
        }
        match mouse.kind {
            MouseEventKind::Down(MouseButton::Left) => {
                if let Some(offset) = self.offset_at(mouse.column, mouse.row) {
                    self.follow = false;
                    self.selection = Some((offset, offset));
                    self.selecting = true;
                }
            }
            MouseEventKind::Drag(MouseButton::Left) => {
                if self.selecting {
                    if let Some(offset) = self.offset_at(mouse.column, mouse.row) {
                        if let Some((start, _)) = self.selection {
                            self.selection = Some((start, offset));
                        }
                    }
                }
            }
            MouseEventKind::Up(MouseButton::Left) => self.selecting = false,
            MouseEventKind::ScrollUp => self.scroll_up(WHEEL_LINES),
            MouseEventKind::ScrollDown => self.scroll_down(WHEEL_LINES),
            _ => {}
        }
        AppAction::None
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> AppAction {
        match self.input_mode {
            InputMode::Filter => self.handle_filter_input(key),
            InputMode::Normal => self.handle_normal_input(key),
        }
    }

    fn handle_filter_input(&mut self, key: KeyEvent) -> AppAction {
        match key.code {
            KeyCode::Esc => {
                self.input_mode = InputMode::Normal;
                self.filter_text.clear();
            }
            KeyCode::Enter => self.input_mode = InputMode::Normal,
            KeyCode::Backspace => {
                self.filter_text.pop();
            }
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.filter_text.push(c);
                self.selected = 0;
            }
            _ => {}
        }
        AppAction::None
    }

    fn handle_normal_input(&mut self, key: KeyEvent) -> AppAction {
        let status = self.focus == Focus::Status;
        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                if !status {
                    if let Some(text) = self.selection_text() {
                        return AppAction::Copy(text);
                    }
                }
                self.quit()
            }
            KeyCode::Char('q') => self.quit(),
            KeyCode::Tab => {
                self.focus = if status { Focus::Logs } else { Focus::Status };
                AppAction::None
            }
            KeyCode::Char('/') => {
                self.focus = Focus::Status;
                self.input_mode = InputMode::Filter;
                AppAction::None
            }
            KeyCode::Char(' ') if status => {
                self.toggle_selected();
                AppAction::None
            }
            KeyCode::Char('a') if status => {
                self.set_visible_filters(true);
                AppAction::None
            }
            KeyCode::Char('n') if status => {
                self.set_visible_filters(false);
                AppAction::None
            }
            KeyCode::Char('f') if !status => {
                self.follow = !self.follow;
                if self.follow {
                    self.scroll_to_bottom();
                }
                AppAction::None
            }
            KeyCode::Char('j') | KeyCode::Down => {
                if status {
                    self.move_selection(1);
                } else {
                    self.scroll_down(1);
                }
                AppAction::None
            }
            KeyCode::Char('k') | KeyCode::Up => {
                if status {
                    self.move_selection(-1);
                } else {
                    self.scroll_up(1);
                }
                AppAction::None
            }
            KeyCode::Char('g') => {
                if status {
                    self.selected = 0;
                } else {
                    self.scroll = 0;
                    self.follow = false;
                }
                AppAction::None
            }
            KeyCode::Char('G') | KeyCode::End => {
                if status {
                    self.selected = self.visible_rows().len().saturating_sub(1);
                } else {
                    self.scroll_to_bottom();
                }
                AppAction::None
            }
            KeyCode::PageUp => {
                self.scroll_up(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::PageDown => {
                self.scroll_down(self.log_view_height.max(1));
                AppAction::None
            }
            KeyCode::Home => {
                self.scroll_to_top();
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    /// Ends the loop; the caller stops this session's services.
    pub fn quit(&mut self) -> AppAction {
        self.interrupted = true;
        self.should_quit = true;
        AppAction::Quit
    }

    pub fn footer_text(&self) -> String {
        let mut keys = match self.focus {
            Focus::Logs => "keys: q quit • tab focus • / filter • space toggle • a all • n none • j/k scroll • g/G top/bottom • f follow • ctrl+c copy (select with mouse)",
            Focus::Status => "keys: q quit • tab focus • / filter • space toggle • a all • n none • j/k select • g/G top/bottom • esc clear filter",
        }
        .to_string();
        if !self.filter_text.is_empty() || self.input_mode == InputMode::Filter {
            keys.push_str(" • filter: ");
            keys.push_str(&self.filter_text);
            if self.input_mode == InputMode::Filter {
                keys.push_str(" (typing...)");
            }
        }
        keys
    }

    pub fn status_message(&self) -> Option<(&str, StatusLevel)> {
        let message = self.status_message.as_ref()?;
        (message.at.elapsed() < message.ttl).then_some((message.text.as_str(), message.level))
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.set_status(message, StatusLevel::Info, Duration::from_secs(3));
    }

    pub fn set_status_warning_for(&mut self, message: impl Into<String>, ttl: Duration) {
        self.set_status(message, StatusLevel::Warning, ttl);
    }

    fn set_status(&mut self, message: impl Into<String>, level: StatusLevel, ttl: Duration) {
        self.status_message = Some(StatusMessage {
            text: message.into(),
            at: Instant::now(),
            ttl,
            level,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ServiceKind;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn ctrl_c() -> KeyEvent {
        KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)
    }

    fn mouse(kind: MouseEventKind, column: u16, row: u16) -> MouseEvent {
        MouseEvent {
            kind,
            column,
            row,
            modifiers: KeyModifiers::NONE,
        }
    }

    fn make_app(names: &[&str]) -> App {
        let specs: Vec<_> = names
            .iter()
            .map(|name| ServiceSpec::new(*name, ServiceKind::App, "/srv"))
            .collect();
        let mut app = App::new(&specs);
        app.set_log_view_height(10);
        app
    }

    fn texts(app: &App) -> Vec<String> {
        app.rendered().iter().map(|l| l.text.clone()).collect()
    }

    #[test]
    fn first_status_makes_service_visible() {
        let mut app = make_app(&[]);
        app.apply_status(StatusUpdate::new("api", ServiceState::Starting, None));
        assert!(app.is_visible("api"));
        app.apply_status(StatusUpdate::new("api", ServiceState::Running, Some(42)));
        let rows = app.visible_rows();
        assert_eq!(rows[0].status, Some(ServiceState::Running));
        assert_eq!(rows[0].pid, Some(42));
    }

    #[test]
    fn colors_follow_first_seen_order_and_cycle() {
        let mut app = make_app(&[]);
        for i in 0..11 {
            app.append_log(LogLine::new(format!("svc{}", i), "x"));
        }
        app.append_log(LogLine::new("svc0", "again"));
        assert_eq!(app.color_of("svc0"), Color::Indexed(2));
        assert_eq!(app.color_of("svc1"), Color::Indexed(3));
        assert_eq!(app.color_of("svc9"), Color::Indexed(13));
        assert_eq!(app.color_of("svc10"), Color::Indexed(2));
    }

    #[test]
    fn empty_service_is_info_and_text_is_sanitized() {
        let mut app = make_app(&[]);
        app.append_log(LogLine::new("", "\u{1b}[1mboot\u{1b}[0m"));
        app.rebuild();
        assert_eq!(texts(&app), vec!["[INFO] boot"]);
    }

    #[test]
    fn none_then_all_only_touches_filtered_rows() {
        let mut app = make_app(&["api", "api-worker", "web"]);
        app.toggle_selected();
        assert!(!app.is_visible("api"));
        app.toggle_selected();

        app.filter_text = "API".to_string();
        app.set_visible_filters(false);
        assert!(!app.is_visible("api"));
        assert!(!app.is_visible("api-worker"));
        assert!(app.is_visible("web"));

        app.filters.insert("web".into(), false);
        app.set_visible_filters(true);
        assert!(app.is_visible("api"));
        assert!(app.is_visible("api-worker"));
        assert!(!app.is_visible("web"));
    }

    #[test]
    fn hidden_services_are_not_rendered() {
        let mut app = make_app(&["api", "web"]);
        app.append_log(LogLine::new("api", "a"));
        app.append_log(LogLine::new("web", "w"));
        app.focus = Focus::Status;
        app.handle_key(key(KeyCode::Char('j')));
        app.handle_key(key(KeyCode::Char(' ')));
        app.rebuild();
        assert_eq!(texts(&app), vec!["[api] a"]);
    }

    #[test]
    fn filter_typing_commits_and_cancels() {
        let mut app = make_app(&["api", "web"]);
        app.handle_key(key(KeyCode::Char('/')));
        assert_eq!((app.focus, app.input_mode), (Focus::Status, InputMode::Filter));
        app.handle_key(key(KeyCode::Char('q')));
        app.handle_key(key(KeyCode::Char('w')));
        app.handle_key(key(KeyCode::Backspace));
        app.handle_key(key(KeyCode::Char('w')));
        assert!(!app.should_quit);
        assert_eq!(app.filter_text, "qw");
        app.handle_key(key(KeyCode::Enter));
        assert_eq!((app.input_mode, app.filter_text.as_str()), (InputMode::Normal, "qw"));

        app.handle_key(key(KeyCode::Char('/')));
        app.handle_key(key(KeyCode::Esc));
        assert!(app.filter_text.is_empty());
        assert_eq!(app.visible_rows().len(), 2);
    }

    #[test]
    fn manual_scroll_disables_follow_and_end_restores_it() {
        let mut app = make_app(&["api"]);
        for i in 0..30 {
            app.append_log(LogLine::new("api", i.to_string()));
        }
        app.rebuild();
        assert_eq!(app.scroll, 20);
        app.handle_key(key(KeyCode::Char('k')));
        assert!(!app.follow);
        assert_eq!(app.scroll, 19);

        app.append_log(LogLine::new("api", "new"));
        app.rebuild();
        assert_eq!(app.scroll, 19);

        app.handle_key(key(KeyCode::Char('G')));
        assert!(app.follow);
        app.append_log(LogLine::new("api", "newer"));
        app.rebuild();
        assert_eq!(app.scroll, 22);

        app.handle_key(key(KeyCode::Char('g')));
        assert_eq!((app.scroll, app.follow), (0, false));
    }

    #[test]
    fn mouse_selection_copies_plain_text() {
        let mut app = make_app(&["api"]);
        app.append_log(LogLine::new("api", "hello"));
        app.append_log(LogLine::new("api", "world"));
        app.rebuild();
        app.set_log_viewport(LogViewport {
            x: 1,
            y: 1,
            width: 40,
            height: 10,
        });
        app.handle_mouse(mouse(MouseEventKind::Down(MouseButton::Left), 7, 1));
        assert!(!app.follow);
        app.handle_mouse(mouse(MouseEventKind::Drag(MouseButton::Left), 7, 2));
        app.handle_mouse(mouse(MouseEventKind::Up(MouseButton::Left), 7, 2));

        assert_eq!(app.handle_key(ctrl_c()), AppAction::Copy("hello\n[api] ".to_string()));
        assert!(!app.should_quit);
    }

    #[test]
    fn ctrl_c_without_selection_quits() {
        let mut app = make_app(&["api"]);
        assert_eq!(app.handle_key(ctrl_c()), AppAction::Quit);
        assert!(app.interrupted);
    }

    #[test]
    fn selection_survives_until_offsets_are_invalid() {
        let mut app = make_app(&["api"]);
        app.append_log(LogLine::new("api", "abcdef"));
        app.rebuild();
        app.selection = Some((2, 8));
        app.rebuild();
        assert_eq!(app.selection_text().as_deref(), Some("pi] ab"));

        app.filters.insert("api".into(), false);
        app.rebuild();
        assert!(app.selection_range().is_none());
    }

    #[test]
    fn failed_stats_fetch_shows_the_error() {
        let mut app = make_app(&[]);
        app.enable_database_panel();
        assert_eq!(app.database, Some(PanelState::Loading));
        app.apply_database(Err("psql timed out".into()));
        assert_eq!(app.database, Some(PanelState::Failed("psql timed out".into())));
    }
}
