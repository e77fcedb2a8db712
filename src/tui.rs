//! Terminal setup and dashboard rendering.
//!
//! Raw mode, the alternate screen and mouse capture are managed here; `draw` renders
//! the current `App` as a log pane on the left and status/stats panels on the right.

use std::io::{self, Stdout};

use crossterm::event::{DisableMouseCapture, EnableMouseCapture};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, SetTitle,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, Borders, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::{Frame, Terminal};

use crate::app::{App, Focus, LogViewport, PanelState, RenderedLine, StatusLevel};
use crate::process::ServiceState;
use crate::stats::{format_size, DatabaseStats, DockerStats};

pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

/// Width of the status and stats column.
pub const RIGHT_PANEL_WIDTH: u16 = 52;

const DATABASE_PANEL_HEIGHT: u16 = 8;
const DOCKER_PANEL_HEIGHT: u16 = 5;

/// Enables raw mode, enters the alternate screen and captures the mouse.
pub fn init_terminal() -> io::Result<TuiTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

pub fn restore_terminal(mut terminal: TuiTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;
    Ok(())
}

pub fn draw(app: &mut App, terminal: &mut TuiTerminal) -> io::Result<()> {
    execute!(terminal.backend_mut(), SetTitle(window_title(app)))?;
    terminal.draw(|frame| render(app, frame))?;
    Ok(())
}

fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.size();
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(1), Constraint::Length(1)])
        .split(area);
    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(20), Constraint::Length(RIGHT_PANEL_WIDTH)])
        .split(vertical[0]);

    render_logs(app, frame, body[0]);
    render_right(app, frame, body[1]);
    render_footer(app, frame, vertical[1]);
}

fn panel_block(title: &str, focused: bool) -> Block<'static> {
    let border = if focused { Color::Cyan } else { Color::DarkGray };
    Block::default()
        .title(title.to_string())
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(border))
}

fn render_logs(app: &mut App, frame: &mut Frame, area: Rect) {
    let title = if app.follow { "Logs (follow)" } else { "Logs" };
    let block = panel_block(title, app.focus == Focus::Logs);
    let inner = block.inner(area);
    app.set_log_viewport(LogViewport {
        x: inner.x,
        y: inner.y,
        width: inner.width,
        height: inner.height,
    });
    app.set_log_view_height(inner.height as usize);
    frame.render_widget(block, area);

    if app.rendered().is_empty() {
        let empty = Paragraph::new("No output yet").style(Style::default().fg(Color::DarkGray));
        frame.render_widget(empty, inner);
        return;
    }

    let selection = app.selection_range();
    let width = inner.width as usize;
    let lines: Vec<Line> = app
        .visible_lines()
        .iter()
        .map(|line| Line::from(line_spans(line, app.color_of(&line.service), selection, width)))
        .collect();
    frame.render_widget(Paragraph::new(Text::from(lines)), inner);
}

/// Splits a rendered line into styled spans: colored prefix, reversed selection,
/// cut at `width` chars.
fn line_spans(
    line: &RenderedLine,
    color: Color,
    selection: Option<(usize, usize)>,
    width: usize,
) -> Vec<Span<'static>> {
    let mut spans = Vec::new();
    let mut current = String::new();
    let mut current_style = None;
    for (idx, ch) in line.text.chars().take(width).enumerate() {
        let mut style = if idx < line.prefix_len {
            Style::default().fg(color)
        } else {
            Style::default()
        };
        let offset = line.start + idx;
        if matches!(selection, Some((start, end)) if offset >= start && offset < end) {
            style = style.add_modifier(Modifier::REVERSED);
        }
        if current_style.is_some_and(|s| s != style) {
            spans.push(Span::styled(std::mem::take(&mut current), current_style.unwrap_or_default()));
        }
        current_style = Some(style);
        current.push(ch);
    }
    if !current.is_empty() {
        spans.push(Span::styled(current, current_style.unwrap_or_default()));
    }
    spans
}

fn render_right(app: &App, frame: &mut Frame, area: Rect) {
    let mut constraints = vec![Constraint::Min(3)];
    if app.database.is_some() {
        constraints.push(Constraint::Length(DATABASE_PANEL_HEIGHT));
    }
    if app.docker.is_some() {
        constraints.push(Constraint::Length(DOCKER_PANEL_HEIGHT));
    }
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(area);

    render_status(app, frame, chunks[0]);
    let mut next = 1;
    if let Some(state) = &app.database {
        frame.render_widget(database_panel(state), chunks[next]);
        next += 1;
    }
    if let Some(state) = &app.docker {
        frame.render_widget(docker_panel(state), chunks[next]);
    }
}

fn render_status(app: &App, frame: &mut Frame, area: Rect) {
    let focused = app.focus == Focus::Status;
    let block = panel_block("Services", focused);
    let inner = block.inner(area);
    frame.render_widget(block, area);
    if inner.height == 0 {
        return;
    }

    let parts = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(0)])
        .split(inner);
    let header_style = if focused {
        Style::default().add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(Color::Gray)
    };
    frame.render_widget(
        Paragraph::new(Span::styled("    Service             Status    Port", header_style)),
        parts[0],
    );

    let rows = app.visible_rows();
    let items: Vec<ListItem> = rows
        .iter()
        .map(|row| {
            let checkbox = if app.is_visible(&row.name) { "[x]" } else { "[ ]" };
            let (glyph, glyph_style) = status_glyph(row.status);
            let port = row
                .port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            ListItem::new(Line::from(vec![
                Span::raw(format!("{} ", checkbox)),
                Span::styled(
                    format!("{:<19} ", truncate(&row.name, 19)),
                    Style::default().fg(app.color_of(&row.name)),
                ),
                Span::styled(format!("{:<7}", glyph), glyph_style),
                Span::raw(format!(" {:>5}", port)),
            ]))
        })
        .collect();

    let mut state = ListState::default();
    if focused && !rows.is_empty() {
        state.select(Some(app.selected.min(rows.len() - 1)));
    }
    let list = List::new(items).highlight_style(Style::default().add_modifier(Modifier::BOLD | Modifier::REVERSED));
    frame.render_stateful_widget(list, parts[1], &mut state);
}

pub fn status_glyph(state: Option<ServiceState>) -> (&'static str, Style) {
    match state {
        Some(ServiceState::Running) => ("● RUN", Style::default().fg(Color::Green)),
        Some(ServiceState::Starting) => ("○ ...", Style::default().fg(Color::Yellow)),
        Some(ServiceState::Error) => ("✗ ERR", Style::default().fg(Color::Red)),
        Some(ServiceState::Stopped) => ("○ ---", Style::default().fg(Color::DarkGray)),
        None => ("· ---", Style::default().fg(Color::DarkGray)),
    }
}

fn counter_line(label: &str, value: u32, warn: Color) -> Line<'static> {
    let style = if value > 0 {
        Style::default().fg(warn)
    } else {
        Style::default()
    };
    Line::from(Span::styled(format!("{:<14}{}", label, value), style))
}

fn database_panel(state: &PanelState<DatabaseStats>) -> Paragraph<'static> {
    let lines = match state {
        PanelState::Loading => vec![Line::from(Span::styled(
            " connecting…",
            Style::default().fg(Color::DarkGray),
        ))],
        PanelState::Failed(err) => vec![Line::from(Span::styled(
            format!("error: {}", err),
            Style::default().fg(Color::Red),
        ))],
        PanelState::Ready(stats) => {
            let conn_style = if stats.connections_high() {
                Style::default().fg(Color::Yellow)
            } else {
                Style::default()
            };
            let mut lines = vec![
                Line::from(vec![
                    Span::raw(format!("{:<14}", "Connections")),
                    Span::styled(
                        format!("{} / {}", stats.connections, stats.max_connections),
                        conn_style,
                    ),
                ]),
                counter_line("Idle in tx", stats.idle_in_transaction, Color::Yellow),
                counter_line("Long-running", stats.long_running, Color::Yellow),
                counter_line("Blocking", stats.blocking, Color::Red),
            ];
            if stats.cache_hit_ratio > 0.0 {
                lines.push(Line::from(format!(
                    "{:<14}{:.1}%",
                    "Cache hit",
                    stats.cache_hit_ratio * 100.0
                )));
            }
            if !stats.size.is_empty() {
                lines.push(Line::from(format!("{:<14}{}", "DB size", stats.size)));
            }
            lines
        }
    };
    Paragraph::new(lines)
        .block(panel_block("Postgres", false))
        .wrap(Wrap { trim: true })
}

fn docker_panel(state: &PanelState<DockerStats>) -> Paragraph<'static> {
    let lines = match state {
        PanelState::Loading => vec![Line::from(Span::styled(
            " loading…",
            Style::default().fg(Color::DarkGray),
        ))],
        PanelState::Failed(err) => vec![Line::from(Span::styled(
            format!("error: {}", err),
            Style::default().fg(Color::Red),
        ))],
        PanelState::Ready(stats) => {
            let ram = if stats.mem_limit > 0 {
                format!("{} / {}", format_size(stats.mem_used), format_size(stats.mem_limit))
            } else {
                format_size(stats.mem_used)
            };
            vec![
                Line::from(format!("{:<14}{}", "RAM", ram)),
                Line::from(format!("{:<14}{:.1}%", "CPU", stats.cpu_percent)),
                Line::from(format!("{:<14}{}", "Disk", format_size(stats.disk_used))),
            ]
        }
    };
    Paragraph::new(lines)
        .block(panel_block("Docker", false))
        .wrap(Wrap { trim: true })
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    let line = match app.status_message() {
        Some((text, StatusLevel::Info)) => Span::styled(text.to_string(), Style::default().fg(Color::Green)),
        Some((text, StatusLevel::Warning)) => Span::styled(text.to_string(), Style::default().fg(Color::Yellow)),
        None => Span::styled(app.footer_text(), Style::default().fg(Color::DarkGray)),
    };
    frame.render_widget(Paragraph::new(Line::from(line)), area);
}

fn window_title(app: &App) -> String {
    let running = app
        .visible_rows()
        .iter()
        .filter(|row| row.status == Some(ServiceState::Running))
        .count();
    format!("floppy · {} running", running)
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max.saturating_sub(1)).collect::<String>();
    out.push('~');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str, start: usize, prefix_len: usize) -> RenderedLine {
        RenderedLine {
            service: "api".to_string(),
            text: text.to_string(),
            start,
            prefix_len,
        }
    }

    fn contents(spans: &[Span]) -> Vec<String> {
        spans.iter().map(|s| s.content.to_string()).collect()
    }

    #[test]
    fn prefix_is_colored_and_rest_is_plain() {
        let spans = line_spans(&line("[api] ready", 0, 5), Color::Indexed(2), None, 80);
        assert_eq!(contents(&spans), vec!["[api]", " ready"]);
        assert_eq!(spans[0].style.fg, Some(Color::Indexed(2)));
    }

    #[test]
    fn selection_is_reversed_and_width_cuts() {
        let spans = line_spans(&line("[api] ready", 12, 5), Color::Indexed(2), Some((18, 20)), 9);
        assert_eq!(contents(&spans), vec!["[api]", " ", "re", "a"]);
        assert!(spans[2].style.add_modifier.contains(Modifier::REVERSED));
    }

    #[test]
    fn glyphs_per_state() {
        assert_eq!(status_glyph(Some(ServiceState::Running)).0, "● RUN");
        assert_eq!(status_glyph(Some(ServiceState::Error)).0, "✗ ERR");
        assert_eq!(status_glyph(None).0, "· ---");
    }
}
