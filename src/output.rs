//! Output handling and buffering for service logs.
//!
//! `LogLine` is the unit every reader forwards to the console, and `LogBuffer` is the
//! bounded ring the console keeps them in.

use std::collections::VecDeque;

use strip_ansi_escapes::strip;

/// Number of lines the dashboard keeps before evicting the oldest.
pub const LOG_BUFFER_CAPACITY: usize = 2000;

/// A single line of output attributed to a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Name of the service (or a pseudo-service such as `WARN`).
    pub service: String,
    /// The line without its terminator.
    pub text: String,
}

impl LogLine {
    pub fn new(service: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            text: text.into(),
        }
    }
}

/// A fixed-capacity ring buffer for storing `LogLine`s.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<LogLine>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: LogLine) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }
}

/// Prepares raw process output for display: ANSI sequences are removed, invalid
/// UTF-8 is replaced, and carriage-return redraws collapse to their final segment.
pub fn sanitize_text(text: &str) -> String {
    // The ANSI stripper also drops `\r`, so redraws collapse first.
    let last = last_redraw(text.trim_end_matches(['\r', '\n']));
    let stripped = strip(last.as_bytes());
    String::from_utf8_lossy(&stripped).into_owned()
}

fn last_redraw(text: &str) -> &str {
    text.rsplit('\r').next().unwrap_or("")
}

/// Decodes one raw line read from a process and drops its terminator.
pub fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.trim_end_matches(['\r', '\n']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_drops_oldest() {
        let mut buffer = LogBuffer::new(2);
        buffer.push(LogLine::new("api", "a"));
        buffer.push(LogLine::new("api", "b"));
        let dropped = buffer.push(LogLine::new("web", "c"));
        assert!(dropped);
        let lines = buffer.iter().map(|l| l.text.clone()).collect::<Vec<_>>();
        assert_eq!(lines, vec!["b", "c"]);
    }

    #[test]
    fn log_buffer_never_exceeds_capacity() {
        let mut buffer = LogBuffer::new(LOG_BUFFER_CAPACITY);
        for i in 0..(LOG_BUFFER_CAPACITY + 537) {
            buffer.push(LogLine::new("api", i.to_string()));
            assert!(buffer.len() <= LOG_BUFFER_CAPACITY);
        }
        assert_eq!(buffer.iter().next().unwrap().text, "537");
        assert_eq!(
            buffer.iter().last().unwrap().text,
            (LOG_BUFFER_CAPACITY + 536).to_string()
        );
    }

    #[test]
    fn sanitize_strips_ansi_and_carriage() {
        assert_eq!(sanitize_text("\u{1b}[32mready\u{1b}[0m"), "ready");
        assert_eq!(sanitize_text("10%\r50%\r100%"), "100%");
        assert_eq!(sanitize_text("done\r\n"), "done");
    }

    #[test]
    fn colored_progress_redraws_keep_only_the_last_frame() {
        let raw = "\u{1b}[36m[=>  ] 10%\u{1b}[0m\r\u{1b}[36m[===>] 90%\u{1b}[0m\r\u{1b}[32mdone\u{1b}[0m\r\n";
        assert_eq!(sanitize_text(raw), "done");
        assert_eq!(sanitize_text("spinner |\rspinner /\r"), "spinner /");
    }

    #[test]
    fn decode_line_drops_terminators_and_bad_bytes() {
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"a\xffb\n"), "a\u{fffd}b");
    }
}
