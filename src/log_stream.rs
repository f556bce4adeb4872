//! Line decoding for container output streams
//!
//! Docker delivers stdout/stderr as frames that may split lines anywhere.
//! [`LogStreamProcessor`] reassembles lines per stream, strips the JSON log
//! envelope the ICM processes emit, picks up structured completion results
//! and a ready marker, and forwards each line to an [`OutputSink`].

use std::io::Write;
use std::sync::{Arc, Mutex};

use bollard::container::LogOutput;
use regex::Regex;

/// Which output stream a frame or line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Structured outcome of a one-shot command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i64,
    pub message: String,
    pub success_count: u32,
    pub failure_count: u32,
}

/// Destination for decoded lines.
pub trait OutputSink: Send {
    fn line(&mut self, stream: StreamKind, line: &str);
}

/// Writes lines to the local stdout/stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl OutputSink for ConsoleSink {
    fn line(&mut self, stream: StreamKind, line: &str) {
        // A closed console must not abort the command being watched.
        let _ = match stream {
            StreamKind::Stdout => writeln!(std::io::stdout().lock(), "{line}"),
            StreamKind::Stderr => writeln!(std::io::stderr().lock(), "{line}"),
        };
    }
}

/// Keeps every line in memory; clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    lines: Arc<Mutex<Vec<(StreamKind, String)>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(StreamKind, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Lines seen on one stream only.
    pub fn stream(&self, kind: StreamKind) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, line)| line)
            .collect()
    }
}

impl OutputSink for CollectingSink {
    fn line(&mut self, stream: StreamKind, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((stream, line.to_owned()));
        }
    }
}

/// Regexes recognizing a completion summary such as
/// `DBInit with 12 initialization steps ... success: 10 ... failure: 2`.
#[derive(Debug, Clone)]
pub struct ResultPattern {
    completion: Regex,
    success: Regex,
    failure: Regex,
}

impl ResultPattern {
    /// Summary line printed by `dbinit` and `dbprepare`.
    pub fn initialization_summary() -> Result<Self, regex::Error> {
        Self::new(r"\w+ with \d+ initialization steps", r"success:\s*(\d+)", r"failure:\s*(\d+)")
    }

    pub fn new(completion: &str, success: &str, failure: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            completion: Regex::new(completion)?,
            success: Regex::new(success)?,
            failure: Regex::new(failure)?,
        })
    }

    /// Parse a line; `None` unless it is a completion summary.
    pub fn parse(&self, line: &str) -> Option<ExecResult> {
        if !self.completion.is_match(line) {
            return None;
        }
        Some(ExecResult {
            exit_code: 0,
            message: line.trim().to_owned(),
            success_count: capture_count(&self.success, line),
            failure_count: capture_count(&self.failure, line),
        })
    }
}

fn capture_count(regex: &Regex, line: &str) -> u32 {
    regex
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Extract the human message from a structured log line.
///
/// Handles proper JSON (`{"message":"...","logger_name":"..."}`) and the
/// loose `message: ... logger_name:` form. Lines without an envelope are
/// returned unchanged.
pub fn strip_envelope(line: &str) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(line.trim()) {
        if let Some(serde_json::Value::String(message)) = map.get("message") {
            return message.clone();
        }
    }
    match loose_message(line) {
        Some(span) => span
            .trim_matches(|c: char| c == '"' || c == ':' || c == ',' || c.is_whitespace())
            .to_owned(),
        None => line.to_owned(),
    }
}

/// Value of a `message` key that opens the line or follows `"`, `{` or `,`.
fn loose_message(line: &str) -> Option<&str> {
    const KEY: &str = "message";
    let mut from = 0;
    while let Some(offset) = line.get(from..)?.find(KEY) {
        let start = from + offset;
        from = start + KEY.len();
        let before = line.get(..start)?.trim_end();
        if !(before.is_empty() || before.ends_with(['"', '{', ','])) {
            continue;
        }
        let after = line.get(from..)?;
        let after = after.strip_prefix('"').unwrap_or(after).trim_start();
        if let Some(value) = after.strip_prefix(':') {
            return Some(value.split_once("logger_name").map_or(value, |(message, _)| message));
        }
    }
    None
}

/// Bytes of the line in progress on one stream.
#[derive(Default)]
struct LineBuffer {
    bytes: Vec<u8>,
    after_cr: bool,
}

/// Per-invocation stream decoder.
pub struct LogStreamProcessor {
    stdout: LineBuffer,
    stderr: LineBuffer,
    ready_marker: Option<String>,
    ready: bool,
    result_pattern: Option<ResultPattern>,
    result: Option<ExecResult>,
    json_passthrough: bool,
    sink: Box<dyn OutputSink>,
}

impl LogStreamProcessor {
    pub fn new(sink: impl OutputSink + 'static) -> Self {
        Self {
            stdout: LineBuffer::default(),
            stderr: LineBuffer::default(),
            ready_marker: None,
            ready: false,
            result_pattern: None,
            result: None,
            json_passthrough: false,
            sink: Box::new(sink),
        }
    }

    /// Processor that writes to the console.
    pub fn console() -> Self {
        Self::new(ConsoleSink)
    }

    #[must_use]
    pub fn with_ready_marker(mut self, marker: impl Into<String>) -> Self {
        self.ready_marker = Some(marker.into());
        self
    }

    #[must_use]
    pub fn with_result_pattern(mut self, pattern: ResultPattern) -> Self {
        self.result_pattern = Some(pattern);
        self
    }

    /// Forward raw lines instead of extracted messages.
    #[must_use]
    pub fn with_json_passthrough(mut self, enabled: bool) -> Self {
        self.json_passthrough = enabled;
        self
    }

    /// Feed one frame from the daemon.
    pub fn on_output(&mut self, output: LogOutput) {
        match output {
            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                self.on_chunk(StreamKind::Stdout, &message);
            }
            LogOutput::StdErr { message } => self.on_chunk(StreamKind::Stderr, &message),
            LogOutput::StdIn { .. } => {}
        }
    }

    /// Append bytes and dispatch every line completed by `\n`, `\r` or `\r\n`.
    pub fn on_chunk(&mut self, stream: StreamKind, bytes: &[u8]) {
        for &byte in bytes {
            let buffer = self.buffer(stream);
            let after_cr = std::mem::replace(&mut buffer.after_cr, byte == b'\r');
            match byte {
                b'\n' if after_cr => {}
                b'\n' | b'\r' => {
                    let line = std::mem::take(&mut buffer.bytes);
                    self.dispatch(stream, &line);
                }
                _ => buffer.bytes.push(byte),
            }
        }
    }

    /// Dispatch any unterminated trailing lines.
    pub fn finish(&mut self) {
        for stream in [StreamKind::Stdout, StreamKind::Stderr] {
            let buffer = self.buffer(stream);
            buffer.after_cr = false;
            let line = std::mem::take(&mut buffer.bytes);
            if !line.is_empty() {
                self.dispatch(stream, &line);
            }
        }
    }

    fn buffer(&mut self, stream: StreamKind) -> &mut LineBuffer {
        match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }

    fn dispatch(&mut self, stream: StreamKind, raw: &[u8]) {
        let raw = String::from_utf8_lossy(raw);
        let message = strip_envelope(&raw);

        if let Some(pattern) = &self.result_pattern {
            if let Some(result) = pattern.parse(&message) {
                self.result = Some(result);
            }
        }
        if let Some(marker) = &self.ready_marker {
            if message.contains(marker.as_str()) {
                self.ready = true;
            }
        }

        if self.json_passthrough {
            self.sink.line(stream, &raw);
        } else {
            self.sink.line(stream, &message);
        }
    }

    /// Whether the ready marker has been seen.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Last structured result seen, if any.
    pub fn result(&self) -> Option<&ExecResult> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Option<ExecResult> {
        self.result
    }
}
