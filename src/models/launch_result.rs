use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use tokio::sync::broadcast;

/// Type of a result line. The UI colours lines by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Info,
    Start,
    Success,
    Error,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Start => "start",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "info" => Some(Self::Info),
            "start" => Some(Self::Start),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One timestamped line of a [`LaunchResult`].
///
/// Rendered as `<RFC 3339 UTC timestamp> [<kind>] <message>`. Messages never contain
/// newlines; they are replaced with spaces on construction so the output stays
/// strictly one operation line per text line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub kind: LogKind,
    pub message: String,
}

impl LogLine {
    pub fn new(kind: LogKind, message: impl Into<String>) -> Self {
        let message: String = message.into();
        let message = if message.contains(['\n', '\r']) {
            message.replace(['\n', '\r'], " ")
        } else {
            message
        };

        Self {
            timestamp: Utc::now(),
            kind,
            message,
        }
    }

    /// Classify a rendered line back into its kind.
    ///
    /// This is the helper the UI uses after splitting the output on newlines.
    pub fn classify(line: &str) -> Option<LogKind> {
        let open = line.find('[')?;
        let close = line[open..].find(']')? + open;
        LogKind::parse(&line[open + 1..close])
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.kind.as_str(),
            self.message
        )
    }
}

/// Terminal outcome of a launch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
    Cancelled,
}

/// Ordered, append-only log of a launch attempt plus its verdict.
///
/// This is the only value that crosses the core/UI boundary. Lines are kept in the
/// order they were appended; every pipeline step appends at least one line before
/// the next step starts.
#[derive(Debug)]
pub struct LaunchResult {
    lines: Vec<LogLine>,
    verdict: Option<Verdict>,
    events: Option<broadcast::Sender<LogLine>>,
}

impl LaunchResult {
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            verdict: None,
            events: None,
        }
    }

    /// Create a result that also streams every appended line to subscribers.
    pub fn with_events(capacity: usize) -> (Self, broadcast::Receiver<LogLine>) {
        let (tx, rx) = broadcast::channel(capacity);
        let result = Self {
            lines: Vec::new(),
            verdict: None,
            events: Some(tx),
        };
        (result, rx)
    }

    pub fn push(&mut self, kind: LogKind, message: impl Into<String>) {
        let line = LogLine::new(kind, message);
        if let Some(tx) = &self.events {
            // No listener is fine
            let _ = tx.send(line.clone());
        }
        self.lines.push(line);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(LogKind::Info, message);
    }

    pub fn start(&mut self, message: impl Into<String>) {
        self.push(LogKind::Start, message);
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.push(LogKind::Success, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(LogKind::Error, message);
    }

    /// Record the terminal verdict. The first verdict wins.
    pub fn finish(&mut self, verdict: Verdict) {
        if self.verdict.is_none() {
            self.verdict = Some(verdict);
        }
        // Closing the channel tells streaming listeners the attempt is over
        self.events = None;
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    pub fn is_success(&self) -> bool {
        self.verdict == Some(Verdict::Success)
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    /// Lines of a given kind, in order
    pub fn lines_of(&self, kind: LogKind) -> impl Iterator<Item = &LogLine> {
        self.lines.iter().filter(move |line| line.kind == kind)
    }

    /// True if any line of `kind` contains `needle`
    pub fn contains(&self, kind: LogKind, needle: &str) -> bool {
        self.lines_of(kind).any(|line| line.message.contains(needle))
    }

    /// Newline-delimited rendering of all lines
    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(|line| line.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Boundary form: `Ok(lines)` on success, `Err(lines)` otherwise.
    ///
    /// On failure the whole log is returned as the error description, so the caller
    /// still sees which steps ran before the failing one.
    pub fn into_output(self) -> Result<String, String> {
        let rendered = self.render();
        match self.verdict {
            Some(Verdict::Success) => Ok(rendered),
            _ => Err(rendered),
        }
    }
}

impl Default for LaunchResult {
    fn default() -> Self {
        Self::new()
    }
}
