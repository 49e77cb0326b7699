//! The deduplicating warning/error log that every evaluator returns alongside its value.

use std::fmt;

use crate::{ParseError, ParseErrorKind, ScriptError};

/// Rendered logs longer than this are replaced by a short notice.
pub const MAX_LOG_DISPLAY: usize = 4000;

/// A single logged message, with the number of consecutive times it was logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub message: String,
    pub count: usize,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count > 1 {
            write!(f, "**({})** ", self.count)?;
        }
        f.write_str(&self.message)
    }
}

/// Ordered list of warnings and errors produced while parsing or executing a script.
///
/// Identical consecutive messages collapse into one entry with an incremented
/// count. Once `terminal` is set it is never cleared by a merge; it is the
/// signal for every stage to abort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorLog {
    entries: Vec<LogEntry>,
    terminal: bool,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Discard all entries and reset the terminal flag.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.terminal = false;
    }

    // -----------------------------------------------------------------------
    // Logging
    // -----------------------------------------------------------------------

    /// Log a message, merging it into the previous entry if identical.
    pub fn log(&mut self, message: impl Into<String>, terminal: bool) -> &mut Self {
        let message = message.into();
        self.push(message, 1, terminal);
        self
    }

    /// Log a message prefixed with the context it occurred in.
    pub fn log_in(&mut self, message: impl fmt::Display, terminal: bool, context: &str) -> &mut Self {
        self.log(format!("**in {context}:** {message}"), terminal)
    }

    pub fn warn(&mut self, message: impl Into<String>) -> &mut Self {
        self.log(message, false)
    }

    /// Log an error as `"{message}:\n\t{kind}: {error}"`, terminally.
    pub fn log_error(&mut self, message: impl fmt::Display, error: &ScriptError) -> &mut Self {
        if let ScriptError::Parse(e) = error {
            self.log(format!("{message}:"), true);
            return self.log_parse_error(e);
        }
        self.log(format!("{message}:\n\t{}: {error}", error.kind()), true)
    }

    /// Bespoke formatting for a parse error, highlighting the offending character.
    pub fn log_parse_error(&mut self, error: &ParseError) -> &mut Self {
        let msg = lowercase_first(&error.message);
        let mut message = match error.kind {
            ParseErrorKind::Unclosed => format!(
                "ParseException: Likely unclosed expression at position {}:\n\t",
                error.offset
            ),
            ParseErrorKind::UnexpectedEnd => {
                format!("ParseSyntaxException: Unexpected end of code, {msg}:\n\t")
            }
            ParseErrorKind::InvalidSyntax => format!(
                "ParseSyntaxException: Invalid syntax at position {}, {msg}:\n\t",
                error.offset
            ),
        };
        match error.highlight() {
            Some((before, bad, after)) => message.push_str(&format!("{before}**{bad}**{after}")),
            None => message.push_str(&format!("{} **(?)**", error.source_line)),
        }
        self.log(message, true)
    }

    // -----------------------------------------------------------------------
    // Merging
    // -----------------------------------------------------------------------

    /// Merge every entry of `other` into this log.
    pub fn extend(&mut self, other: &ErrorLog) -> &mut Self {
        self.terminal |= other.terminal;
        for entry in &other.entries {
            self.push(entry.message.clone(), entry.count, false);
        }
        self
    }

    /// Merge every entry of `other`, prefixing each with `context`.
    pub fn extend_in(&mut self, other: &ErrorLog, context: &str) -> &mut Self {
        self.terminal |= other.terminal;
        for entry in &other.entries {
            self.push(format!("**in {context}:** {}", entry.message), entry.count, false);
        }
        self
    }

    /// Merge `other` into this log and clear it, for logs this one owns.
    pub fn steal(&mut self, other: &mut ErrorLog, context: Option<&str>) -> &mut Self {
        match context {
            Some(ctx) => self.extend_in(other, ctx),
            None => self.extend(other),
        };
        other.clear();
        self
    }

    fn push(&mut self, message: String, count: usize, terminal: bool) {
        match self.entries.last_mut() {
            Some(last) if last.message == message => last.count += count,
            _ => {
                if count == 1 {
                    if terminal {
                        tracing::debug!(message = %message, "Error logged");
                    } else {
                        tracing::debug!(message = %message, "Warning logged");
                    }
                }
                self.entries.push(LogEntry { message, count });
            }
        }
        self.terminal |= terminal;
    }

    // -----------------------------------------------------------------------
    // Presentation
    // -----------------------------------------------------------------------

    /// Title for displaying this log, e.g. `"Error log for Event: greet"`.
    pub fn title(&self, name: Option<&str>) -> String {
        let base = if self.terminal { "Error log" } else { "Warning log" };
        match name {
            Some(name) => format!("{base} for {name}"),
            None => base.to_string(),
        }
    }

    /// Render the log body, falling back to a short notice when it is too long
    /// to reasonably display.
    pub fn render(&self) -> String {
        let body = self.to_string();
        if body.chars().count() <= MAX_LOG_DISPLAY {
            return body;
        }
        format!(
            "🙈 {} log too big to reasonably display...\nDoes your script perhaps contain an infinite recursion?",
            if self.terminal { "Error" } else { "Warning" }
        )
    }
}

impl fmt::Display for ErrorLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return f.write_str("No warnings!");
        }
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

fn lowercase_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_messages_merge() {
        let mut log = ErrorLog::new();
        log.log("X", false);
        log.log("X", false);
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].count, 2);
        assert!(!log.is_terminal());
        assert_eq!(log.to_string(), "**(2)** X");
    }

    #[test]
    fn only_consecutive_messages_merge() {
        let mut log = ErrorLog::new();
        log.warn("A").warn("B").warn("A");
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn terminal_is_sticky() {
        let mut log = ErrorLog::new();
        log.log("bad", true);
        log.warn("fine");
        let other = ErrorLog::new();
        log.extend(&other);
        assert!(log.is_terminal());
    }

    #[test]
    fn context_prefix() {
        let mut log = ErrorLog::new();
        log.log_in("oops", false, "condition");
        assert_eq!(log.entries()[0].message, "**in condition:** oops");
    }

    #[test]
    fn extend_adds_counts_when_merging() {
        let mut a = ErrorLog::new();
        a.warn("X");
        let mut b = ErrorLog::new();
        b.warn("X").warn("X");
        a.extend(&b);
        assert_eq!(a.len(), 1);
        assert_eq!(a.entries()[0].count, 3);
    }

    #[test]
    fn extend_in_prefixes_and_carries_terminal() {
        let mut inner = ErrorLog::new();
        inner.log("broken", true);
        let mut outer = ErrorLog::new();
        outer.extend_in(&inner, "parens");
        assert!(outer.is_terminal());
        assert_eq!(outer.entries()[0].message, "**in parens:** broken");
    }

    #[test]
    fn steal_clears_the_source() {
        let mut inner = ErrorLog::new();
        inner.log("broken", true);
        let mut outer = ErrorLog::new();
        outer.steal(&mut inner, Some("name"));
        assert!(inner.is_empty());
        assert!(!inner.is_terminal());
        assert!(outer.is_terminal());
    }

    #[test]
    fn log_error_formats_kind() {
        let mut log = ErrorLog::new();
        log.log_error(
            "Failed to process Pipe `foo` with args ",
            &ScriptError::Value("nope".into()),
        );
        assert!(log.is_terminal());
        assert_eq!(
            log.entries()[0].message,
            "Failed to process Pipe `foo` with args :\n\tValueError: nope"
        );
    }

    #[test]
    fn parse_error_highlights_bad_char() {
        let err = ParseError::new("a } b", 2, "Expected end of text", ParseErrorKind::InvalidSyntax);
        let mut log = ErrorLog::new();
        log.log_parse_error(&err);
        assert!(log.is_terminal());
        assert_eq!(
            log.entries()[0].message,
            "ParseSyntaxException: Invalid syntax at position 2, expected end of text:\n\ta **}** b"
        );
    }

    #[test]
    fn parse_error_at_end_of_line() {
        let err = ParseError::new("{foo", 4, "Expected `}`", ParseErrorKind::InvalidSyntax);
        let mut log = ErrorLog::new();
        log.log_parse_error(&err);
        assert!(log.entries()[0].message.ends_with("{foo **(?)**"));
        assert!(log.entries()[0].message.contains("Unexpected end of code"));
    }

    #[test]
    fn empty_log_display() {
        assert_eq!(ErrorLog::new().to_string(), "No warnings!");
    }

    #[test]
    fn titles() {
        let mut log = ErrorLog::new();
        assert_eq!(log.title(None), "Warning log");
        log.log("x", true);
        assert_eq!(log.title(Some("Event: greet")), "Error log for Event: greet");
    }

    #[test]
    fn oversized_log_renders_notice() {
        let mut log = ErrorLog::new();
        for i in 0..500 {
            log.warn(format!("warning number {i}"));
        }
        assert!(log.render().starts_with("🙈 Warning log too big"));
    }
}
