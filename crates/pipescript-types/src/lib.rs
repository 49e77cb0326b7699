//! Shared types for the pipeline script engine.
//!
//! This crate provides the foundational types used across all other pipescript crates:
//! - `ScriptError`: unified error taxonomy
//! - `ParseError`: positioned syntax errors produced by the grammar
//! - `ErrorLog`: the deduplicating warning/error channel every evaluator returns
//! - `ItemScope`: the chain of item lists that `{}` references resolve against
//! - `Origin`: who started an execution, and why

mod error_log;
mod item_scope;
mod origin;

pub use error_log::{ErrorLog, LogEntry, MAX_LOG_DISPLAY};
pub use item_scope::ItemScope;
pub use origin::{Origin, OriginKind, User};

/// Unified error type for all pipescript subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    // === Parser Errors ===
    #[error(transparent)]
    Parse(#[from] ParseError),

    // === Evaluation Errors ===
    #[error("{0}")]
    ItemScope(String),

    #[error("{0}")]
    GroupMode(String),

    #[error("{0}")]
    Argument(String),

    #[error("{0}")]
    Pipeline(String),

    #[error("{0}")]
    Context(String),

    /// Raised by native pipe, source and spout implementations.
    #[error("{0}")]
    Value(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Regex(#[from] regex::Error),

    #[error("{0}")]
    Other(String),
}

impl ScriptError {
    /// Short type name used when the error is rendered into an `ErrorLog`
    /// as `"{kind}: {message}"`.
    pub fn kind(&self) -> &'static str {
        match self {
            ScriptError::Parse(_) => "ParseError",
            ScriptError::ItemScope(_) => "ItemScopeError",
            ScriptError::GroupMode(_) => "GroupModeError",
            ScriptError::Argument(_) => "ArgumentError",
            ScriptError::Pipeline(_) => "PipelineError",
            ScriptError::Context(_) => "ContextError",
            ScriptError::Value(_) => "ValueError",
            ScriptError::Io(_) => "IOError",
            ScriptError::Json(_) => "JSONError",
            ScriptError::Regex(_) => "RegexError",
            ScriptError::Other(_) => "Error",
        }
    }

    /// Returns `true` for errors caused by the script's own content, as opposed
    /// to the environment it runs in.
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            ScriptError::Io(_) | ScriptError::Json(_) | ScriptError::Other(_)
        )
    }
}

/// A convenience alias for `Result<T, ScriptError>`.
pub type Result<T> = std::result::Result<T, ScriptError>;

// ---------------------------------------------------------------------------
// ParseError
// ---------------------------------------------------------------------------

/// What went wrong at the error position, which decides how it is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was left over after a complete expression; usually an unclosed
    /// bracket or brace earlier on.
    Unclosed,
    /// The input ended while an expression still expected more.
    UnexpectedEnd,
    /// A character at the given position did not fit the grammar.
    InvalidSyntax,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Parse error at line {line}, col {col}: {message}")]
pub struct ParseError {
    /// Byte offset into the parsed input.
    pub offset: usize,
    /// 1-based line number.
    pub line: usize,
    /// 1-based column, counted in characters.
    pub col: usize,
    pub message: String,
    /// The full line of input containing the error.
    pub source_line: String,
    pub kind: ParseErrorKind,
}

impl ParseError {
    /// Build a parse error at byte `offset` into `input`, locating its line and column.
    pub fn new(
        input: &str,
        offset: usize,
        message: impl Into<String>,
        kind: ParseErrorKind,
    ) -> Self {
        let offset = floor_char_boundary(input, offset.min(input.len()));
        let before = &input[..offset];
        let line = before.matches('\n').count() + 1;
        let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
        let line_end = input[offset..]
            .find('\n')
            .map(|i| offset + i)
            .unwrap_or(input.len());
        let col = input[line_start..offset].chars().count() + 1;

        // An error sitting exactly on the end of the line is an unexpected end.
        let kind = if kind == ParseErrorKind::InvalidSyntax && offset == line_end {
            ParseErrorKind::UnexpectedEnd
        } else {
            kind
        };

        Self {
            offset,
            line,
            col,
            message: message.into(),
            source_line: input[line_start..line_end].to_string(),
            kind,
        }
    }

    /// Split the source line around the offending character: `(before, bad, after)`.
    /// Returns `None` when the error sits at the end of the line.
    pub fn highlight(&self) -> Option<(&str, char, &str)> {
        let (byte_col, bad) = self.source_line.char_indices().nth(self.col - 1)?;
        let before = &self.source_line[..byte_col];
        let after = &self.source_line[byte_col + bad.len_utf8()..];
        Some((before, bad, after))
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_parse_error() {
        let err = ParseError::new("foo {bar", 8, "expected `}`", ParseErrorKind::InvalidSyntax);
        assert_eq!(err.to_string(), "Parse error at line 1, col 9: expected `}`");
        assert_eq!(err.kind, ParseErrorKind::UnexpectedEnd);
    }

    #[test]
    fn parse_error_locates_line_and_column() {
        let input = "first line\nsecond }line";
        let offset = input.find('}').unwrap();
        let err = ParseError::new(input, offset, "unexpected `}`", ParseErrorKind::InvalidSyntax);
        assert_eq!(err.line, 2);
        assert_eq!(err.col, 8);
        assert_eq!(err.source_line, "second }line");
        assert_eq!(err.highlight(), Some(("second ", '}', "line")));
    }

    #[test]
    fn parse_error_column_counts_characters() {
        let input = "héllo }";
        let offset = input.find('}').unwrap();
        let err = ParseError::new(input, offset, "unexpected", ParseErrorKind::InvalidSyntax);
        assert_eq!(err.col, 7);
        assert_eq!(err.highlight().map(|(_, c, _)| c), Some('}'));
    }

    #[test]
    fn error_kind_names() {
        assert_eq!(ScriptError::ItemScope("x".into()).kind(), "ItemScopeError");
        assert_eq!(ScriptError::GroupMode("x".into()).kind(), "GroupModeError");
        assert_eq!(ScriptError::Value("x".into()).kind(), "ValueError");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: ScriptError = io_err.into();
        assert!(matches!(err, ScriptError::Io(_)));
        assert!(err.to_string().contains("file missing"));
        assert!(!err.is_user_error());
    }

    #[test]
    fn error_from_regex() {
        let err: ScriptError = regex::Regex::new("(unclosed").unwrap_err().into();
        assert_eq!(err.kind(), "RegexError");
        assert!(err.is_user_error());
    }
}
