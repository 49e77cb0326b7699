//! Coarse splitting of a script into its origin and pipe segments.
//!
//! These scanners only care about structure: quotes (`"` toggles), braces
//! and parentheses. A `~` followed by an escapable character is skipped over.

use std::ops::Range;

use pipescript_types::{ParseError, ParseErrorKind};

use crate::choicetree::ChoiceTree;
use crate::parser::ESCAPABLE;

/// Iterate `(byte_offset, char)` pairs, skipping `~`-escaped characters entirely.
fn unescaped_chars(s: &str) -> impl Iterator<Item = (usize, char)> + '_ {
    let mut chars = s.char_indices().peekable();
    std::iter::from_fn(move || loop {
        let (i, c) = chars.next()?;
        if c == '~' && chars.peek().is_some_and(|(_, n)| ESCAPABLE.contains(n)) {
            chars.next();
            continue;
        }
        return Some((i, c));
    })
}

/// Split a script into its origin and the rest, on the first top-level `>`.
///
/// `origin -> rest` becomes `("origin", "print>rest")`; without a `>` the whole
/// script is the origin and the rest is empty.
pub fn split_origin(script: &str) -> (String, String) {
    let mut quoted = false;
    let mut braces = 0usize;
    let mut prev = None;
    for (i, c) in unescaped_chars(script) {
        match c {
            '"' => quoted = !quoted,
            '{' if !quoted => braces += 1,
            '}' if !quoted => braces = braces.saturating_sub(1),
            '>' if !quoted && braces == 0 => {
                if prev == Some('-') {
                    return (
                        script[..i - 1].trim().to_string(),
                        format!("print>{}", &script[i + 1..]),
                    );
                }
                return (script[..i].trim().to_string(), script[i + 1..].to_string());
            }
            _ => {}
        }
        prev = Some(c);
    }
    (script.trim().to_string(), String::new())
}

/// Split a sequence of pipes on every top-level `>`, inserting a `print`
/// segment for each `->`. Each segment is trimmed.
pub fn split_segments(pipeline: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut quoted = false;
    let mut parens = 0usize;
    let mut braces = 0usize;
    let mut start = 0;
    let mut prev = None;

    for (i, c) in unescaped_chars(pipeline) {
        if quoted {
            if c == '"' {
                quoted = false;
            }
        } else {
            match c {
                '"' => quoted = true,
                '(' => parens += 1,
                ')' => parens = parens.saturating_sub(1),
                '{' => braces += 1,
                '}' => braces = braces.saturating_sub(1),
                '>' if parens == 0 && braces == 0 => {
                    if prev == Some('-') {
                        segments.push(pipeline[start..i - 1].trim().to_string());
                        segments.push("print".to_string());
                    } else {
                        segments.push(pipeline[start..i].trim().to_string());
                    }
                    start = i + 1;
                }
                _ => {}
            }
        }
        prev = Some(c);
    }
    // Quotes or parentheses left open are disregarded.
    segments.push(pipeline[start..].trim().to_string());
    segments
}

/// Byte ranges of a segment that bracket expansion must leave alone:
/// top-level parenthesized runs (an unclosed one runs to the end) and `"""` quoted runs.
pub fn protected_spans(segment: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut quoted = false;
    let mut parens = 0usize;
    let mut start = 0;

    for (i, c) in unescaped_chars(segment) {
        if quoted {
            if c == '"' {
                quoted = false;
            }
            continue;
        }
        match c {
            '"' => quoted = true,
            '(' => {
                parens += 1;
                if parens == 1 {
                    start = i;
                }
            }
            ')' if parens > 0 => {
                parens -= 1;
                if parens == 0 {
                    spans.push(start..i + 1);
                }
            }
            _ => {}
        }
    }
    if parens > 0 {
        spans.push(start..segment.len());
    }

    let paren_spans = spans.clone();
    let inside_parens = |pos: usize| paren_spans.iter().find(|r| r.contains(&pos)).cloned();
    let mut pos = 0;
    while let Some(found) = segment[pos..].find("\"\"\"") {
        let open = pos + found;
        if let Some(span) = inside_parens(open) {
            pos = span.end;
            continue;
        }
        let Some(close) = segment[open + 3..].find("\"\"\"") else {
            break;
        };
        let end = open + 3 + close + 3;
        spans.push(open..end);
        pos = end;
    }

    spans.sort_by_key(|r| r.start);
    spans
}

/// Expand a segment's bracket alternatives into its parallel pipe strings, trimmed.
pub fn expand_segment(segment: &str) -> Result<Vec<String>, ParseError> {
    let spans = protected_spans(segment);
    let tree = ChoiceTree::parse_protected(segment, &spans, false)?;
    Ok(tree
        .expand()
        .into_iter()
        .map(|s| s.trim().to_string())
        .collect())
}

/// Split `(body)^N` into its body and optional iteration count.
///
/// `pipestr` must start with `(`. An unclosed parenthesis runs to the end.
pub fn parse_inline_pipeline(pipestr: &str) -> Result<(&str, Option<i64>), ParseError> {
    let mut quoted = false;
    let mut depth = 0usize;
    let mut close = None;
    for (i, c) in unescaped_chars(pipestr) {
        if quoted {
            if c == '"' {
                quoted = false;
            }
            continue;
        }
        match c {
            '"' => quoted = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let Some(close) = close else {
        return Ok((&pipestr[1..], None));
    };

    let body = &pipestr[1..close];
    let tail = &pipestr[close + 1..];
    let trimmed = tail.trim();
    if trimmed.is_empty() {
        return Ok((body, None));
    }
    let tail_offset = close + 1 + (tail.len() - tail.trim_start().len());
    let count = trimmed
        .strip_prefix('^')
        .and_then(|n| n.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            ParseError::new(
                pipestr,
                tail_offset,
                "Expected `^` and an iteration count after inline pipeline",
                ParseErrorKind::InvalidSyntax,
            )
        })?;
    Ok((body, Some(count)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_split() {
        assert_eq!(
            split_origin("foo > bar > baz"),
            ("foo".to_string(), " bar > baz".to_string())
        );
        assert_eq!(
            split_origin("\"a > b\" > bar"),
            ("\"a > b\"".to_string(), " bar".to_string())
        );
        assert_eq!(
            split_origin("foo -> bar"),
            ("foo".to_string(), "print> bar".to_string())
        );
        assert_eq!(split_origin(" foo "), ("foo".to_string(), String::new()));
    }

    #[test]
    fn origin_split_skips_inline_scripts() {
        let (origin, rest) = split_origin("{>> a > b} > c");
        assert_eq!(origin, "{>> a > b}");
        assert_eq!(rest, " c");
    }

    #[test]
    fn segments() {
        assert_eq!(
            split_segments("a > (b > c) > d \">\" -> e"),
            vec!["a", "(b > c)", "d \">\"", "print", "e"]
        );
    }

    #[test]
    fn escaped_brace_does_not_nest() {
        assert_eq!(split_segments("a ~{ > b"), vec!["a ~{", "b"]);
    }

    #[test]
    fn escaped_quote_does_not_toggle() {
        assert_eq!(split_segments("say ~\" > b"), vec!["say ~\"", "b"]);
    }

    #[test]
    fn protected() {
        let seg = "foo (a|b) \"\"\"[x]\"\"\" [c|d]";
        let spans = protected_spans(seg);
        assert_eq!(spans.len(), 2);
        assert_eq!(&seg[spans[0].clone()], "(a|b)");
        assert_eq!(&seg[spans[1].clone()], "\"\"\"[x]\"\"\"");
    }

    #[test]
    fn expand_keeps_protected_spans() {
        assert_eq!(
            expand_segment("[join s=\"\"\"|\"\"\"|(x > [y|z])]").unwrap(),
            vec!["join s=\"\"\"|\"\"\"", "(x > [y|z])"]
        );
    }

    #[test]
    fn inline_pipeline() {
        assert_eq!(parse_inline_pipeline("(a > b)").unwrap(), ("a > b", None));
        assert_eq!(parse_inline_pipeline("(a > (b))^3").unwrap(), ("a > (b)", Some(3)));
        assert_eq!(parse_inline_pipeline("(a > b").unwrap(), ("a > b", None));
        assert!(parse_inline_pipeline("(a) junk").is_err());
    }
}
