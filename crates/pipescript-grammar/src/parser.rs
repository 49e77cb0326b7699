use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, cut_err, not, opt, preceded, repeat, separated, terminated};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::stream::Stream;
use winnow::token::take_while;
use winnow::{ModalResult, Parser};

use pipescript_types::{ParseError, ParseErrorKind};

use crate::ast::*;

/// Characters that may be escaped with a preceding `~`.
pub const ESCAPABLE: &[char] = &['{', '}', '~', '"', '\'', '/'];

pub(crate) fn make_cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

pub(crate) fn backtrack() -> ErrMode<ContextError<StrContext>> {
    ErrMode::Backtrack(ContextError::new())
}

pub(crate) fn expected(desc: &'static str) -> StrContext {
    StrContext::Expected(StrContextValue::Description(desc))
}

// ---------------------------------------------------------------------------
// Terminals
// ---------------------------------------------------------------------------

/// Whitespace consumer (including newlines).
pub(crate) fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Parse an identifier: [A-Za-z_][A-Za-z0-9_]*
pub(crate) fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., is_ident_char),
    )
        .take()
        .parse_next(input)
}

/// Parse a possibly negative integer.
pub(crate) fn integer(input: &mut &str) -> ModalResult<i64> {
    (opt('-'), digit1)
        .take()
        .try_map(|s: &str| s.parse::<i64>())
        .parse_next(input)
}

pub(crate) fn pos_integer(input: &mut &str) -> ModalResult<usize> {
    digit1.try_map(|s: &str| s.parse::<usize>()).parse_next(input)
}

/// Match `word` as a whole word (not followed by an identifier character).
pub(crate) fn keyword<'w>(
    word: &'w str,
    caseless: bool,
) -> impl FnMut(&mut &str) -> ModalResult<()> + 'w {
    move |input: &mut &str| {
        let head = input.get(..word.len()).ok_or_else(backtrack)?;
        let matches = if caseless {
            head.eq_ignore_ascii_case(word)
        } else {
            head == word
        };
        if !matches || input[word.len()..].starts_with(is_ident_char) {
            return Err(backtrack());
        }
        input.next_slice(word.len());
        Ok(())
    }
}

/// A run of literal text up to (not including) wherever `stop` says to stop.
/// Resolves `~` escapes; an escaped character never triggers `stop`.
pub(crate) fn text_bit<S>(stop: S) -> impl FnMut(&mut &str) -> ModalResult<String>
where
    S: Fn(&str) -> bool,
{
    move |input: &mut &str| {
        let mut out = String::new();
        loop {
            let rest: &str = *input;
            if let Some(escaped) = rest
                .strip_prefix('~')
                .and_then(|r| r.chars().next())
                .filter(|c| ESCAPABLE.contains(c))
            {
                out.push(escaped);
                input.next_slice(1 + escaped.len_utf8());
                continue;
            }
            let Some(c) = rest.chars().next() else { break };
            if stop(rest) {
                break;
            }
            out.push(c);
            input.next_slice(c.len_utf8());
        }
        if out.is_empty() {
            Err(backtrack())
        } else {
            Ok(out)
        }
    }
}

fn at_brace(s: &str) -> bool {
    s.starts_with(['{', '}'])
}

fn at_brace_or_space(s: &str) -> bool {
    at_brace(s) || s.starts_with(char::is_whitespace)
}

/// Join adjacent text pieces into one.
pub(crate) fn merge_text(pieces: Vec<Element>) -> Vec<Element> {
    let mut out: Vec<Element> = Vec::with_capacity(pieces.len());
    for piece in pieces {
        if let Element::Text { text } = &piece {
            if let Some(Element::Text { text: prev }) = out.last_mut() {
                prev.push_str(text);
                continue;
            }
        }
        out.push(piece);
    }
    out
}

// ---------------------------------------------------------------------------
// Templated elements
// ---------------------------------------------------------------------------

/// Any `{...}` element. Once a `{` is seen, failing to parse an element is fatal.
pub(crate) fn element(input: &mut &str) -> ModalResult<Element> {
    if !input.starts_with('{') {
        return Err(backtrack());
    }
    cut_err(alt((special, conditional, inline_script, item, source)))
        .context(expected("templated element"))
        .parse_next(input)
}

fn special(input: &mut &str) -> ModalResult<Element> {
    "{\\".parse_next(input)?;
    let name = cut_err(terminated(identifier, '}'))
        .context(expected("special symbol name followed by `}`"))
        .parse_next(input)?;
    Ok(Element::Special {
        name: name.to_string(),
    })
}

fn conditional(input: &mut &str) -> ModalResult<Element> {
    "{?".parse_next(input)?;
    let case_if = cut_err(cond_safe_string).parse_next(input)?;
    cut_err(keyword("if", true))
        .context(expected("`if`"))
        .parse_next(input)?;
    let condition = cut_err(condition).parse_next(input)?;
    ws.parse_next(input)?;
    cut_err(keyword("else", true))
        .context(expected("`else`"))
        .parse_next(input)?;
    let case_else = cut_err(cond_safe_string).parse_next(input)?;
    cut_err('}').context(expected("`}`")).parse_next(input)?;
    Ok(Element::Conditional(Box::new(Conditional {
        case_if,
        condition,
        case_else,
    })))
}

/// `{>> script}`: the body is taken raw, up to the matching unescaped `}`.
fn inline_script(input: &mut &str) -> ModalResult<Element> {
    "{>>".parse_next(input)?;
    let body: &str = *input;
    let mut depth = 0usize;
    let mut end = None;
    let mut chars = body.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '~' => {
                if chars.peek().is_some_and(|(_, n)| ESCAPABLE.contains(n)) {
                    chars.next();
                }
            }
            '{' => depth += 1,
            '}' if depth == 0 => {
                end = Some(i);
                break;
            }
            '}' => depth -= 1,
            _ => {}
        }
    }
    let end = end.ok_or_else(|| make_cut_error("`}` closing the inline script"))?;
    let script = body[..end].trim().to_string();
    input.next_slice(end + 1);
    Ok(Element::InlineScript { script })
}

fn item(input: &mut &str) -> ModalResult<Element> {
    '{'.parse_next(input)?;
    let item = alt((implicit_item, explicit_item)).parse_next(input)?;
    '}'.parse_next(input)?;
    Ok(Element::Item(item))
}

fn carrots(input: &mut &str) -> ModalResult<usize> {
    take_while(0.., '^').map(|s: &str| s.len()).parse_next(input)
}

fn implicit_item(input: &mut &str) -> ModalResult<Item> {
    let carrots = carrots.parse_next(input)?;
    let bang = opt('!').parse_next(input)?.is_some();
    if !input.starts_with('}') {
        return Err(backtrack());
    }
    Ok(Item::Implicit { carrots, bang })
}

fn explicit_item(input: &mut &str) -> ModalResult<Item> {
    let indices: Vec<ItemIndex> = separated(1.., item_index, ',').parse_next(input)?;
    Ok(Item::Explicit(indices))
}

fn item_index(input: &mut &str) -> ModalResult<ItemIndex> {
    let carrots = carrots.parse_next(input)?;
    let start = opt(integer).parse_next(input)?;
    let is_range = opt(':').parse_next(input)?.is_some();
    let end = if is_range {
        opt(integer).parse_next(input)?
    } else {
        None
    };
    let bang = opt('!').parse_next(input)?.is_some();
    match (start, is_range) {
        (start, true) => Ok(ItemIndex::Range {
            carrots,
            start,
            end,
            bang,
        }),
        (Some(index), false) => Ok(ItemIndex::Index {
            carrots,
            index,
            bang,
        }),
        (None, false) => Err(backtrack()),
    }
}

fn source(input: &mut &str) -> ModalResult<Element> {
    '{'.parse_next(input)?;
    ws.parse_next(input)?;
    let amount = opt(alt((
        digit1.try_map(|s: &str| s.parse::<u32>()).map(Amount::Count),
        keyword("all", true).value(Amount::All),
    )))
    .parse_next(input)?;
    ws.parse_next(input)?;
    let (amount, name) = match (amount, opt(identifier).parse_next(input)?) {
        (amount, Some(name)) => (amount, name.to_string()),
        // `{all}` is a source named "all", not an amount without a source.
        (Some(Amount::All), None) => (None, "all".to_string()),
        _ => return Err(make_cut_error("source name")),
    };
    let args = argument_list.parse_next(input)?;
    ws.parse_next(input)?;
    cut_err('}').context(expected("`}`")).parse_next(input)?;
    Ok(Element::Source(SourceCall { amount, name, args }))
}

// ---------------------------------------------------------------------------
// Templated strings
// ---------------------------------------------------------------------------

const QUOTES: [&str; 4] = ["\"\"\"", "\"", "'", "/"];

/// A templated string wrapped in `"""`, `"`, `'` or `/`.
pub(crate) fn quoted_string(input: &mut &str) -> ModalResult<Vec<Element>> {
    let Some(quote) = QUOTES.into_iter().find(|q| input.starts_with(*q)) else {
        return Err(backtrack());
    };
    input.next_slice(quote.len());
    let body = text_bit(move |s: &str| s.starts_with(quote) || at_brace(s)).map(Element::text);
    let pieces: Vec<Element> = repeat(0.., alt((element, body))).parse_next(input)?;
    cut_err(quote)
        .context(expected("closing quote"))
        .parse_next(input)?;
    Ok(merge_text(pieces))
}

/// A nonempty templated string without quotes and without spaces in its literal parts.
pub(crate) fn unquoted_spaceless_string(input: &mut &str) -> ModalResult<Vec<Element>> {
    let bit = text_bit(at_brace_or_space).map(Element::text);
    let pieces: Vec<Element> = repeat(1.., alt((element, bit))).parse_next(input)?;
    Ok(merge_text(pieces))
}

/// Everything up to a stray `}` or the end of input.
fn absolute_string(input: &mut &str) -> ModalResult<Vec<Element>> {
    let bit = text_bit(at_brace).map(Element::text);
    let pieces: Vec<Element> = repeat(0.., alt((element, bit))).parse_next(input)?;
    Ok(merge_text(pieces))
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

fn arg_value(input: &mut &str) -> ModalResult<Vec<Element>> {
    alt((quoted_string, unquoted_spaceless_string)).parse_next(input)
}

fn explicit_arg(input: &mut &str) -> ModalResult<RawArg> {
    ws.parse_next(input)?;
    let name = identifier.parse_next(input)?;
    '='.parse_next(input)?;
    let value = cut_err(arg_value)
        .context(expected("argument value"))
        .parse_next(input)?;
    Ok(RawArg::Explicit {
        name: name.to_string(),
        value,
    })
}

/// Leading whitespace plus a word, or only whitespace.
fn implicit_bit(input: &mut &str) -> ModalResult<Element> {
    let lead = multispace0.parse_next(input)?;
    match text_bit(at_brace_or_space).parse_next(input) {
        Ok(word) => Ok(Element::text(format!("{lead}{word}"))),
        Err(ErrMode::Backtrack(e)) if lead.is_empty() => Err(ErrMode::Backtrack(e)),
        Err(ErrMode::Backtrack(_)) => Ok(Element::text(lead)),
        Err(e) => Err(e),
    }
}

fn implicit_arg(input: &mut &str) -> ModalResult<RawArg> {
    let pieces: Vec<Element> =
        repeat(1.., preceded(not(explicit_arg), alt((element, implicit_bit)))).parse_next(input)?;
    Ok(RawArg::Implicit {
        pieces: merge_text(pieces),
    })
}

/// A free mixture of explicit and implicit arguments.
pub(crate) fn argument_list(input: &mut &str) -> ModalResult<Vec<RawArg>> {
    ws.parse_next(input)?;
    repeat(0.., alt((explicit_arg, implicit_arg))).parse_next(input)
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

fn cond_safe_bit(input: &mut &str) -> ModalResult<Element> {
    text_bit(|s: &str| {
        at_brace_or_space(s)
            || s.starts_with(['=', '|', '(', ')', '<', '>'])
            || s.starts_with("!=")
    })
    .map(Element::text)
    .parse_next(input)
}

/// A quoted templated string, or a spaceless one that stops at operators.
fn cond_safe_string(input: &mut &str) -> ModalResult<Vec<Element>> {
    ws.parse_next(input)?;
    let value = alt((
        quoted_string,
        repeat(1.., alt((element, cond_safe_bit))).map(merge_text),
    ))
    .parse_next(input)?;
    ws.parse_next(input)?;
    Ok(value)
}

fn comp_op(input: &mut &str) -> ModalResult<CompOp> {
    alt((
        "==".value(CompOp::Eq),
        "!=".value(CompOp::NotEq),
        "<=".value(CompOp::LtEq),
        ">=".value(CompOp::GtEq),
        "<".value(CompOp::Lt),
        ">".value(CompOp::Gt),
        keyword("LIKE", false).value(CompOp::Like),
        (keyword("NOT", false), ws, keyword("LIKE", false)).value(CompOp::NotLike),
    ))
    .parse_next(input)
}

fn comparison(input: &mut &str) -> ModalResult<Condition> {
    let lhs = cond_safe_string.parse_next(input)?;
    let op = comp_op.parse_next(input)?;
    let rhs = cut_err(cond_safe_string)
        .context(expected("right-hand side of comparison"))
        .parse_next(input)?;
    Ok(Condition::Comparison { lhs, op, rhs })
}

fn category(input: &mut &str) -> ModalResult<Category> {
    alt((
        keyword("WHITE", false).value(Category::White),
        keyword("EMPTY", false).value(Category::Empty),
        keyword("TRUE", false).value(Category::True),
        keyword("FALSE", false).value(Category::False),
        keyword("BOOL", false).value(Category::Bool),
        keyword("INT", false).value(Category::Int),
        keyword("FLOAT", false).value(Category::Float),
    ))
    .context(expected("predicate category"))
    .parse_next(input)
}

fn predicate(input: &mut &str) -> ModalResult<Condition> {
    let subject = cond_safe_string.parse_next(input)?;
    keyword("IS", false).parse_next(input)?;
    ws.parse_next(input)?;
    let negated = opt(terminated(keyword("NOT", false), ws))
        .parse_next(input)?
        .is_some();
    let category = cut_err(category).parse_next(input)?;
    ws.parse_next(input)?;
    Ok(Condition::Predicate {
        subject,
        negated,
        category,
    })
}

fn aggregate(input: &mut &str) -> ModalResult<Condition> {
    let agg = alt((
        keyword("ANYTHING", false).value(Aggregate::Anything),
        keyword("NOTHING", false).value(Aggregate::Nothing),
    ))
    .parse_next(input)?;
    ws.parse_next(input)?;
    Ok(Condition::Aggregate(agg))
}

fn nested_condition(input: &mut &str) -> ModalResult<Condition> {
    '('.parse_next(input)?;
    let inner = condition.parse_next(input)?;
    ws.parse_next(input)?;
    ')'.parse_next(input)?;
    ws.parse_next(input)?;
    Ok(inner)
}

fn root_condition(input: &mut &str) -> ModalResult<Condition> {
    ws.parse_next(input)?;
    alt((nested_condition, predicate, comparison, aggregate))
        .context(expected("condition"))
        .parse_next(input)
}

fn negation(input: &mut &str) -> ModalResult<Condition> {
    let nots: usize = repeat(0.., (ws, keyword("not", true))).parse_next(input)?;
    if nots == 0 {
        return root_condition.parse_next(input);
    }
    let mut cond = cut_err(root_condition).parse_next(input)?;
    for _ in 0..nots {
        cond = Condition::Not(Box::new(cond));
    }
    Ok(cond)
}

fn conjunction(input: &mut &str) -> ModalResult<Condition> {
    let first = negation.parse_next(input)?;
    let rest: Vec<Condition> =
        repeat(0.., preceded((ws, keyword("and", true)), cut_err(negation))).parse_next(input)?;
    if rest.is_empty() {
        return Ok(first);
    }
    Ok(Condition::And(std::iter::once(first).chain(rest).collect()))
}

/// `conj (or conj)*`
pub(crate) fn condition(input: &mut &str) -> ModalResult<Condition> {
    let first = conjunction.parse_next(input)?;
    let rest: Vec<Condition> =
        repeat(0.., preceded((ws, keyword("or", true)), cut_err(conjunction))).parse_next(input)?;
    if rest.is_empty() {
        return Ok(first);
    }
    Ok(Condition::Or(std::iter::once(first).chain(rest).collect()))
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Convert a winnow error at `remaining` into a positioned [`ParseError`].
pub(crate) fn to_parse_error(
    input: &str,
    remaining: &str,
    err: ErrMode<ContextError<StrContext>>,
) -> ParseError {
    let ctx = match err {
        ErrMode::Backtrack(e) | ErrMode::Cut(e) => e,
        ErrMode::Incomplete(_) => ContextError::new(),
    };
    let expected: Vec<String> = ctx
        .context()
        .filter_map(|c| match c {
            StrContext::Expected(v) => Some(v.to_string()),
            _ => None,
        })
        .collect();
    let message = if expected.is_empty() {
        "Invalid syntax".to_string()
    } else {
        format!("Expected {}", expected.join(" in "))
    };
    let kind = if remaining.is_empty() {
        ParseErrorKind::UnexpectedEnd
    } else {
        ParseErrorKind::InvalidSyntax
    };
    let offset = input.len() - remaining.len();
    tracing::trace!(offset, %message, "Parse failed");
    ParseError::new(input, offset, message, kind)
}

/// Run `parser` over all of `input`; leftover input means something was left unclosed.
pub(crate) fn parse_complete<'i, O>(
    input: &'i str,
    mut parser: impl Parser<&'i str, O, ErrMode<ContextError<StrContext>>>,
) -> Result<O, ParseError> {
    let mut remaining = input;
    match parser.parse_next(&mut remaining) {
        Ok(value) if remaining.is_empty() => Ok(value),
        Ok(_) => Err(ParseError::new(
            input,
            input.len() - remaining.len(),
            "Expected end of text",
            ParseErrorKind::Unclosed,
        )),
        Err(e) => Err(to_parse_error(input, remaining, e)),
    }
}

/// Parse the entirety of `input` as an unquoted templated string.
pub fn parse_template(input: &str) -> Result<Vec<Element>, ParseError> {
    parse_complete(input, absolute_string)
}

/// Parse the entirety of `input` as a list of arguments.
pub fn parse_arguments(input: &str) -> Result<Vec<RawArg>, ParseError> {
    parse_complete(input, argument_list)
}

/// Parse the entirety of `input` as a condition.
pub fn parse_condition(input: &str) -> Result<Condition, ParseError> {
    parse_complete(input, terminated(condition, ws))
}
