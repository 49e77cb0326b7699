//! Templated strings: literal text interleaved with `{}` items, `{source}`
//! calls, `{? conditionals}` and `{>> inline scripts}`, evaluated against a
//! context and an item scope.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};

use pipescript_grammar::{self as grammar, Amount, ChoiceTree, Element, Item, ItemIndex, SourceCall};
use pipescript_types::{ErrorLog, ItemScope, ParseError, Result, ScriptError};

use crate::condition::Condition;
use crate::context::{Context, Runtime};
use crate::macros::{self, MacroKind};
use crate::registry::{Pipe, Source};
use crate::script::ExecutableScript;
use crate::signature::{ArgValue, Arguments, EvaluatedArguments};

// ---------------------------------------------------------------------------
// Pieces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Piece {
    Text(String),
    Item(TmplItem),
    Source(Arc<TmplSource>),
    Conditional(Arc<TmplConditional>),
    Script(Arc<ExecutableScript>),
}

impl fmt::Display for Piece {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Piece::Text(t) => f.write_str(t),
            Piece::Item(i) => write!(f, "{i}"),
            Piece::Source(s) => write!(f, "{s}"),
            Piece::Conditional(c) => write!(f, "{c}"),
            Piece::Script(s) => write!(f, "{{>> {s}}}"),
        }
    }
}

/// An evaluated piece: a single string, or the list of values an item,
/// source or inline script produced.
enum Part {
    One(String),
    Many(Vec<String>),
}

/// A `{}` reference to one or more items in scope.
#[derive(Debug, Clone)]
pub struct TmplItem {
    indices: Vec<ItemIndex>,
    implicit: bool,
}

impl TmplItem {
    pub fn evaluate(&self, scope: Option<&ItemScope>) -> Result<Vec<String>> {
        let scope = scope.ok_or_else(|| ScriptError::ItemScope("No scope!".into()))?;
        let mut values = Vec::new();
        for index in &self.indices {
            match *index {
                ItemIndex::Index {
                    carrots,
                    index,
                    bang,
                } => values.push(scope.get_item(carrots, index, bang)?),
                ItemIndex::Range {
                    carrots,
                    start,
                    end,
                    bang,
                } => values.extend(scope.get_items(carrots, start, end, bang)?),
            }
        }
        Ok(values)
    }
}

impl fmt::Display for TmplItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |index: &ItemIndex| match index {
            ItemIndex::Index {
                carrots,
                index,
                bang,
            } => format!("{}{index}{}", "^".repeat(*carrots), if *bang { "!" } else { "" }),
            ItemIndex::Range {
                carrots,
                start,
                end,
                bang,
            } => format!(
                "{}{}:{}{}",
                "^".repeat(*carrots),
                start.map(|s| s.to_string()).unwrap_or_default(),
                end.map(|e| e.to_string()).unwrap_or_default(),
                if *bang { "!" } else { "" }
            ),
        };
        if self.implicit {
            if let Some(ItemIndex::Index { carrots, bang, .. }) = self.indices.first() {
                return write!(f, "{{{}{}}}", "^".repeat(*carrots), if *bang { "!" } else { "" });
            }
        }
        let shown: Vec<String> = self.indices.iter().map(show).collect();
        write!(f, "{{{}}}", shown.join(","))
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum SourceKind {
    Native(Arc<dyn Source>),
    /// A native pipe applied to the source's remainder text.
    Pipe(Arc<dyn Pipe>),
    /// Resolved at evaluation time: a pipe macro, a source macro, or unknown.
    Other,
}

/// A `{[amount] name args...}` source call.
#[derive(Debug, Clone)]
pub struct TmplSource {
    name: String,
    amount: Option<Amount>,
    args: Arguments,
    remainder: Option<TemplatedString>,
    kind: SourceKind,
}

impl TmplSource {
    fn from_call(call: &SourceCall, start_index: usize, rt: &Runtime) -> (Self, ErrorLog, usize) {
        let name = call.name.to_lowercase();
        let (kind, parsed) = if let Some(source) = rt.natives.sources.get(&name) {
            let parsed = Arguments::from_parsed(&call.args, Some(source.signature()), true, start_index, rt);
            (SourceKind::Native(source.clone()), parsed)
        } else if let Some(pipe) = rt.natives.pipes.get(&name) {
            let parsed = Arguments::from_parsed(&call.args, Some(pipe.signature()), false, start_index, rt);
            (SourceKind::Pipe(pipe.clone()), parsed)
        } else {
            let parsed = Arguments::from_parsed(&call.args, None, true, start_index, rt);
            (SourceKind::Other, parsed)
        };
        let source = Self {
            name,
            amount: call.amount,
            args: parsed.arguments,
            remainder: parsed.remainder,
            kind,
        };
        (source, parsed.errors, parsed.end_index)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate_remainder(&self, ctx: &Context, scope: Option<&ItemScope>, errors: &mut ErrorLog) -> Option<String> {
        let Some(remainder) = &self.remainder else {
            return Some(String::new());
        };
        let (value, errs) = remainder.evaluate(ctx, scope).await;
        errors.extend_in(&errs, &self.name);
        if errors.is_terminal() {
            return None;
        }
        value
    }

    pub async fn evaluate(&self, ctx: &Context, scope: Option<&ItemScope>) -> (Option<Vec<String>>, ErrorLog) {
        let mut errors = ErrorLog::new();
        let (args, arg_errors) = self.args.determine(ctx, scope).await;
        errors.extend_in(&arg_errors, &self.name);
        let Some(mut args) = args.filter(|_| !errors.is_terminal()) else {
            return (None, errors);
        };

        match &self.kind {
            SourceKind::Native(source) => {
                let takes_n = source.signature().contains("n");
                match self.amount {
                    Some(Amount::All) if !source.depletable() => {
                        errors.log("Requested `all` items but the source is not depletable.", true);
                        return (None, errors);
                    }
                    Some(Amount::All) if takes_n => args.insert("n", ArgValue::Int(-1)),
                    Some(Amount::Count(n)) if takes_n => args.insert("n", ArgValue::Int(n as i64)),
                    _ => {}
                }
                match source.generate(ctx, &args).await {
                    Ok(values) => (Some(values), errors),
                    Err(e) => {
                        errors.log_error(
                            format!("Failed to evaluate Source `{}` with args {args}", self.name),
                            &e,
                        );
                        (None, errors)
                    }
                }
            }
            SourceKind::Pipe(pipe) => {
                if !pipe.may_use(&ctx.origin.activator) {
                    errors.log(format!("User lacks permission to use Pipe `{}`.", self.name), true);
                    return (None, errors);
                }
                let Some(input) = self.evaluate_remainder(ctx, scope, &mut errors).await else {
                    return (None, errors);
                };
                match pipe.apply(vec![input], &args).await {
                    Ok(values) => (Some(values), errors),
                    Err(e) => {
                        errors.log_error(
                            format!("Failed to evaluate Pipe-as-Source `{}` with args {args}", self.name),
                            &e,
                        );
                        (None, errors)
                    }
                }
            }
            SourceKind::Other => self.evaluate_macro(ctx, scope, args, errors).await,
        }
    }

    async fn evaluate_macro(
        &self,
        ctx: &Context,
        scope: Option<&ItemScope>,
        args: EvaluatedArguments,
        mut errors: ErrorLog,
    ) -> (Option<Vec<String>>, ErrorLog) {
        let rt = &ctx.runtime;
        if let Some(pipe_macro) = rt.macros.get(MacroKind::Pipe, &self.name) {
            let Some(input) = self.evaluate_remainder(ctx, scope, &mut errors).await else {
                return (None, errors);
            };
            let (values, errs, _) = macros::run_pipe_macro(pipe_macro, vec![input], args.to_strings(), ctx).await;
            errors.extend_in(&errs, &self.name);
            return (values.filter(|_| !errors.is_terminal()), errors);
        }

        if let Some(source_macro) = rt.macros.get(MacroKind::Source, &self.name) {
            let mut bound: BTreeMap<String, String> = args.to_strings();
            if let Some(Amount::Count(n)) = self.amount {
                if source_macro.has_param("n") {
                    bound.insert("n".into(), n.to_string());
                }
            }
            // Implicit text fills the one parameter left unassigned, if there is one.
            if self.remainder.is_some() {
                if let Some(param) = source_macro.sole_unassigned(&bound) {
                    let Some(text) = self.evaluate_remainder(ctx, scope, &mut errors).await else {
                        return (None, errors);
                    };
                    bound.insert(param, text);
                }
            }
            let (values, errs, _) = macros::run_source_macro(source_macro, bound, ctx).await;
            errors.extend_in(&errs, &self.name);
            return (values.filter(|_| !errors.is_terminal()), errors);
        }

        errors.log(format!("Unknown source `{}`.", self.name), true);
        (None, errors)
    }
}

impl fmt::Display for TmplSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bits = Vec::new();
        match self.amount {
            Some(Amount::All) => bits.push("ALL".to_string()),
            Some(Amount::Count(n)) => bits.push(n.to_string()),
            None => {}
        }
        bits.push(self.name.clone());
        let args = self.args.to_string();
        if !args.is_empty() {
            bits.push(args);
        }
        if let Some(rest) = &self.remainder {
            bits.push(rest.to_string());
        }
        write!(f, "{{{}}}", bits.join(" "))
    }
}

// ---------------------------------------------------------------------------
// Conditionals
// ---------------------------------------------------------------------------

/// `{? case_if if condition else case_else}`
#[derive(Debug, Clone)]
pub struct TmplConditional {
    case_if: TemplatedString,
    condition: Condition,
    case_else: TemplatedString,
}

impl TmplConditional {
    pub async fn evaluate(&self, ctx: &Context, scope: Option<&ItemScope>) -> (Option<String>, ErrorLog) {
        let mut errors = ErrorLog::new();
        let (result, errs) = self.condition.evaluate(ctx, scope).await;
        errors.extend_in(&errs, "condition");
        let Some(result) = result.filter(|_| !errors.is_terminal()) else {
            return (None, errors);
        };
        let case = if result { &self.case_if } else { &self.case_else };
        let (value, errs) = case.evaluate(ctx, scope).await;
        errors.extend(&errs);
        (value.filter(|_| !errors.is_terminal()), errors)
    }
}

impl fmt::Display for TmplConditional {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{? {} if {} else {}}}",
            self.case_if, self.condition, self.case_else
        )
    }
}

// ---------------------------------------------------------------------------
// TemplatedString
// ---------------------------------------------------------------------------

/// A string that may contain templated elements, evaluated into one or many strings.
///
/// Always holds at least one piece; adjacent text pieces are merged and empty
/// ones dropped, so a plain string is exactly one text piece.
#[derive(Debug, Clone)]
pub struct TemplatedString {
    pieces: Vec<Piece>,
    /// Problems found while building the string, reported on every evaluation.
    pub pre_errors: ErrorLog,
    /// The next implicit item index after this string.
    pub end_index: usize,
}

impl TemplatedString {
    /// Build from parsed elements, numbering implicit `{}` items from `start_index`.
    ///
    /// Numbering continues through nested source arguments and conditionals,
    /// so `{} {repeat times={}} {}` refers to items 0, 1 and 2.
    pub fn from_elements(elements: &[Element], start_index: usize, rt: &Runtime) -> Self {
        let mut pieces = Vec::with_capacity(elements.len());
        let mut pre_errors = ErrorLog::new();
        let mut index = start_index;
        let (mut implicit, mut explicit) = (false, false);

        for element in elements {
            match element {
                Element::Text { text } => pieces.push(Piece::Text(text.clone())),
                Element::Special { name } => match special_symbol(name) {
                    Some(symbol) => pieces.push(Piece::Text(symbol)),
                    None => {
                        pre_errors.log(format!("Unknown special symbol \"\\{name}\"."), true);
                    }
                },
                Element::Item(Item::Implicit { carrots, bang }) => {
                    implicit = true;
                    pieces.push(Piece::Item(TmplItem {
                        indices: vec![ItemIndex::Index {
                            carrots: *carrots,
                            index: index as i64,
                            bang: *bang,
                        }],
                        implicit: true,
                    }));
                    index += 1;
                }
                Element::Item(Item::Explicit(indices)) => {
                    explicit = true;
                    pieces.push(Piece::Item(TmplItem {
                        indices: indices.clone(),
                        implicit: false,
                    }));
                }
                Element::Source(call) => {
                    let (source, mut errors, end) = TmplSource::from_call(call, index, rt);
                    pre_errors.steal(&mut errors, Some(&source.name));
                    index = end;
                    pieces.push(Piece::Source(Arc::new(source)));
                }
                Element::Conditional(cond) => {
                    let case_if = Self::from_elements(&cond.case_if, index, rt);
                    let (condition, errors, end) = Condition::from_ast(&cond.condition, case_if.end_index, rt);
                    let case_else = Self::from_elements(&cond.case_else, end, rt);
                    index = case_else.end_index;
                    pre_errors.extend(&case_if.pre_errors);
                    pre_errors.extend(&errors);
                    pre_errors.extend(&case_else.pre_errors);
                    pieces.push(Piece::Conditional(Arc::new(TmplConditional {
                        case_if,
                        condition,
                        case_else,
                    })));
                }
                Element::InlineScript { script } => {
                    let script = ExecutableScript::from_string(script, rt);
                    pre_errors.extend_in(&script.get_static_errors(), "inline script");
                    pieces.push(Piece::Script(script));
                }
            }
        }

        if implicit && explicit {
            pre_errors.log("Do not mix empty `{}`'s with numbered `{}`'s!", true);
        }

        Self {
            pieces,
            pre_errors,
            end_index: index,
        }
        .flush()
    }

    /// Parse an absolute templated string.
    pub fn parse(text: &str, rt: &Runtime) -> std::result::Result<Self, ParseError> {
        let elements = grammar::parse_template(text)?;
        Ok(Self::from_elements(&elements, 0, rt))
    }

    /// A plain string, without anything to evaluate.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            pieces: vec![Piece::Text(text.into())],
            pre_errors: ErrorLog::new(),
            end_index: 0,
        }
        .flush()
    }

    fn flush(mut self) -> Self {
        let mut pieces: Vec<Piece> = Vec::with_capacity(self.pieces.len());
        for piece in std::mem::take(&mut self.pieces) {
            if let Piece::Text(text) = &piece {
                if text.is_empty() {
                    continue;
                }
                if let Some(Piece::Text(prev)) = pieces.last_mut() {
                    prev.push_str(text);
                    continue;
                }
            }
            pieces.push(piece);
        }
        if pieces.is_empty() {
            pieces.push(Piece::Text(String::new()));
        }
        self.pieces = pieces;
        self
    }

    /// The plain string, if this is nothing but one (without pre-errors).
    pub fn as_string(&self) -> Option<&str> {
        match self.pieces.as_slice() {
            [Piece::Text(t)] if self.pre_errors.is_empty() => Some(t),
            _ => None,
        }
    }

    /// Whether this is the static empty string.
    pub fn is_empty(&self) -> bool {
        self.as_string() == Some("")
    }

    /// The sole piece, if it is an item, source or inline script: these may
    /// produce any number of values rather than exactly one.
    fn sole_multi(&self) -> Option<&Piece> {
        match self.pieces.as_slice() {
            [piece @ (Piece::Item(_) | Piece::Source(_) | Piece::Script(_))] => Some(piece),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Manipulation
    // -----------------------------------------------------------------------

    /// Trim leading and trailing whitespace from the outer text pieces.
    pub fn strip(mut self) -> Self {
        if let Some(Piece::Text(t)) = self.pieces.first_mut() {
            *t = t.trim_start().to_string();
        }
        if let Some(Piece::Text(t)) = self.pieces.last_mut() {
            *t = t.trim_end().to_string();
        }
        self.flush()
    }

    /// Remove wrapping `"""`, `"`, `'` or `/` delimiters, if any.
    pub fn unquote(mut self) -> Self {
        let is_string = self.as_string().is_some();
        let single = self.pieces.len() == 1;
        let (Some(Piece::Text(first)), Some(Piece::Text(last))) = (self.pieces.first(), self.pieces.last()) else {
            return self;
        };

        let cut = if first.starts_with("\"\"\"") && last.ends_with("\"\"\"") && !(is_string && first.len() < 6) {
            3
        } else {
            match (first.chars().next(), last.chars().last()) {
                (Some(a), Some(b)) if a == b && matches!(a, '"' | '\'' | '/') && !(is_string && first.len() < 2) => 1,
                _ => 0,
            }
        };
        if cut == 0 || (single && first.len() < 2 * cut) {
            return self;
        }

        if single {
            if let Some(Piece::Text(t)) = self.pieces.first_mut() {
                *t = t[cut..t.len() - cut].to_string();
            }
        } else {
            if let Some(Piece::Text(t)) = self.pieces.first_mut() {
                *t = t[cut..].to_string();
            }
            if let Some(Piece::Text(t)) = self.pieces.last_mut() {
                *t = t[..t.len() - cut].to_string();
            }
        }
        self.flush()
    }

    /// Concatenate, with `sep` between each, keeping existing item numbering.
    pub fn join(strings: Vec<TemplatedString>, sep: &str) -> Self {
        let mut pieces = Vec::new();
        let mut pre_errors = ErrorLog::new();
        let mut end_index = 0;
        for (i, ts) in strings.into_iter().enumerate() {
            if i > 0 && !sep.is_empty() {
                pieces.push(Piece::Text(sep.to_string()));
            }
            pre_errors.extend(&ts.pre_errors);
            end_index = end_index.max(ts.end_index);
            pieces.extend(ts.pieces);
        }
        Self {
            pieces,
            pre_errors,
            end_index,
        }
        .flush()
    }

    /// Split off an implicit argument value.
    ///
    /// Greedy: the whole (unquoted) string is the value. Otherwise the value
    /// runs up to the first space in a text piece and the rest is returned as
    /// the remainder.
    pub fn split_implicit_arg(self, greedy: bool) -> (TemplatedString, Option<TemplatedString>) {
        if greedy {
            return (self.unquote(), None);
        }
        let mut implicit = Vec::new();
        let mut remainder = Vec::new();
        let mut pieces = self.pieces.into_iter();
        while let Some(piece) = pieces.next() {
            if let Piece::Text(text) = &piece {
                if let Some((head, tail)) = text.split_once(' ') {
                    implicit.push(Piece::Text(head.to_string()));
                    remainder.push(Piece::Text(tail.to_string()));
                    remainder.extend(pieces.by_ref());
                    break;
                }
            }
            implicit.push(piece);
        }
        let implicit = Self {
            pieces: implicit,
            pre_errors: self.pre_errors,
            end_index: self.end_index,
        }
        .flush()
        .unquote();
        let remainder = Self {
            pieces: remainder,
            pre_errors: ErrorLog::new(),
            end_index: self.end_index,
        }
        .flush();
        (implicit, Some(remainder))
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Evaluate into a single string. Multi-valued pieces contribute only
    /// their first value (or nothing if they have none).
    pub fn evaluate<'a>(
        &'a self,
        ctx: &'a Context,
        scope: Option<&'a ItemScope>,
    ) -> BoxFuture<'a, (Option<String>, ErrorLog)> {
        async move {
            if let Some(s) = self.as_string() {
                return (Some(s.to_string()), ErrorLog::new());
            }
            let (parts, errors) = self.intermediate(ctx, scope).await;
            let Some(parts) = parts else {
                return (None, errors);
            };
            let joined = parts
                .into_iter()
                .map(|part| match part {
                    Part::One(s) => s,
                    Part::Many(values) => values.into_iter().next().unwrap_or_default(),
                })
                .collect();
            (Some(joined), errors)
        }
        .boxed()
    }

    /// Evaluate into every combination of the pieces' values, the leftmost
    /// piece varying fastest.
    pub fn multiple_evaluate<'a>(
        &'a self,
        ctx: &'a Context,
        scope: Option<&'a ItemScope>,
    ) -> BoxFuture<'a, (Option<Vec<String>>, ErrorLog)> {
        async move {
            if let Some(s) = self.as_string() {
                return (Some(vec![s.to_string()]), ErrorLog::new());
            }
            let (parts, errors) = self.intermediate(ctx, scope).await;
            let Some(parts) = parts else {
                return (None, errors);
            };
            let mut strings = vec![String::new()];
            for part in parts {
                let options = match part {
                    Part::One(s) => vec![s],
                    Part::Many(values) => values,
                };
                let mut next = Vec::with_capacity(strings.len() * options.len());
                for option in &options {
                    for s in &strings {
                        next.push(format!("{s}{option}"));
                    }
                }
                strings = next;
            }
            (Some(strings), errors)
        }
        .boxed()
    }

    /// Resolve every piece; sources, conditionals and inline scripts run
    /// concurrently but come back in textual order.
    async fn intermediate(&self, ctx: &Context, scope: Option<&ItemScope>) -> (Option<Vec<Part>>, ErrorLog) {
        let mut errors = self.pre_errors.clone();
        if errors.is_terminal() {
            return (None, errors);
        }

        let mut slots: Vec<Option<Part>> = Vec::with_capacity(self.pieces.len());
        let mut futures: Vec<BoxFuture<'_, (Option<Part>, ErrorLog)>> = Vec::new();

        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => slots.push(Some(Part::One(text.clone()))),
                Piece::Item(item) => match item.evaluate(scope) {
                    Ok(values) => slots.push(Some(Part::Many(values))),
                    Err(e) => {
                        errors.log_error(format!("Error filling in item `{item}`"), &e);
                    }
                },
                Piece::Source(source) => {
                    slots.push(None);
                    futures.push(
                        async move {
                            let (values, errs) = source.evaluate(ctx, scope).await;
                            (values.map(Part::Many), errs)
                        }
                        .boxed(),
                    );
                }
                Piece::Conditional(cond) => {
                    slots.push(None);
                    futures.push(
                        async move {
                            let (value, errs) = cond.evaluate(ctx, scope).await;
                            (value.map(Part::One), errs)
                        }
                        .boxed(),
                    );
                }
                Piece::Script(script) => {
                    slots.push(None);
                    futures.push(
                        async move {
                            let (values, errs, _) = script.execute_without_side_effects(ctx, scope).await;
                            (values.map(Part::Many), errs)
                        }
                        .boxed(),
                    );
                }
            }
        }
        if errors.is_terminal() {
            return (None, errors);
        }

        let mut results = join_all(futures).await.into_iter();
        let mut parts = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Some(part) => parts.push(part),
                None => {
                    if let Some((part, errs)) = results.next() {
                        errors.extend(&errs);
                        parts.extend(part);
                    }
                }
            }
        }
        if errors.is_terminal() {
            return (None, errors);
        }
        (Some(parts), errors)
    }

    /// Evaluate the sole multi-valued piece, if that is all there is.
    async fn evaluate_sole(&self, ctx: &Context, scope: Option<&ItemScope>) -> Option<(Option<Vec<String>>, ErrorLog)> {
        let piece = self.sole_multi()?;
        let mut errors = self.pre_errors.clone();
        if errors.is_terminal() {
            return Some((None, errors));
        }
        let values = match piece {
            Piece::Item(item) => match item.evaluate(scope) {
                Ok(values) => Some(values),
                Err(e) => {
                    errors.log_error(format!("Error filling in item `{item}`"), &e);
                    None
                }
            },
            Piece::Source(source) => {
                let (values, errs) = source.evaluate(ctx, scope).await;
                errors.extend(&errs);
                values
            }
            Piece::Script(script) => {
                let (values, errs, _) = script.execute_without_side_effects(ctx, scope).await;
                errors.extend(&errs);
                values
            }
            Piece::Text(_) | Piece::Conditional(_) => None,
        };
        Some((values.filter(|_| !errors.is_terminal()), errors))
    }

    /// Parse and evaluate `text` in one go. Unless `force_single`, a string
    /// that is a single item, source or inline script yields all its values.
    pub async fn evaluate_string(
        text: &str,
        ctx: &Context,
        scope: Option<&ItemScope>,
        force_single: bool,
    ) -> (Option<Vec<String>>, ErrorLog) {
        let template = match Self::parse(text, &ctx.runtime) {
            Ok(t) => t,
            Err(e) => {
                let mut errors = ErrorLog::new();
                errors.log_parse_error(&e);
                return (None, errors);
            }
        };
        if !force_single {
            if let Some(result) = template.evaluate_sole(ctx, scope).await {
                return result;
            }
        }
        let (value, errors) = template.evaluate(ctx, scope).await;
        (value.map(|v| vec![v]), errors)
    }

    /// Evaluate each string in turn and gather the values; single item,
    /// source or script strings may contribute any number of values.
    pub async fn map_evaluate(
        strings: &[TemplatedString],
        ctx: &Context,
        scope: Option<&ItemScope>,
    ) -> (Option<Vec<String>>, ErrorLog) {
        let mut errors = ErrorLog::new();
        let mut values = Vec::new();
        for tstring in strings {
            if let Some((vals, errs)) = tstring.evaluate_sole(ctx, scope).await {
                errors.extend(&errs);
                if errors.is_terminal() {
                    return (None, errors);
                }
                values.extend(vals.unwrap_or_default());
            } else {
                let (value, errs) = tstring.evaluate(ctx, scope).await;
                errors.extend(&errs);
                if errors.is_terminal() {
                    return (None, errors);
                }
                values.extend(value);
            }
        }
        (Some(values), errors)
    }

    // -----------------------------------------------------------------------
    // Origins
    // -----------------------------------------------------------------------

    /// Parse a script origin into the templated strings it expands to.
    ///
    /// A `"""`-wrapped origin is taken literally (no bracket expansion); a
    /// `"`, `'` or `/` wrapped one is unwrapped and then expanded.
    pub fn parse_origin(origin: &str, rt: &Runtime) -> (Vec<TemplatedString>, ErrorLog) {
        let mut errors = ErrorLog::new();
        let bytes = origin.as_bytes();
        let len = bytes.len();

        let alternatives = if len >= 6 && origin.starts_with("\"\"\"") && origin.ends_with("\"\"\"") {
            vec![origin[3..len - 3].to_string()]
        } else {
            let inner = if len >= 2 && bytes[0] == bytes[len - 1] && matches!(bytes[0], b'"' | b'\'' | b'/') {
                &origin[1..len - 1]
            } else {
                origin
            };
            let (flag, body) = match inner.strip_prefix("[?]") {
                Some(rest) => ("[?]", rest),
                None => ("", inner),
            };
            match ChoiceTree::parse_with_flags(&format!("{flag}[{body}]")) {
                Ok(tree) => tree.expand(),
                Err(e) => {
                    errors.log_parse_error(&e);
                    return (Vec::new(), errors);
                }
            }
        };

        let mut strings = Vec::with_capacity(alternatives.len());
        for alt in alternatives {
            match Self::parse(&alt, rt) {
                Ok(tstring) => {
                    errors.extend(&tstring.pre_errors);
                    strings.push(tstring);
                }
                Err(e) => {
                    errors.log_parse_error(&e);
                }
            }
        }
        (strings, errors)
    }

    /// Parse and evaluate an origin into the script's starting items.
    pub async fn evaluate_origin(origin: &str, ctx: &Context, scope: Option<&ItemScope>) -> (Option<Vec<String>>, ErrorLog) {
        let (strings, errors) = Self::parse_origin(origin, &ctx.runtime);
        // Non-terminal pre-errors resurface during evaluation.
        if errors.is_terminal() {
            return (None, errors);
        }
        Self::map_evaluate(&strings, ctx, scope).await
    }
}

impl fmt::Display for TemplatedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for piece in &self.pieces {
            write!(f, "{piece}")?;
        }
        Ok(())
    }
}

fn special_symbol(name: &str) -> Option<String> {
    match name {
        "n" => Some("\n".into()),
        "t" => Some("\t".into()),
        _ => {
            let hex = name.strip_prefix('x').filter(|h| h.len() == 2)?;
            let code = u8::from_str_radix(hex, 16).ok()?;
            Some(char::from(code).to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_runtime;

    fn parse(text: &str) -> TemplatedString {
        TemplatedString::parse(text, &test_runtime()).unwrap()
    }

    fn items(v: &[&str]) -> ItemScope {
        ItemScope::root(v.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn plain_strings_are_flushed_to_one_piece() {
        let ts = parse("hello world");
        assert_eq!(ts.as_string(), Some("hello world"));
        assert!(parse("").is_empty());
    }

    #[test]
    fn special_symbols_become_text() {
        assert_eq!(parse("a{\\n}b{\\x41}").as_string(), Some("a\nbA"));
        let ts = parse("{\\q}");
        assert!(ts.pre_errors.is_terminal());
        assert_eq!(ts.pre_errors.entries()[0].message, "Unknown special symbol \"\\q\".");
    }

    #[test]
    fn mixing_implicit_and_explicit_items_is_an_error() {
        let ts = parse("{} and {0}");
        assert!(ts.pre_errors.is_terminal());
        assert_eq!(
            ts.pre_errors.entries()[0].message,
            "Do not mix empty `{}`'s with numbered `{}`'s!"
        );
    }

    #[test]
    fn implicit_numbering_runs_through_sources() {
        let ts = parse("{} {repeat times={}} {}");
        assert_eq!(ts.end_index, 3);
    }

    #[test]
    fn unknown_parameters_are_prefixed_with_the_source_name() {
        let ts = parse("{output foo=1}");
        assert!(!ts.pre_errors.is_terminal());
        assert_eq!(
            ts.pre_errors.entries()[0].message,
            "**in output:** Unknown parameter `foo`"
        );
    }

    #[test]
    fn unquote_rules() {
        assert_eq!(TemplatedString::from_text("\"abc\"").unquote().as_string(), Some("abc"));
        assert_eq!(TemplatedString::from_text("/a+/").unquote().as_string(), Some("a+"));
        assert_eq!(TemplatedString::from_text("\"\"\"x\"\"\"").unquote().as_string(), Some("x"));
        assert_eq!(TemplatedString::from_text("\"").unquote().as_string(), Some("\""));
        assert_eq!(TemplatedString::from_text("'a\"").unquote().as_string(), Some("'a\""));
    }

    #[test]
    fn strip_and_join() {
        let a = TemplatedString::from_text("  a ");
        let b = TemplatedString::from_text("b  ");
        let joined = TemplatedString::join(vec![a.strip(), b.strip()], " ");
        assert_eq!(joined.as_string(), Some("a b"));
    }

    #[test]
    fn split_implicit_arg_on_first_space() {
        let (head, rest) = TemplatedString::from_text("one two three").split_implicit_arg(false);
        assert_eq!(head.as_string(), Some("one"));
        assert_eq!(rest.unwrap().as_string(), Some("two three"));

        let (head, rest) = TemplatedString::from_text("\"one two\"").split_implicit_arg(true);
        assert_eq!(head.as_string(), Some("one two"));
        assert!(rest.is_none());

        let (head, rest) = TemplatedString::from_text("single").split_implicit_arg(false);
        assert_eq!(head.as_string(), Some("single"));
        assert!(rest.unwrap().is_empty());
    }

    #[tokio::test]
    async fn evaluate_fills_in_items_and_sources() {
        let rt = test_runtime();
        let ctx = Context::for_tests(rt.clone());
        let scope = items(&["alpha", "beta"]);
        let ts = TemplatedString::parse("{1}-{0}-{upper {0}}", &rt).unwrap();
        let (value, errors) = ts.evaluate(&ctx, Some(&scope)).await;
        assert!(errors.is_empty(), "{errors}");
        assert_eq!(value.as_deref(), Some("beta-alpha-ALPHA"));
    }

    #[tokio::test]
    async fn item_errors_are_terminal() {
        let rt = test_runtime();
        let ctx = Context::for_tests(rt.clone());
        let ts = TemplatedString::parse("{5}", &rt).unwrap();
        let (value, errors) = ts.evaluate(&ctx, Some(&items(&["a"]))).await;
        assert!(value.is_none());
        assert!(errors.is_terminal());
        assert!(errors.entries()[0]
            .message
            .starts_with("Error filling in item `{5}`:\n\tItemScopeError: Out of range"));

        let (_, errors) = ts.evaluate(&ctx, None).await;
        assert!(errors.entries()[0].message.ends_with("ItemScopeError: No scope!"));
    }

    #[tokio::test]
    async fn multiple_evaluate_varies_leftmost_fastest() {
        let rt = test_runtime();
        let ctx = Context::for_tests(rt.clone());
        let scope = items(&["a", "b", "c", "d"]);
        let ts = TemplatedString::parse("{0:2}{2:4}", &rt).unwrap();
        let (values, errors) = ts.multiple_evaluate(&ctx, Some(&scope)).await;
        assert!(errors.is_empty());
        assert_eq!(values.unwrap(), vec!["ac", "bc", "ad", "bd"]);
    }

    #[tokio::test]
    async fn conditionals_pick_a_branch() {
        let rt = test_runtime();
        let ctx = Context::for_tests(rt.clone());
        let ts = TemplatedString::parse("{? big if {0} > 10 else small}", &rt).unwrap();
        let (value, _) = ts.evaluate(&ctx, Some(&items(&["12"]))).await;
        assert_eq!(value.as_deref(), Some("big"));
        let (value, _) = ts.evaluate(&ctx, Some(&items(&["3"]))).await;
        assert_eq!(value.as_deref(), Some("small"));
    }

    #[tokio::test]
    async fn unknown_sources_are_terminal() {
        let rt = test_runtime();
        let ctx = Context::for_tests(rt.clone());
        let (values, errors) = TemplatedString::evaluate_string("{nonsense}", &ctx, None, false).await;
        assert!(values.is_none());
        assert_eq!(errors.entries()[0].message, "Unknown source `nonsense`.");
    }

    #[tokio::test]
    async fn all_on_a_non_depletable_source_is_refused() {
        let rt = test_runtime();
        let ctx = Context::for_tests(rt.clone());
        let (_, errors) = TemplatedString::evaluate_string("{all arg x}", &ctx, None, false).await;
        assert_eq!(
            errors.entries()[0].message,
            "Requested `all` items but the source is not depletable."
        );
    }

    #[tokio::test]
    async fn sole_items_yield_every_value() {
        let rt = test_runtime();
        let ctx = Context::for_tests(rt.clone());
        let scope = items(&["a", "b", "c"]);
        let (values, _) = TemplatedString::evaluate_string("{1:}", &ctx, Some(&scope), false).await;
        assert_eq!(values.unwrap(), vec!["b", "c"]);
        let (values, _) = TemplatedString::evaluate_string("{1:}", &ctx, Some(&scope), true).await;
        assert_eq!(values.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn origins_expand_and_unwrap() {
        let rt = test_runtime();
        let ctx = Context::for_tests(rt.clone());
        let (values, errors) = TemplatedString::evaluate_origin("[a|b]c", &ctx, None).await;
        assert!(errors.is_empty());
        assert_eq!(values.unwrap(), vec!["ac", "bc"]);

        let (values, _) = TemplatedString::evaluate_origin("x|y", &ctx, None).await;
        assert_eq!(values.unwrap(), vec!["x", "y"]);

        let (values, _) = TemplatedString::evaluate_origin("\"\"\"[a|b]\"\"\"", &ctx, None).await;
        assert_eq!(values.unwrap(), vec!["[a|b]"]);

        let (values, _) = TemplatedString::evaluate_origin("\"[a|b] c\"", &ctx, None).await;
        assert_eq!(values.unwrap(), vec!["a c", "b c"]);
    }

    #[tokio::test]
    async fn unbalanced_origin_brackets_are_parse_errors() {
        let rt = test_runtime();
        let (strings, errors) = TemplatedString::parse_origin("[a|b", &rt);
        assert!(strings.is_empty());
        assert!(errors.is_terminal());
    }
}
