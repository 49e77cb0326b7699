//! Pipelines: sequences of segments, each spreading the current items over
//! one or more parallel pipes according to its group mode.
//!
//! ```text
//! upper > (2) [join s=, | reverse] > >> {0} and {1}
//! ```
//!
//! A segment is either a group mode with its targets or, after `>>`, an origin
//! that replaces the items outright. Targets are parsed pipes (natives, macros,
//! `print`, no-ops) or parenthesized pipelines, optionally iterated with `^N`.

use std::fmt;

use futures::future::{BoxFuture, FutureExt};

use pipescript_grammar::{expand_segment, parse_groupmode, parse_inline_pipeline, split_segments};
use pipescript_types::{ErrorLog, ItemScope, Result, ScriptError};

use crate::context::{Context, Runtime};
use crate::groupmode::GroupMode;
use crate::macros::{self, MacroKind};
use crate::registry::{Pipe, Source, Spout};
use crate::signature::{Arguments, EvaluatedArguments};
use crate::spout_state::SpoutState;
use crate::templated::TemplatedString;

/// Resulting items (if no terminal error occurred), the errors, and the
/// side effects to perform once the whole script is done.
pub type PipelineOutput = (Option<Vec<String>>, ErrorLog, SpoutState);

// ---------------------------------------------------------------------------
// ParsedPipe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum PipeTarget {
    NoOp,
    Print,
    Pipe(std::sync::Arc<dyn Pipe>),
    Source(std::sync::Arc<dyn Source>),
    Spout(std::sync::Arc<dyn Spout>),
    PipeMacro,
    SourceMacro,
    /// Not known when parsed; may name a macro defined since.
    Unknown,
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_lowercase())
        && chars.all(|c| c == '_' || c.is_alphanumeric())
}

/// A single `name [args]` pipe.
#[derive(Debug, Clone)]
pub struct ParsedPipe {
    name: String,
    argstr: String,
    arguments: Option<Arguments>,
    remainder: Option<TemplatedString>,
    target: PipeTarget,
}

impl ParsedPipe {
    pub fn parse(pipestr: &str, rt: &Runtime) -> (Self, ErrorLog) {
        let mut errors = ErrorLog::new();
        let (name, argstr) = match pipestr.split_once(char::is_whitespace) {
            Some((name, argstr)) => (name, argstr.trim()),
            None => (pipestr, ""),
        };
        let name = name.to_lowercase();
        let mut pipe = Self {
            name,
            argstr: argstr.to_string(),
            arguments: None,
            remainder: None,
            target: PipeTarget::NoOp,
        };

        if pipe.name.is_empty() || pipe.name == "nop" {
            return (pipe, errors);
        }
        if pipe.name == "print" {
            pipe.target = PipeTarget::Print;
            return (pipe, errors);
        }
        if !is_valid_name(&pipe.name) {
            errors.log(format!("Invalid pipe name \"{}\"", pipe.name), true);
            return (pipe, errors);
        }

        let natives = &rt.natives;
        let (target, signature) = if let Some(p) = natives.pipes.get(&pipe.name) {
            (PipeTarget::Pipe(p.clone()), Some(p.signature()))
        } else if let Some(s) = natives.spouts.get(&pipe.name) {
            (PipeTarget::Spout(s.clone()), Some(s.signature()))
        } else if let Some(s) = natives.sources.get(&pipe.name) {
            (PipeTarget::Source(s.clone()), Some(s.signature()))
        } else if rt.macros.contains(MacroKind::Pipe, &pipe.name) {
            (PipeTarget::PipeMacro, None)
        } else if rt.macros.contains(MacroKind::Source, &pipe.name) {
            (PipeTarget::SourceMacro, None)
        } else {
            (PipeTarget::Unknown, None)
        };

        let parsed = Arguments::from_string(argstr, signature, true, rt);
        errors.extend_in(&parsed.errors, &pipe.name);
        pipe.arguments = Some(parsed.arguments);
        match (&target, parsed.remainder) {
            (PipeTarget::PipeMacro | PipeTarget::SourceMacro | PipeTarget::Unknown, rest) => {
                pipe.remainder = rest
            }
            (_, Some(rest)) if !rest.is_empty() => {
                errors.log_in(format!("Unused implicit argument `{rest}`."), false, &pipe.name);
            }
            _ => {}
        }
        pipe.target = target;
        (pipe, errors)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply to `items`, which have already been stripped of ignored items.
    ///
    /// Spout encounters and printed items are recorded in `spouts`.
    async fn apply(
        &self,
        items: Vec<String>,
        args: EvaluatedArguments,
        ctx: &Context,
        scope: &ItemScope,
        singular: bool,
        printed: &mut Vec<String>,
        spouts: &mut SpoutState,
    ) -> (Option<Vec<String>>, ErrorLog) {
        let mut errors = ErrorLog::new();
        let name = &self.name;

        match &self.target {
            PipeTarget::NoOp => (Some(items), errors),
            PipeTarget::Print => {
                printed.extend(items.iter().cloned());
                if let Some(print) = ctx.runtime.natives.spouts.get("print") {
                    spouts.hook(print.clone(), items.clone(), args);
                }
                (Some(items), errors)
            }
            PipeTarget::Pipe(pipe) => {
                if !pipe.may_use(&ctx.origin.activator) {
                    errors.log(format!("User lacks permission to use Pipe `{name}`."), true);
                    return (None, errors);
                }
                match pipe.apply(items, &args).await {
                    Ok(values) => (Some(values), errors),
                    Err(e) => {
                        errors.log_error(format!("Failed to process Pipe `{name}` with args {args}"), &e);
                        (None, errors)
                    }
                }
            }
            PipeTarget::Spout(spout) => {
                spouts.hook(spout.clone(), items.clone(), args);
                (Some(items), errors)
            }
            PipeTarget::Source(source) => match source.generate(ctx, &args).await {
                Ok(values) => (Some(values), errors),
                Err(e) => {
                    errors.log_error(
                        format!("Failed to process Source-as-Pipe `{name}` with args {args}"),
                        &e,
                    );
                    (None, errors)
                }
            },
            PipeTarget::PipeMacro => {
                self.apply_macro(Some(MacroKind::Pipe), items, args, ctx, scope, singular, spouts)
                    .await
            }
            PipeTarget::SourceMacro => {
                self.apply_macro(Some(MacroKind::Source), items, args, ctx, scope, singular, spouts)
                    .await
            }
            PipeTarget::Unknown => self.apply_macro(None, items, args, ctx, scope, singular, spouts).await,
        }
    }

    /// Run the macro of `kind`, or with no kind, whichever macro now goes by
    /// this pipe's name.
    #[allow(clippy::too_many_arguments)]
    async fn apply_macro(
        &self,
        kind: Option<MacroKind>,
        items: Vec<String>,
        args: EvaluatedArguments,
        ctx: &Context,
        scope: &ItemScope,
        singular: bool,
        spouts: &mut SpoutState,
    ) -> (Option<Vec<String>>, ErrorLog) {
        let mut errors = ErrorLog::new();
        let macros = &ctx.runtime.macros;
        let resolved = match kind {
            Some(kind) => macros.get(kind, &self.name).map(|m| (kind, m)),
            None => [MacroKind::Pipe, MacroKind::Source]
                .into_iter()
                .find_map(|kind| macros.get(kind, &self.name).map(|m| (kind, m))),
        };
        let Some((kind, macro_def)) = resolved else {
            errors.log(format!("Unknown pipe `{}`.", self.name), true);
            return (None, errors);
        };

        let mut bound = args.to_strings();
        if let Some(remainder) = &self.remainder {
            if let Some(param) = macro_def.sole_unassigned(&bound) {
                let (text, errs) = remainder.evaluate(ctx, Some(scope)).await;
                errors.extend_in(&errs, &self.name);
                let Some(text) = text.filter(|_| !errors.is_terminal()) else {
                    return (None, errors);
                };
                bound.insert(param, text);
            }
        }

        match kind {
            MacroKind::Pipe => {
                let (values, errs, macro_spouts) = macros::run_pipe_macro(macro_def, items, bound, ctx).await;
                errors.extend_in(&errs, &self.name);
                if errors.is_terminal() {
                    return (None, errors);
                }
                spouts.extend(macro_spouts, singular);
                (values, errors)
            }
            MacroKind::Source => {
                let (values, errs, _) = macros::run_source_macro(macro_def, bound, ctx).await;
                errors.extend_in(&errs, "source-as-pipe");
                (values.filter(|_| !errors.is_terminal()), errors)
            }
        }
    }
}

impl fmt::Display for ParsedPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.argstr.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{} {}", self.name, self.argstr)
        }
    }
}

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Target {
    Pipe(ParsedPipe),
    Nested(Pipeline),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Pipe(pipe) => pipe.fmt(f),
            Target::Nested(pipeline) if pipeline.iterations == 1 => write!(f, "({pipeline})"),
            Target::Nested(pipeline) => write!(f, "({pipeline})^{}", pipeline.iterations),
        }
    }
}

#[derive(Debug)]
enum Segment {
    /// `>> origin`: replaces the items with the origin's evaluation.
    Origin(String),
    Pipes {
        group_mode: GroupMode,
        targets: Vec<Target>,
    },
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Pipeline {
    segments: Vec<Segment>,
    /// Errors found while parsing, including those of nested pipelines.
    pub parser_errors: ErrorLog,
    /// How many times the segments are applied in sequence.
    pub iterations: usize,
}

impl Pipeline {
    pub fn parse(text: &str, rt: &Runtime) -> Self {
        Self::parse_iterated(text, 1, rt)
    }

    fn parse_iterated(text: &str, iterations: usize, rt: &Runtime) -> Self {
        let mut errors = ErrorLog::new();
        let mut segments = Vec::new();

        let raw = split_segments(text);
        let last = raw.len().saturating_sub(1);
        let mut origin_next = false;
        for (i, segment) in raw.iter().enumerate() {
            if origin_next {
                origin_next = false;
                let (_, origin_errors) = TemplatedString::parse_origin(segment, rt);
                errors.extend_in(&origin_errors, "origin");
                segments.push(Segment::Origin(segment.clone()));
                continue;
            }
            // `>>` shows up as an empty segment followed by the origin
            if segment.is_empty() && i < last {
                origin_next = true;
                continue;
            }
            if let Some(segment) = Self::parse_segment(segment, &mut errors, rt) {
                segments.push(segment);
            }
        }

        tracing::debug!(segments = segments.len(), iterations, "Parsed pipeline");
        Self {
            segments,
            parser_errors: errors,
            iterations,
        }
    }

    fn parse_segment(segment: &str, errors: &mut ErrorLog, rt: &Runtime) -> Option<Segment> {
        let (spec, rest) = match parse_groupmode(segment) {
            Ok(parsed) => parsed,
            Err(e) => {
                errors.log_parse_error(&e);
                return None;
            }
        };
        let (group_mode, gm_errors) = GroupMode::from_spec(&spec, rt);
        errors.extend_in(&gm_errors, "group mode");
        let group_mode = group_mode?;

        let pipestrs = match expand_segment(rest) {
            Ok(pipestrs) => pipestrs,
            Err(e) => {
                errors.log_parse_error(&e);
                return None;
            }
        };

        let mut targets = Vec::with_capacity(pipestrs.len());
        for pipestr in pipestrs {
            if pipestr.starts_with('(') {
                let (body, count) = match parse_inline_pipeline(&pipestr) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        errors.log_parse_error(&e);
                        continue;
                    }
                };
                let iterations = match count {
                    None => 1,
                    Some(n) if n < 0 => {
                        errors.log("Negative iteration counts are not allowed.", true);
                        continue;
                    }
                    Some(n) => n as usize,
                };
                let mut nested = Self::parse_iterated(body, iterations, rt);
                errors.steal(&mut nested.parser_errors, Some("parens"));
                targets.push(Target::Nested(nested));
            } else {
                let (pipe, mut pipe_errors) = ParsedPipe::parse(&pipestr, rt);
                errors.steal(&mut pipe_errors, None);
                targets.push(Target::Pipe(pipe));
            }
        }
        Some(Segment::Pipes { group_mode, targets })
    }

    /// The parsed pipeline for a macro's code, from the runtime's cache if possible.
    pub fn cached(code: &str, rt: &Runtime) -> std::sync::Arc<Self> {
        if let Some(pipeline) = rt.cached_pipeline(code) {
            return pipeline;
        }
        let pipeline = std::sync::Arc::new(Self::parse(code, rt));
        rt.cache_pipeline(code, pipeline.clone());
        pipeline
    }

    fn check_items(items: &[String], ctx: &Context) -> Result<()> {
        let max = ctx.runtime.config.max_chars;
        let chars: usize = items.iter().map(|i| i.chars().count()).sum();
        if chars > max && !ctx.is_trusted() {
            return Err(ScriptError::Pipeline(format!(
                "Attempted to process a flow of {chars} total characters at once, try staying under {max}."
            )));
        }
        Ok(())
    }

    /// Apply the pipeline to `items`, `iterations` times over.
    pub fn apply<'a>(
        &'a self,
        items: Vec<String>,
        ctx: &'a Context,
        scope: Option<&'a ItemScope>,
    ) -> BoxFuture<'a, PipelineOutput> {
        async move {
            let mut errors = self.parser_errors.clone();
            let mut spouts = SpoutState::new();
            if errors.is_terminal() {
                return (None, errors, spouts);
            }

            let mut items = items;
            for _ in 0..self.iterations {
                let (values, iter_errors, iter_spouts) = self.apply_iteration(items, ctx, scope).await;
                errors.extend(&iter_errors);
                let Some(values) = values.filter(|_| !errors.is_terminal()) else {
                    return (None, errors, spouts);
                };
                items = values;
                spouts.extend(iter_spouts, true);
            }
            (Some(items), errors, spouts)
        }
        .boxed()
    }

    async fn apply_iteration(
        &self,
        items: Vec<String>,
        ctx: &Context,
        parent: Option<&ItemScope>,
    ) -> PipelineOutput {
        let mut errors = ErrorLog::new();
        let mut spouts = SpoutState::new();
        let item_scope = ItemScope::nested(parent, Vec::new());
        let mut loose_items = items;

        if let Err(e) = Self::check_items(&loose_items, ctx) {
            errors.log(e.to_string(), true);
            return (None, errors, spouts);
        }

        for segment in &self.segments {
            let (group_mode, targets) = match segment {
                Segment::Origin(origin) => {
                    item_scope.set_items(loose_items);
                    let (values, origin_errors) =
                        TemplatedString::evaluate_origin(origin, ctx, Some(&item_scope)).await;
                    errors.extend_in(&origin_errors, "origin");
                    let Some(values) = values.filter(|_| !errors.is_terminal()) else {
                        return (None, errors, spouts);
                    };
                    loose_items = values;
                    if let Err(e) = Self::check_items(&loose_items, ctx) {
                        errors.log(e.to_string(), true);
                        return (None, errors, spouts);
                    }
                    continue;
                }
                Segment::Pipes { group_mode, targets } => (group_mode, targets),
            };

            let mut next_items = Vec::new();
            let mut printed = Vec::new();

            let group_scope = if group_mode.splits_trivially() {
                item_scope.clone()
            } else {
                item_scope.set_items(loose_items.clone());
                item_scope.child(Vec::new())
            };

            let assignments = match group_mode
                .apply(loose_items, targets.len(), ctx, Some(&group_scope), &mut errors)
                .await
            {
                Ok(assignments) => assignments,
                Err(e) => {
                    errors.log(format!("{}: {e}", e.kind()), true);
                    return (None, errors, spouts);
                }
            };
            if errors.is_terminal() {
                return (None, errors, spouts);
            }

            for (items, target) in assignments {
                group_scope.set_items(items.clone());
                let Some(target) = target.and_then(|t| targets.get(t)) else {
                    next_items.extend(items);
                    continue;
                };

                let pipe = match target {
                    Target::Nested(pipeline) => {
                        let (values, pl_errors, pl_spouts) =
                            pipeline.apply(items, ctx, Some(&group_scope)).await;
                        errors.extend_in(&pl_errors, "parens");
                        let Some(values) = values.filter(|_| !errors.is_terminal()) else {
                            return (None, errors, spouts);
                        };
                        next_items.extend(values);
                        spouts.extend(pl_spouts, group_mode.is_singular());
                        continue;
                    }
                    Target::Pipe(pipe) => pipe,
                };

                let mut args = EvaluatedArguments::new();
                if let Some(arguments) = &pipe.arguments {
                    let (determined, arg_errors) = arguments.determine(ctx, Some(&group_scope)).await;
                    errors.extend_in(&arg_errors, &pipe.name);
                    match determined {
                        Some(determined) if !errors.is_terminal() => args = determined,
                        _ => return (None, errors, spouts),
                    }
                }
                let (ignored, items) = group_scope.extract_ignored();
                next_items.extend(ignored);

                let (values, pipe_errors) = pipe
                    .apply(
                        items,
                        args,
                        ctx,
                        &group_scope,
                        group_mode.is_singular(),
                        &mut printed,
                        &mut spouts,
                    )
                    .await;
                errors.extend(&pipe_errors);
                let Some(values) = values.filter(|_| !errors.is_terminal()) else {
                    return (None, errors, spouts);
                };
                next_items.extend(values);
            }

            if !printed.is_empty() {
                spouts.print_values.push(printed);
            }
            loose_items = next_items;
            if let Err(e) = Self::check_items(&loose_items, ctx) {
                errors.log(e.to_string(), true);
                return (None, errors, spouts);
            }
        }

        (Some(loose_items), errors, spouts)
    }
}

impl fmt::Display for Pipeline {
    /// Script syntax that parses back into an equivalent pipeline.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Origin(origin) => parts.push(format!("> {origin}")),
                Segment::Pipes { group_mode, targets } => {
                    let targets = match targets.as_slice() {
                        [single] => single.to_string(),
                        many => format!(
                            "[{}]",
                            many.iter().map(Target::to_string).collect::<Vec<_>>().join("|")
                        ),
                    };
                    let group_mode = group_mode.to_string();
                    if group_mode.is_empty() {
                        parts.push(targets);
                    } else {
                        parts.push(format!("{group_mode} {targets}"));
                    }
                }
            }
        }
        f.write_str(&parts.join(" > "))
    }
}
