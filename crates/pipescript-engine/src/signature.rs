//! Parameter signatures for pipes, sources and spouts, and the arguments
//! written against them.
//!
//! Arguments are parsed once into [`Arguments`], which may still contain
//! templated values. [`Arguments::determine`] evaluates those against a
//! context and scope into [`EvaluatedArguments`].

use std::collections::BTreeMap;
use std::fmt;

use futures::future::join_all;
use regex::Regex;

use pipescript_grammar::RawArg;
use pipescript_types::{ErrorLog, ItemScope, Result, ScriptError};

use crate::context::{Context, Runtime};
use crate::templated::TemplatedString;

// ---------------------------------------------------------------------------
// Parameter types and values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Str,
    Int,
    Float,
    Bool,
    /// An integer written in hexadecimal, with or without `0x`/`#`.
    Hex,
    Url,
    Regex,
    /// One of a fixed set of lowercase options.
    Choice(Vec<String>),
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Str => f.write_str("str"),
            ParamType::Int => f.write_str("int"),
            ParamType::Float => f.write_str("float"),
            ParamType::Bool => f.write_str("bool"),
            ParamType::Hex => f.write_str("hex"),
            ParamType::Url => f.write_str("url"),
            ParamType::Regex => f.write_str("regex"),
            ParamType::Choice(options) => f.write_str(&options.join("/")),
        }
    }
}

/// Parse a loose boolean: `true/yes/y/on/1` or `false/no/n/off/0`, any case.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "yes" | "y" | "on" | "1" => Some(true),
        "false" | "no" | "n" | "off" | "0" => Some(false),
        _ => None,
    }
}

impl ParamType {
    fn parse(&self, raw: &str) -> std::result::Result<ArgValue, String> {
        match self {
            ParamType::Str => Ok(ArgValue::Str(raw.to_string())),
            ParamType::Int => raw
                .trim()
                .parse::<i64>()
                .map(ArgValue::Int)
                .map_err(|e| e.to_string()),
            ParamType::Float => raw
                .trim()
                .parse::<f64>()
                .map(ArgValue::Float)
                .map_err(|e| e.to_string()),
            ParamType::Bool => parse_bool(raw)
                .map(ArgValue::Bool)
                .ok_or_else(|| format!("\"{raw}\" is not a boolean")),
            ParamType::Hex => {
                let t = raw.trim();
                let digits = t
                    .strip_prefix("0x")
                    .or_else(|| t.strip_prefix('#'))
                    .unwrap_or(t);
                i64::from_str_radix(digits, 16)
                    .map(ArgValue::Int)
                    .map_err(|e| e.to_string())
            }
            ParamType::Url => {
                let t = raw.trim();
                if t.starts_with("http://") || t.starts_with("https://") {
                    Ok(ArgValue::Str(t.to_string()))
                } else {
                    Err("not a http(s) url".to_string())
                }
            }
            ParamType::Regex => Regex::new(raw)
                .map(ArgValue::Regex)
                .map_err(|e| e.to_string()),
            ParamType::Choice(options) => {
                let lowered = raw.trim().to_lowercase();
                if options.iter().any(|o| *o == lowered) {
                    Ok(ArgValue::Str(lowered))
                } else {
                    Err(format!("must be one of {}", options.join("/")))
                }
            }
        }
    }
}

/// A parsed argument value.
#[derive(Debug, Clone)]
pub enum ArgValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Regex(Regex),
    /// An optional parameter that was left unassigned.
    None,
}

impl ArgValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ArgValue::Float(x) => Some(*x),
            ArgValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_regex(&self) -> Option<&Regex> {
        match self {
            ArgValue::Regex(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ArgValue::None)
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Str(s) => f.write_str(s),
            ArgValue::Int(i) => write!(f, "{i}"),
            ArgValue::Float(x) => write!(f, "{x}"),
            ArgValue::Bool(b) => write!(f, "{b}"),
            ArgValue::Regex(r) => write!(f, "/{}/", r.as_str()),
            ArgValue::None => f.write_str("None"),
        }
    }
}

// ---------------------------------------------------------------------------
// Par & Signature
// ---------------------------------------------------------------------------

/// A single parameter: its type, default and documentation.
#[derive(Debug, Clone)]
pub struct Par {
    pub ty: ParamType,
    /// Raw default, parsed with `ty` when used.
    pub default: Option<String>,
    pub desc: String,
    pub check: Option<fn(&ArgValue) -> bool>,
    required: bool,
}

impl Par {
    pub fn new(ty: ParamType, desc: impl Into<String>) -> Self {
        Self {
            ty,
            default: None,
            desc: desc.into(),
            check: None,
            required: true,
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Without a default, an optional parameter receives [`ArgValue::None`].
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_check(mut self, check: fn(&ArgValue) -> bool) -> Self {
        self.check = Some(check);
        self
    }

    pub fn is_required(&self) -> bool {
        self.required && self.default.is_none()
    }

    /// Parse a raw string for the parameter called `name`.
    pub fn parse(&self, name: &str, raw: &str) -> Result<ArgValue> {
        let value = self.ty.parse(raw).map_err(|e| {
            ScriptError::Argument(format!(
                "Invalid value \"{raw}\" for parameter `{name}`: Must be of type `{}` ({e})",
                self.ty
            ))
        })?;
        if let Some(check) = self.check {
            if !check(&value) {
                return Err(ScriptError::Argument(format!(
                    "Parameter `{name}` is not allowed to be \"{raw}\"."
                )));
            }
        }
        Ok(value)
    }

    fn default_value(&self, name: &str) -> Result<ArgValue> {
        match &self.default {
            Some(raw) => self.parse(name, raw),
            None => Ok(ArgValue::None),
        }
    }
}

/// Ordered map from lowercase parameter names to their [`Par`].
#[derive(Debug, Clone, Default)]
pub struct Signature {
    params: Vec<(String, Par)>,
}

impl Signature {
    pub fn new<N: Into<String>>(params: impl IntoIterator<Item = (N, Par)>) -> Self {
        Self {
            params: params
                .into_iter()
                .map(|(name, par)| (name.into().to_lowercase(), par))
                .collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Par> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Par)> {
        self.params.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn first(&self) -> Option<(&str, &Par)> {
        self.iter().next()
    }
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum ArgSource {
    /// A written value; `predetermined` is filled when it needs no evaluation.
    Value {
        value: TemplatedString,
        par: Option<Par>,
        predetermined: Option<ArgValue>,
    },
    /// An unassigned parameter falling back to its default.
    Default(ArgValue),
}

#[derive(Debug, Clone)]
struct Arg {
    name: String,
    source: ArgSource,
}

impl Arg {
    fn value(name: &str, value: TemplatedString, par: Option<Par>, errors: &mut ErrorLog) -> Self {
        let mut arg = Self {
            name: name.to_string(),
            source: ArgSource::Value {
                value,
                par,
                predetermined: None,
            },
        };
        arg.try_predetermine(errors);
        arg
    }

    /// Parse the value right away if it is a plain string.
    fn try_predetermine(&mut self, errors: &mut ErrorLog) {
        let ArgSource::Value {
            value,
            par,
            predetermined,
        } = &mut self.source
        else {
            return;
        };
        let Some(raw) = value.as_string() else { return };
        match par {
            None => *predetermined = Some(ArgValue::Str(raw.to_string())),
            Some(par) => match par.parse(&self.name, raw) {
                Ok(v) => *predetermined = Some(v),
                Err(e) => {
                    errors.log(e.to_string(), true);
                }
            },
        }
    }
}

/// Parsed arguments, possibly still containing templated values.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    args: Vec<Arg>,
}

/// The result of parsing an argument list: the arguments, any implicit text
/// left over, and the errors encountered.
pub struct ParsedArguments {
    pub arguments: Arguments,
    pub remainder: Option<TemplatedString>,
    pub errors: ErrorLog,
    /// The next implicit item index after these arguments.
    pub end_index: usize,
}

impl Arguments {
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Compile a raw argument list against `signature`.
    ///
    /// Without a signature the arguments are "naive": every explicit argument
    /// is kept as a string, which is what macros want.
    pub fn from_parsed(
        raw: &[RawArg],
        signature: Option<&Signature>,
        greedy: bool,
        start_index: usize,
        rt: &Runtime,
    ) -> ParsedArguments {
        let mut errors = ErrorLog::new();

        // Step 1: collect explicit values and implicit pieces
        let mut values: Vec<(String, TemplatedString)> = Vec::new();
        let mut implicit: Vec<TemplatedString> = Vec::new();
        let mut index = start_index;

        for arg in raw {
            match arg {
                RawArg::Explicit { name, value } => {
                    let p = name.to_lowercase();
                    if values.iter().any(|(n, _)| *n == p) {
                        errors.warn(format!("Repeated assignment of parameter `{p}`."));
                        continue;
                    }
                    let tstring = TemplatedString::from_elements(value, index, rt);
                    errors.extend_in(&tstring.pre_errors, &p);
                    index = tstring.end_index;
                    values.push((p, tstring));
                }
                RawArg::Implicit { pieces } => {
                    let tstring = TemplatedString::from_elements(pieces, index, rt).strip();
                    errors.extend_in(&tstring.pre_errors, "implicit arg");
                    index = tstring.end_index;
                    implicit.push(tstring);
                }
            }
        }

        let mut remainder = if implicit.is_empty() {
            None
        } else {
            Some(TemplatedString::join(implicit, " "))
        };

        // Step 2: turn them into Args
        let mut args: Vec<Arg> = Vec::new();
        for (p, value) in values {
            match signature {
                None => args.push(Arg::value(&p, value, None, &mut errors)),
                Some(sig) => match sig.get(&p) {
                    Some(par) => args.push(Arg::value(&p, value, Some(par.clone()), &mut errors)),
                    None => {
                        errors.warn(format!("Unknown parameter `{p}`"));
                    }
                },
            }
        }

        let sig = match signature {
            Some(sig) if !errors.is_terminal() => sig,
            _ => {
                return ParsedArguments {
                    arguments: Arguments { args },
                    remainder,
                    errors,
                    end_index: index,
                }
            }
        };
        let assigned = |args: &[Arg], p: &str| args.iter().any(|a| a.name == p);

        // Step 3: required parameters that are missing
        let missing: Vec<&str> = sig
            .iter()
            .filter(|(p, par)| par.is_required() && !assigned(&args, p))
            .map(|(p, _)| p)
            .collect();

        if !missing.is_empty() {
            match (remainder.take(), missing.as_slice()) {
                (Some(rest), [p]) => {
                    let (value, rest) = rest.split_implicit_arg(greedy);
                    let par = sig.get(p).cloned();
                    args.push(Arg::value(p, value, par, &mut errors));
                    remainder = rest;
                }
                (rest, _) => {
                    remainder = rest;
                    errors.log(
                        format!(
                            "Missing required parameter{} {}",
                            if missing.len() > 1 { "s" } else { "" },
                            missing
                                .iter()
                                .map(|p| format!("`{p}`"))
                                .collect::<Vec<_>>()
                                .join(" ")
                        ),
                        true,
                    );
                }
            }
        } else if !errors.is_terminal() && greedy {
            // Step 4: try the remainder on the first parameter, if it fits
            if let (Some(rest), Some((p, par))) = (&remainder, sig.first()) {
                if !assigned(&args, p) {
                    let mut maybe = ErrorLog::new();
                    let (value, _) = rest.clone().split_implicit_arg(greedy);
                    let arg = Arg::value(p, value, Some(par.clone()), &mut maybe);
                    if !maybe.is_terminal() {
                        args.push(arg);
                        remainder = None;
                    }
                }
            }
        }

        // Last step: defaults for the unassigned
        for (p, par) in sig.iter() {
            if assigned(&args, p) || par.is_required() {
                continue;
            }
            match par.default_value(p) {
                Ok(v) => args.push(Arg {
                    name: p.to_string(),
                    source: ArgSource::Default(v),
                }),
                Err(e) => {
                    errors.log(e.to_string(), true);
                }
            }
        }

        ParsedArguments {
            arguments: Arguments { args },
            remainder,
            errors,
            end_index: index,
        }
    }

    /// Parse an argument string directly; used for macro and event arguments.
    pub fn from_string(
        text: &str,
        signature: Option<&Signature>,
        greedy: bool,
        rt: &Runtime,
    ) -> ParsedArguments {
        match pipescript_grammar::parse_arguments(text) {
            Ok(raw) => Self::from_parsed(&raw, signature, greedy, 0, rt),
            Err(e) => {
                let mut errors = ErrorLog::new();
                errors.log_parse_error(&e);
                ParsedArguments {
                    arguments: Arguments::default(),
                    remainder: None,
                    errors,
                    end_index: 0,
                }
            }
        }
    }

    /// Evaluate every argument that was not predetermined.
    pub async fn determine(
        &self,
        ctx: &Context,
        scope: Option<&ItemScope>,
    ) -> (Option<EvaluatedArguments>, ErrorLog) {
        let mut errors = ErrorLog::new();

        let futures = self.args.iter().map(|arg| async move {
            match &arg.source {
                ArgSource::Default(v) => (Some(v.clone()), ErrorLog::new()),
                ArgSource::Value {
                    predetermined: Some(v),
                    ..
                } => (Some(v.clone()), ErrorLog::new()),
                ArgSource::Value { value, par, .. } => {
                    let (raw, errs) = value.evaluate(ctx, scope).await;
                    let Some(raw) = raw else { return (None, errs) };
                    let mut errs = errs;
                    let parsed = match par {
                        None => Some(ArgValue::Str(raw)),
                        Some(par) => match par.parse(&arg.name, &raw) {
                            Ok(v) => Some(v),
                            Err(e) => {
                                errs.log(e.to_string(), true);
                                None
                            }
                        },
                    };
                    (parsed, errs)
                }
            }
        });
        let results = join_all(futures).await;

        let mut values = BTreeMap::new();
        let mut defaults = Vec::new();
        for (arg, (value, errs)) in self.args.iter().zip(results) {
            errors.extend_in(&errs, &format!("parameter `{}`", arg.name));
            if let Some(v) = value {
                if matches!(arg.source, ArgSource::Default(_)) {
                    defaults.push(arg.name.clone());
                }
                values.insert(arg.name.clone(), v);
            }
        }
        if errors.is_terminal() {
            return (None, errors);
        }
        (Some(EvaluatedArguments { values, defaults }), errors)
    }
}

impl fmt::Display for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arg in &self.args {
            if let ArgSource::Value { value, .. } = &arg.source {
                if !first {
                    f.write_str(" ")?;
                }
                first = false;
                write!(f, "{}={}", arg.name, value)?;
            }
        }
        Ok(())
    }
}

/// Fully evaluated arguments, ready to be handed to a pipe, source or spout.
#[derive(Debug, Clone, Default)]
pub struct EvaluatedArguments {
    values: BTreeMap<String, ArgValue>,
    defaults: Vec<String>,
}

impl EvaluatedArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ArgValue) {
        let name = name.into();
        self.defaults.retain(|d| *d != name);
        self.values.insert(name, value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn str(&self, name: &str) -> Result<&str> {
        self.get(name)
            .and_then(ArgValue::as_str)
            .ok_or_else(|| missing(name, "str"))
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        self.get(name)
            .and_then(ArgValue::as_int)
            .ok_or_else(|| missing(name, "int"))
    }

    pub fn float(&self, name: &str) -> Result<f64> {
        self.get(name)
            .and_then(ArgValue::as_float)
            .ok_or_else(|| missing(name, "float"))
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        self.get(name)
            .and_then(ArgValue::as_bool)
            .ok_or_else(|| missing(name, "bool"))
    }

    pub fn regex(&self, name: &str) -> Result<&Regex> {
        self.get(name)
            .and_then(ArgValue::as_regex)
            .ok_or_else(|| missing(name, "regex"))
    }

    /// Plain string view of every argument, used to bind macro arguments.
    pub fn to_strings(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }
}

fn missing(name: &str, ty: &str) -> ScriptError {
    ScriptError::Argument(format!("Expected a `{ty}` argument `{name}`."))
}

impl fmt::Display for EvaluatedArguments {
    /// Only the explicitly assigned arguments, e.g. `` `n`=3 `s`=, ``.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: Vec<String> = self
            .values
            .iter()
            .filter(|(k, _)| !self.defaults.contains(k))
            .map(|(k, v)| format!("`{k}`={v}"))
            .collect();
        f.write_str(&shown.join(" "))
    }
}
