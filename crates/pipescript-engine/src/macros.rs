//! User-defined macros: named pipelines (pipe macros) and scripts (source
//! macros) that scripts can call like native pipes and sources.
//!
//! Macros are stored as versioned JSON records, one file per kind. Arguments a
//! macro is called with are bound into the executing [`Context`] and read back
//! with the `{arg name}` source.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pipescript_types::{ErrorLog, Result, ScriptError, User};

use crate::context::{Context, Runtime};
use crate::pipeline::{Pipeline, PipelineOutput};
use crate::script::ExecutableScript;
use crate::spout_state::{OutputSink, SpoutState};
use crate::store::{JsonFileStore, MemoryStore, RecordStore};

pub const MACRO_VERSION: u64 = 5;

// ---------------------------------------------------------------------------
// Macro
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MacroKind {
    Pipe,
    Source,
}

impl MacroKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MacroKind::Pipe => "Pipe",
            MacroKind::Source => "Source",
        }
    }
}

impl fmt::Display for MacroKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared macro parameter. Parameters without a default are required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroParam {
    pub name: String,
    pub default: Option<String>,
    pub desc: Option<String>,
}

impl MacroParam {
    pub fn new(name: impl Into<String>, default: Option<&str>, desc: &str) -> Self {
        Self {
            name: name.into(),
            default: default.map(String::from),
            desc: (!desc.is_empty()).then(|| desc.to_string()),
        }
    }
}

impl fmt::Display for MacroParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "* **{}:**", self.name)?;
        if let Some(desc) = &self.desc {
            write!(f, " {desc}")?;
        }
        match &self.default {
            Some(default) => write!(f, " (default: \"{default}\")"),
            None => f.write_str(" (REQUIRED)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Macro {
    pub kind: MacroKind,
    pub name: String,
    pub code: String,
    pub author_name: String,
    pub author_id: u64,
    pub desc: Option<String>,
    pub visible: bool,
    pub command: bool,
    pub signature: Vec<MacroParam>,
}

impl Macro {
    pub fn new(kind: MacroKind, name: impl Into<String>, code: impl Into<String>, author: User) -> Self {
        Self {
            kind,
            name: name.into(),
            code: code.into(),
            author_name: author.name,
            author_id: author.id,
            desc: None,
            visible: true,
            command: false,
            signature: Vec::new(),
        }
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.signature.iter().any(|p| p.name == name)
    }

    /// Add a parameter, replacing one of the same name.
    pub fn set_param(&mut self, param: MacroParam) {
        match self.signature.iter_mut().find(|p| p.name == param.name) {
            Some(existing) => *existing = param,
            None => self.signature.push(param),
        }
    }

    pub fn remove_param(&mut self, name: &str) -> bool {
        let before = self.signature.len();
        self.signature.retain(|p| p.name != name);
        self.signature.len() != before
    }

    /// The one parameter not bound in `args`, if there is exactly one.
    pub fn sole_unassigned(&self, args: &BTreeMap<String, String>) -> Option<String> {
        let mut unassigned = self.signature.iter().filter(|p| !args.contains_key(&p.name));
        match (unassigned.next(), unassigned.next()) {
            (Some(param), None) => Some(param.name.clone()),
            _ => None,
        }
    }

    /// Fill in defaults for unbound parameters, failing if a required one is missing.
    pub fn apply_signature(&self, args: BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
        let mut result: BTreeMap<String, String> = BTreeMap::new();
        let mut missing = Vec::new();
        for param in &self.signature {
            if args.contains_key(&param.name) {
                continue;
            }
            match &param.default {
                Some(default) => {
                    result.insert(param.name.clone(), default.clone());
                }
                None => missing.push(format!("`{}`", param.name)),
            }
        }
        if !missing.is_empty() {
            return Err(ScriptError::Argument(format!(
                "Missing required parameter{}: {}",
                if missing.len() > 1 { "s" } else { "" },
                missing.join(" ")
            )));
        }
        result.extend(args);
        Ok(result)
    }

    /// Whether `user` may modify this macro.
    pub fn authorised(&self, user: &User) -> bool {
        user.trusted || user.id == self.author_id
    }

    pub fn get_static_errors(&self, rt: &Runtime) -> ErrorLog {
        static_errors(self.kind, &self.code, rt)
    }

    // -- Serialization ------------------------------------------------------

    pub fn to_record(&self) -> Result<Value> {
        let record = MacroRecord {
            version: MACRO_VERSION,
            attrs: MacroAttrs {
                kind: self.kind,
                name: self.name.clone(),
                code: self.code.clone(),
                author_name: self.author_name.clone(),
                author_id: self.author_id,
                desc: self.desc.clone(),
                visible: self.visible,
                command: self.command,
            },
            signature: self
                .signature
                .iter()
                .map(|p| ParamRecord {
                    version: MACRO_VERSION,
                    name: p.name.clone(),
                    default: p.default.clone(),
                    desc: p.desc.clone(),
                })
                .collect(),
        };
        Ok(serde_json::to_value(record)?)
    }

    pub fn from_record(value: Value) -> Result<Self> {
        let record: MacroRecord = serde_json::from_value(value)?;
        if record.version != MACRO_VERSION {
            return Err(ScriptError::Other(format!(
                "Unsupported macro version {}",
                record.version
            )));
        }
        let attrs = record.attrs;
        Ok(Self {
            kind: attrs.kind,
            name: attrs.name,
            code: attrs.code,
            author_name: attrs.author_name,
            author_id: attrs.author_id,
            desc: attrs.desc,
            visible: attrs.visible,
            command: attrs.command,
            signature: record
                .signature
                .into_iter()
                .map(|p| MacroParam {
                    name: p.name,
                    default: p.default,
                    desc: p.desc,
                })
                .collect(),
        })
    }
}

impl fmt::Display for Macro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Macro: {}", self.kind, self.name)?;
        if !self.visible {
            f.write_str(" `hidden`")?;
        }
        if let Some(desc) = &self.desc {
            write!(f, "\n{desc}")?;
        }
        if !self.signature.is_empty() {
            f.write_str("\nParameters:")?;
            for param in &self.signature {
                write!(f, "\n{param}")?;
            }
        }
        write!(f, "\nScript:\n```\n{}\n```\nby {}", self.code, self.author_name)
    }
}

fn default_visible() -> bool {
    true
}

#[derive(Serialize, Deserialize)]
struct MacroRecord {
    #[serde(rename = "_version")]
    version: u64,
    attrs: MacroAttrs,
    #[serde(default)]
    signature: Vec<ParamRecord>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MacroAttrs {
    kind: MacroKind,
    name: String,
    code: String,
    author_name: String,
    author_id: u64,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default = "default_visible")]
    visible: bool,
    #[serde(default)]
    command: bool,
}

#[derive(Serialize, Deserialize)]
struct ParamRecord {
    #[serde(rename = "_version")]
    version: u64,
    name: String,
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    desc: Option<String>,
}

/// Errors knowable before running macro code of the given kind.
pub fn static_errors(kind: MacroKind, code: &str, rt: &Runtime) -> ErrorLog {
    match kind {
        MacroKind::Pipe => Pipeline::parse(code, rt).parser_errors,
        MacroKind::Source => ExecutableScript::from_string(code, rt).get_static_errors().clone(),
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

fn enter_macro(macro_def: Arc<Macro>, args: BTreeMap<String, String>, ctx: &Context) -> Result<Context> {
    let max = ctx.runtime.config.max_macro_depth;
    if ctx.depth >= max {
        return Err(ScriptError::Pipeline(format!(
            "Macros nested more than {max} deep, is there an infinite recursion?"
        )));
    }
    let args = macro_def.apply_signature(args)?;
    Ok(ctx.into_macro(macro_def, args))
}

/// Apply a pipe macro's code to `items`, with `args` bound in a child context.
pub async fn run_pipe_macro(
    macro_def: Arc<Macro>,
    items: Vec<String>,
    args: BTreeMap<String, String>,
    ctx: &Context,
) -> PipelineOutput {
    let macro_ctx = match enter_macro(macro_def.clone(), args, ctx) {
        Ok(macro_ctx) => macro_ctx,
        Err(e) => {
            let mut errors = ErrorLog::new();
            errors.log(e.to_string(), true);
            return (None, errors, SpoutState::new());
        }
    };
    tracing::debug!(name = %macro_def.name, depth = macro_ctx.depth, "Running pipe macro");
    let pipeline = Pipeline::cached(&macro_def.code, &ctx.runtime);
    pipeline.apply(items, &macro_ctx, None).await
}

/// Execute a source macro's script with `args` bound in a child context.
pub async fn run_source_macro(
    macro_def: Arc<Macro>,
    args: BTreeMap<String, String>,
    ctx: &Context,
) -> PipelineOutput {
    let macro_ctx = match enter_macro(macro_def.clone(), args, ctx) {
        Ok(macro_ctx) => macro_ctx,
        Err(e) => {
            let mut errors = ErrorLog::new();
            errors.log(e.to_string(), true);
            return (None, errors, SpoutState::new());
        }
    };
    tracing::debug!(name = %macro_def.name, depth = macro_ctx.depth, "Running source macro");
    let script = ExecutableScript::from_string(&macro_def.code, &ctx.runtime);
    Box::pin(script.execute_without_side_effects(&macro_ctx, None)).await
}

// ---------------------------------------------------------------------------
// MacroRegistry
// ---------------------------------------------------------------------------

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

struct MacroSet {
    kind: MacroKind,
    macros: RwLock<BTreeMap<String, Arc<Macro>>>,
    store: Box<dyn RecordStore>,
}

impl MacroSet {
    async fn load(kind: MacroKind, store: Box<dyn RecordStore>) -> Result<Self> {
        let records = store.load().await?;
        let version_of = |v: &Value| v.get("_version").and_then(Value::as_u64);
        let outdated = records.iter().any(|r| {
            version_of(r) != Some(MACRO_VERSION)
                || r.get("signature")
                    .and_then(Value::as_array)
                    .is_some_and(|ps| ps.iter().any(|p| version_of(p) != Some(MACRO_VERSION)))
        });
        if outdated {
            store.backup(&format!(".v{}_backup", MACRO_VERSION - 1)).await?;
        }

        let mut macros = BTreeMap::new();
        for record in records {
            match Macro::from_record(record) {
                Ok(m) => {
                    macros.insert(m.name.clone(), Arc::new(m));
                }
                Err(e) => tracing::warn!(kind = %kind, error = %e, "Skipped unreadable macro"),
            }
        }
        Ok(Self {
            kind,
            macros: RwLock::new(macros),
            store,
        })
    }

    fn records(&self) -> Result<Vec<Value>> {
        read(&self.macros).values().map(|m| m.to_record()).collect()
    }
}

/// Pipe and source macros by name, each kind persisted in its own store.
pub struct MacroRegistry {
    pipes: MacroSet,
    sources: MacroSet,
    writes: tokio::sync::Mutex<()>,
}

impl MacroRegistry {
    pub fn in_memory() -> Self {
        let empty = |kind| MacroSet {
            kind,
            macros: RwLock::new(BTreeMap::new()),
            store: Box::new(MemoryStore::new()),
        };
        Self {
            pipes: empty(MacroKind::Pipe),
            sources: empty(MacroKind::Source),
            writes: tokio::sync::Mutex::new(()),
        }
    }

    /// Load `pipe_macros.json` and `source_macros.json` from `dir`.
    pub async fn load(dir: &Path) -> Result<Self> {
        Self::with_stores(
            Box::new(JsonFileStore::in_dir(dir, "pipe_macros")),
            Box::new(JsonFileStore::in_dir(dir, "source_macros")),
        )
        .await
    }

    pub async fn with_stores(pipes: Box<dyn RecordStore>, sources: Box<dyn RecordStore>) -> Result<Self> {
        Ok(Self {
            pipes: MacroSet::load(MacroKind::Pipe, pipes).await?,
            sources: MacroSet::load(MacroKind::Source, sources).await?,
            writes: tokio::sync::Mutex::new(()),
        })
    }

    fn set(&self, kind: MacroKind) -> &MacroSet {
        match kind {
            MacroKind::Pipe => &self.pipes,
            MacroKind::Source => &self.sources,
        }
    }

    pub fn get(&self, kind: MacroKind, name: &str) -> Option<Arc<Macro>> {
        read(&self.set(kind).macros).get(name).cloned()
    }

    pub fn contains(&self, kind: MacroKind, name: &str) -> bool {
        read(&self.set(kind).macros).contains_key(name)
    }

    /// Every macro of the given kind, by name.
    pub fn list(&self, kind: MacroKind) -> Vec<Arc<Macro>> {
        read(&self.set(kind).macros).values().cloned().collect()
    }

    pub fn visible(&self, kind: MacroKind) -> Vec<Arc<Macro>> {
        self.list(kind).into_iter().filter(|m| m.visible).collect()
    }

    pub fn hidden(&self, kind: MacroKind) -> Vec<Arc<Macro>> {
        self.list(kind).into_iter().filter(|m| !m.visible).collect()
    }

    pub fn len(&self) -> usize {
        read(&self.pipes.macros).len() + read(&self.sources.macros).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add or replace a macro and persist its kind's store.
    pub async fn insert(&self, macro_def: Macro) -> Result<Arc<Macro>> {
        let _guard = self.writes.lock().await;
        let set = self.set(macro_def.kind);
        let macro_def = Arc::new(macro_def);
        write(&set.macros).insert(macro_def.name.clone(), macro_def.clone());
        set.store.save(&set.records()?).await?;
        tracing::info!(kind = %set.kind, name = %macro_def.name, "Macro saved");
        Ok(macro_def)
    }

    pub async fn remove(&self, kind: MacroKind, name: &str) -> Result<Option<Arc<Macro>>> {
        let _guard = self.writes.lock().await;
        let set = self.set(kind);
        let removed = write(&set.macros).remove(name);
        if removed.is_some() {
            set.store.save(&set.records()?).await?;
            tracing::info!(kind = %kind, name, "Macro deleted");
        }
        Ok(removed)
    }
}

impl fmt::Debug for MacroRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacroRegistry")
            .field("pipes", &read(&self.pipes.macros).len())
            .field("sources", &read(&self.sources.macros).len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Definition commands
// ---------------------------------------------------------------------------

const COMMAND_PATTERN: &str = r"(?is)^\s*(NEW|EDIT|DESC)\s+(hidden)?(pipe|source)\s+([_a-z]\w+)\s*::\s*(.*)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    New,
    Edit,
    Desc,
}

/// `NEW|EDIT|DESC [hidden](pipe|source) name :: code-or-description`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroCommand {
    pub mode: CommandMode,
    pub kind: MacroKind,
    pub visible: bool,
    pub name: String,
    pub body: String,
}

impl MacroCommand {
    /// `Ok(None)` if `text` is not a macro command.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let pattern = Regex::new(COMMAND_PATTERN)?;
        let Some(caps) = pattern.captures(text) else {
            return Ok(None);
        };
        let mode = match caps[1].to_uppercase().as_str() {
            "NEW" => CommandMode::New,
            "EDIT" => CommandMode::Edit,
            _ => CommandMode::Desc,
        };
        let kind = if caps[3].eq_ignore_ascii_case("pipe") {
            MacroKind::Pipe
        } else {
            MacroKind::Source
        };
        Ok(Some(Self {
            mode,
            kind,
            visible: caps.get(2).is_none(),
            name: caps[4].to_lowercase(),
            body: caps[5].to_string(),
        }))
    }

    fn what(&self) -> String {
        let kind = self.kind.as_str().to_lowercase();
        if self.visible {
            kind
        } else {
            format!("hidden{kind}")
        }
    }

    /// Carry out the command on behalf of `author`, replying through `sink`.
    ///
    /// Returns whether a macro was saved.
    pub async fn run(&self, author: &User, rt: &Runtime, sink: &dyn OutputSink) -> Result<bool> {
        let registry = &rt.macros;
        let name = &self.name;
        let what = self.what();

        let existing = registry.get(self.kind, name);
        let macro_def = match (self.mode, existing) {
            (CommandMode::New, existing) => {
                let native = match self.kind {
                    MacroKind::Pipe => rt.natives.pipes.has(name),
                    MacroKind::Source => rt.natives.sources.has(name),
                };
                if native || existing.is_some() {
                    sink.send_text(&format!("A {what} called `{name}` already exists, try EDIT instead."))
                        .await?;
                    return Ok(false);
                }
                if !self.check_code(rt, sink).await? {
                    return Ok(false);
                }
                let mut m = Macro::new(self.kind, name.as_str(), self.body.as_str(), author.clone());
                m.visible = self.visible;
                m
            }
            (_, None) => {
                sink.send_text(&format!("A {what} macro by that name was not found."))
                    .await?;
                return Ok(false);
            }
            (_, Some(existing)) if !existing.authorised(author) => {
                sink.send_text("You are not authorised to modify that macro. Try defining a new one instead.")
                    .await?;
                return Ok(false);
            }
            (CommandMode::Edit, Some(existing)) => {
                if !self.check_code(rt, sink).await? {
                    return Ok(false);
                }
                let mut m = (*existing).clone();
                m.code = self.body.clone();
                m
            }
            (CommandMode::Desc, Some(existing)) => {
                let mut m = (*existing).clone();
                m.desc = Some(self.body.clone());
                m
            }
        };

        let saved = registry.insert(macro_def).await?;
        let reply = match self.mode {
            CommandMode::New => "Defined a new macro.",
            CommandMode::Edit => "Redefined the Macro.",
            CommandMode::Desc => "Updated the Macro's description.",
        };
        sink.send_text(&format!("{reply}\n{saved}")).await?;
        Ok(true)
    }

    async fn check_code(&self, rt: &Runtime, sink: &dyn OutputSink) -> Result<bool> {
        let errors = static_errors(self.kind, &self.body, rt);
        if errors.is_empty() {
            return Ok(true);
        }
        if errors.is_terminal() {
            sink.send_text("Failed to save Macro due to parsing errors:").await?;
            sink.send_error_log(&errors, &self.name).await?;
            return Ok(false);
        }
        sink.send_text("Encountered warnings while parsing Macro:").await?;
        sink.send_error_log(&errors, &self.name).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::context::test_runtime;
    use crate::spout_state::{CollectingSink, SinkMessage};

    fn author() -> User {
        User::new(42, "author")
    }

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn apply_signature_fills_defaults_and_reports_missing() {
        let mut m = Macro::new(MacroKind::Pipe, "m", "nop", author());
        m.set_param(MacroParam::new("a", Some("1"), ""));
        m.set_param(MacroParam::new("b", None, "required"));

        let bound = m.apply_signature(args(&[("b", "2")])).unwrap();
        assert_eq!(bound, args(&[("a", "1"), ("b", "2")]));

        let err = m.apply_signature(args(&[])).unwrap_err();
        assert_eq!(err.to_string(), "Missing required parameter: `b`");

        m.set_param(MacroParam::new("c", None, ""));
        let err = m.apply_signature(args(&[("a", "x")])).unwrap_err();
        assert_eq!(err.to_string(), "Missing required parameters: `b` `c`");
    }

    #[test]
    fn sole_unassigned_needs_exactly_one() {
        let mut m = Macro::new(MacroKind::Source, "m", "x", author());
        assert_eq!(m.sole_unassigned(&args(&[])), None);
        m.set_param(MacroParam::new("a", None, ""));
        assert_eq!(m.sole_unassigned(&args(&[])), Some("a".into()));
        m.set_param(MacroParam::new("b", None, ""));
        assert_eq!(m.sole_unassigned(&args(&[])), None);
        assert_eq!(m.sole_unassigned(&args(&[("a", "1")])), Some("b".into()));
    }

    #[test]
    fn authorisation() {
        let m = Macro::new(MacroKind::Pipe, "m", "nop", author());
        assert!(m.authorised(&author()));
        assert!(!m.authorised(&User::new(1, "other")));
        assert!(m.authorised(&User::new(1, "owner").trusted()));
    }

    #[test]
    fn record_format() {
        let mut m = Macro::new(MacroKind::Pipe, "shout", "upper", author());
        m.set_param(MacroParam::new("x", Some("1"), "a thing"));
        let record = m.to_record().unwrap();
        assert_eq!(record["_version"], 5);
        assert_eq!(record["attrs"]["authorName"], "author");
        assert_eq!(record["attrs"]["authorId"], 42);
        assert_eq!(record["attrs"]["kind"], "Pipe");
        assert_eq!(record["signature"][0]["default"], "1");

        let back = Macro::from_record(record).unwrap();
        assert_eq!(back.name, "shout");
        assert_eq!(back.signature, m.signature);
    }

    #[test]
    fn param_display() {
        assert_eq!(
            MacroParam::new("x", Some("1"), "a thing").to_string(),
            "* **x:** a thing (default: \"1\")"
        );
        assert_eq!(MacroParam::new("y", None, "").to_string(), "* **y:** (REQUIRED)");
    }

    #[tokio::test]
    async fn outdated_records_are_backed_up_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = Macro::new(MacroKind::Pipe, "good", "upper", author()).to_record().unwrap();
        let old = json!({"_version": 4, "attrs": {}, "signature": []});
        JsonFileStore::in_dir(dir.path(), "pipe_macros")
            .save(&[good, old])
            .await
            .unwrap();

        let registry = MacroRegistry::load(dir.path()).await.unwrap();
        assert!(dir.path().join("pipe_macros.json.v4_backup").exists());
        assert!(registry.contains(MacroKind::Pipe, "good"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn insert_and_remove_persist() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MacroRegistry::load(dir.path()).await.unwrap();
        let mut hidden = Macro::new(MacroKind::Source, "secret", "shh", author());
        hidden.visible = false;
        registry.insert(hidden).await.unwrap();
        registry
            .insert(Macro::new(MacroKind::Source, "open", "hi", author()))
            .await
            .unwrap();

        let reloaded = MacroRegistry::load(dir.path()).await.unwrap();
        assert_eq!(reloaded.hidden(MacroKind::Source).len(), 1);
        assert_eq!(reloaded.visible(MacroKind::Source)[0].name, "open");

        assert!(reloaded.remove(MacroKind::Source, "open").await.unwrap().is_some());
        assert!(reloaded.remove(MacroKind::Source, "open").await.unwrap().is_none());
        let reloaded = MacroRegistry::load(dir.path()).await.unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn command_parsing() {
        let cmd = MacroCommand::parse("  new hiddenPipe Shout :: upper > join").unwrap().unwrap();
        assert_eq!(cmd.mode, CommandMode::New);
        assert_eq!(cmd.kind, MacroKind::Pipe);
        assert!(!cmd.visible);
        assert_eq!(cmd.name, "shout");
        assert_eq!(cmd.body, "upper > join");

        let cmd = MacroCommand::parse("DESC source greet ::\nSays hello").unwrap().unwrap();
        assert_eq!(cmd.mode, CommandMode::Desc);
        assert_eq!(cmd.body, "Says hello");

        assert!(MacroCommand::parse("NEW EVENT x ON MESSAGE y :: z").unwrap().is_none());
    }

    #[tokio::test]
    async fn commands_create_edit_and_describe() {
        let rt = test_runtime();
        let sink = CollectingSink::new();

        let new = MacroCommand::parse("NEW pipe shout :: upper").unwrap().unwrap();
        assert!(new.run(&author(), &rt, sink.as_ref()).await.unwrap());
        assert!(!new.run(&author(), &rt, sink.as_ref()).await.unwrap());

        let edit = MacroCommand::parse("EDIT pipe shout :: lower").unwrap().unwrap();
        assert!(!edit.run(&User::new(1, "intruder"), &rt, sink.as_ref()).await.unwrap());
        assert!(edit.run(&author(), &rt, sink.as_ref()).await.unwrap());
        assert_eq!(rt.macros.get(MacroKind::Pipe, "shout").unwrap().code, "lower");

        let desc = MacroCommand::parse("DESC pipe shout :: Shouts.").unwrap().unwrap();
        assert!(desc.run(&author(), &rt, sink.as_ref()).await.unwrap());

        let texts = sink.texts();
        assert!(texts[0].starts_with("Defined a new macro."));
        assert_eq!(texts[1], "A pipe called `shout` already exists, try EDIT instead.");
        assert_eq!(
            texts[2],
            "You are not authorised to modify that macro. Try defining a new one instead."
        );
        assert!(texts[3].starts_with("Redefined the Macro."));
        assert!(texts[4].starts_with("Updated the Macro's description.\nPipe Macro: shout\nShouts."));
    }

    #[tokio::test]
    async fn commands_refuse_native_names_and_broken_code() {
        let rt = test_runtime();
        let sink = CollectingSink::new();

        let cmd = MacroCommand::parse("NEW pipe upper :: lower").unwrap().unwrap();
        assert!(!cmd.run(&author(), &rt, sink.as_ref()).await.unwrap());

        let cmd = MacroCommand::parse("NEW pipe broken :: 3d6").unwrap().unwrap();
        assert!(!cmd.run(&author(), &rt, sink.as_ref()).await.unwrap());
        assert!(!rt.macros.contains(MacroKind::Pipe, "broken"));

        let messages = sink.messages();
        assert_eq!(
            messages[1],
            SinkMessage::Text("Failed to save Macro due to parsing errors:".into())
        );
        assert!(matches!(&messages[2], SinkMessage::ErrorLog { terminal: true, .. }));
    }

    #[tokio::test]
    async fn runaway_recursion_is_cut_off() {
        let rt = test_runtime();
        rt.macros
            .insert(Macro::new(MacroKind::Pipe, "forever", "forever", author()))
            .await
            .unwrap();
        let ctx = Context::for_tests(rt.clone());
        let m = rt.macros.get(MacroKind::Pipe, "forever").unwrap();
        let (values, errors, _) = run_pipe_macro(m, vec!["x".into()], BTreeMap::new(), &ctx).await;
        assert!(values.is_none());
        assert!(errors.is_terminal());
        assert!(errors.to_string().contains("is there an infinite recursion?"));
    }

    #[tokio::test]
    async fn source_macros_nest_through_origins() {
        let rt = test_runtime();
        for (name, code) in [("letters", "[x|y]"), ("shouted", "{letters} > upper"), ("again", "{again}")] {
            rt.macros
                .insert(Macro::new(MacroKind::Source, name, code, author()))
                .await
                .unwrap();
        }
        let ctx = Context::for_tests(rt.clone());

        let script = ExecutableScript::from_string("{shouted}", &rt);
        let (values, errors, _) = script.execute_without_side_effects(&ctx, None).await;
        assert!(!errors.is_terminal(), "{}", errors.render());
        assert_eq!(values.unwrap(), vec!["X".to_string(), "Y".to_string()]);

        // Inside a larger string only the source's first value is used.
        let script = ExecutableScript::from_string("{shouted}!", &rt);
        let (values, errors, _) = script.execute_without_side_effects(&ctx, None).await;
        assert!(!errors.is_terminal(), "{}", errors.render());
        assert_eq!(values.unwrap(), vec!["X!".to_string()]);

        let script = ExecutableScript::from_string("{again}", &rt);
        let (values, errors, _) = script.execute_without_side_effects(&ctx, None).await;
        assert!(values.is_none());
        assert!(errors.to_string().contains("is there an infinite recursion?"));
    }
}
