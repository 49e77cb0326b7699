//! Events: scripts that run when a message, reaction or invocation in one of
//! their enabled channels matches their trigger.
//!
//! Events are stored as a single list of versioned JSON records in
//! `events.json`. Older record versions are migrated on load, after the
//! original file is backed up.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pipescript_types::{Result, ScriptError, User};

use crate::context::Runtime;
use crate::script::ExecutableScript;
use crate::spout_state::OutputSink;
use crate::store::{JsonFileStore, MemoryStore, RecordStore};

pub const EVENT_VERSION: u64 = 6;

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Message,
    Reaction,
    Invoke,
}

impl TriggerKind {
    /// Parse the word following `ON` in an event command.
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word.to_uppercase().chars().next()? {
            'M' => Some(Self::Message),
            'R' => Some(Self::Reaction),
            'I' => Some(Self::Invoke),
            _ => None,
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerKind::Message => "MESSAGE",
            TriggerKind::Reaction => "REACTION",
            TriggerKind::Invoke => "INVOKE",
        })
    }
}

#[derive(Debug, Clone)]
pub enum Trigger {
    /// A regex searched for anywhere in the message, `.` matching newlines.
    OnMessage { pattern: String, regex: Regex },
    OnReaction { emotes: Vec<String> },
    /// A case-insensitive command name.
    OnInvoke { command: String },
}

impl Trigger {
    pub fn on_message(pattern: &str) -> Result<Self> {
        let regex = RegexBuilder::new(pattern).dot_matches_new_line(true).build()?;
        Ok(Self::OnMessage {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// Emotes given as a comma separated list.
    pub fn on_reaction(emotes: &str) -> Self {
        Self::OnReaction {
            emotes: emotes.split(',').map(|e| e.trim().to_string()).collect(),
        }
    }

    pub fn on_invoke(command: &str) -> Self {
        Self::OnInvoke {
            command: command.to_lowercase(),
        }
    }

    pub fn parse(kind: TriggerKind, trigger: &str) -> Result<Self> {
        match kind {
            TriggerKind::Message => Self::on_message(trigger),
            TriggerKind::Reaction => Ok(Self::on_reaction(trigger)),
            TriggerKind::Invoke => Ok(Self::on_invoke(trigger)),
        }
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::OnMessage { .. } => TriggerKind::Message,
            Trigger::OnReaction { .. } => TriggerKind::Reaction,
            Trigger::OnInvoke { .. } => TriggerKind::Invoke,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Trigger::OnMessage { .. } => "OnMessage",
            Trigger::OnReaction { .. } => "OnReaction",
            Trigger::OnInvoke { .. } => "OnInvoke",
        }
    }

    /// The trigger as it would be written in an event command.
    pub fn trigger_str(&self) -> String {
        match self {
            Trigger::OnMessage { pattern, .. } => pattern.clone(),
            Trigger::OnReaction { emotes } => emotes.join(","),
            Trigger::OnInvoke { command } => command.clone(),
        }
    }
}

/// What a matching message hands to the event's script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMatch {
    /// The regex's capture groups in order, or the whole message if it has none.
    pub items: Vec<String>,
    /// `0` for the full match, `1..` for each group and every named group by name.
    pub arguments: BTreeMap<String, String>,
}

impl MessageMatch {
    fn from_captures(regex: &Regex, caps: &regex::Captures<'_>, content: &str) -> Self {
        let text = |m: Option<regex::Match<'_>>| m.map(|m| m.as_str().to_string()).unwrap_or_default();
        let full = text(caps.get(0));

        if regex.captures_len() <= 1 {
            return Self {
                items: vec![content.to_string()],
                arguments: BTreeMap::from([("0".to_string(), full)]),
            };
        }

        let items: Vec<String> = (1..regex.captures_len()).map(|i| text(caps.get(i))).collect();
        let mut arguments: BTreeMap<String, String> = items
            .iter()
            .enumerate()
            .map(|(i, g)| ((i + 1).to_string(), g.clone()))
            .collect();
        arguments.insert("0".into(), full);
        for name in regex.capture_names().flatten() {
            arguments.insert(name.to_string(), text(caps.name(name)));
        }
        Self { items, arguments }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub desc: String,
    pub author_id: u64,
    pub author_name: String,
    /// Channels the event is enabled in.
    pub channels: Vec<String>,
    pub script: String,
    pub trigger: Trigger,
}

impl Event {
    pub fn new(name: impl Into<String>, author: &User, script: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            name: name.into(),
            desc: String::new(),
            author_id: author.id,
            author_name: author.name.clone(),
            channels: Vec::new(),
            script: script.into(),
            trigger,
        }
    }

    /// The user the event's script runs on behalf of.
    pub fn author(&self) -> User {
        let name = if self.author_name.is_empty() {
            self.author_id.to_string()
        } else {
            self.author_name.clone()
        };
        User::new(self.author_id, name)
    }

    pub fn is_enabled(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }

    pub fn enable(&mut self, channel: &str) {
        if !self.is_enabled(channel) {
            self.channels.push(channel.to_string());
        }
    }

    pub fn disable(&mut self, channel: &str) {
        self.channels.retain(|c| c != channel);
    }

    pub fn test_message(&self, channel: &str, content: &str) -> Option<MessageMatch> {
        let Trigger::OnMessage { regex, .. } = &self.trigger else {
            return None;
        };
        if !self.is_enabled(channel) {
            return None;
        }
        let caps = regex.captures(content)?;
        Some(MessageMatch::from_captures(regex, &caps, content))
    }

    pub fn test_reaction(&self, channel: &str, emoji: &str) -> bool {
        matches!(&self.trigger, Trigger::OnReaction { emotes } if emotes.iter().any(|e| e == emoji))
            && self.is_enabled(channel)
    }

    pub fn test_invoke(&self, channel: &str, command: &str) -> bool {
        matches!(&self.trigger, Trigger::OnInvoke { command: c } if c.eq_ignore_ascii_case(command))
            && self.is_enabled(channel)
    }

    pub fn get_static_errors(&self, rt: &Runtime) -> pipescript_types::ErrorLog {
        ExecutableScript::from_string(&self.script, rt).get_static_errors().clone()
    }

    // -- Serialization ------------------------------------------------------

    pub fn to_record(&self) -> Result<Value> {
        let (pattern, emotes, command) = match &self.trigger {
            Trigger::OnMessage { pattern, .. } => (Some(pattern.clone()), None, None),
            Trigger::OnReaction { emotes } => (None, Some(serde_json::to_value(emotes)?), None),
            Trigger::OnInvoke { command } => (None, None, Some(command.clone())),
        };
        let record = EventRecord {
            version: EVENT_VERSION,
            ty: self.trigger.type_name().to_string(),
            name: self.name.clone(),
            desc: self.desc.clone(),
            author_id: self.author_id,
            author_name: self.author_name.clone(),
            channels: self.channels.iter().cloned().map(Value::String).collect(),
            script: self.script.clone(),
            pattern,
            emotes,
            command,
            tone: None,
        };
        Ok(serde_json::to_value(record)?)
    }

    /// Read a record of any supported version, migrating older ones.
    pub fn from_record(value: Value) -> Result<Self> {
        let record: EventRecord = serde_json::from_value(value)?;
        let version = record.version;
        let unsupported = || {
            ScriptError::Other(format!(
                "Unsupported {} event record version {version}",
                record.ty
            ))
        };
        let missing = |field: &str| ScriptError::Other(format!("Event `{}` has no `{field}`", record.name));

        let trigger = match record.ty.as_str() {
            "OnMessage" if (4..=6).contains(&version) => {
                Trigger::on_message(record.pattern.as_deref().ok_or_else(|| missing("pattern"))?)?
            }
            "OnReaction" => match (version, &record.emotes) {
                (4, Some(Value::String(emotes))) => Trigger::on_reaction(emotes),
                (5 | 6, Some(Value::Array(emotes))) => Trigger::OnReaction {
                    emotes: emotes
                        .iter()
                        .filter_map(|e| e.as_str().map(String::from))
                        .collect(),
                },
                (4..=6, _) => return Err(missing("emotes")),
                _ => return Err(unsupported()),
            },
            "OnInvoke" | "OnYell" => {
                let command = match version {
                    4 | 5 => record.tone.as_deref().or(record.command.as_deref()),
                    6 => record.command.as_deref(),
                    _ => return Err(unsupported()),
                };
                Trigger::on_invoke(command.ok_or_else(|| missing("command"))?)
            }
            "OnMessage" => return Err(unsupported()),
            other => return Err(ScriptError::Other(format!("Unknown event type `{other}`"))),
        };

        let channels = record
            .channels
            .iter()
            .filter_map(|c| match c {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect();

        Ok(Self {
            name: record.name,
            desc: record.desc,
            author_id: record.author_id,
            author_name: record.author_name,
            channels,
            script: record.script,
            trigger,
        })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trigger = self.trigger.trigger_str();
        write!(f, "**{}**: ON {} `{trigger}`", self.name, self.trigger.kind())
    }
}

#[derive(Serialize, Deserialize)]
struct EventRecord {
    #[serde(rename = "_version")]
    version: u64,
    #[serde(rename = "_type")]
    ty: String,
    name: String,
    #[serde(default)]
    desc: String,
    author_id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    author_name: String,
    #[serde(default)]
    channels: Vec<Value>,
    script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    emotes: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default, skip_serializing)]
    tone: Option<String>,
}

// ---------------------------------------------------------------------------
// Events registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Indexed {
    events: BTreeMap<String, Arc<Event>>,
    on_message: Vec<Arc<Event>>,
    on_reaction: Vec<Arc<Event>>,
    on_invoke: Vec<Arc<Event>>,
    commands: BTreeSet<String>,
}

impl Indexed {
    fn new(events: BTreeMap<String, Arc<Event>>) -> Self {
        let mut indexed = Self {
            events,
            ..Self::default()
        };
        for event in indexed.events.values() {
            match &event.trigger {
                Trigger::OnMessage { .. } => indexed.on_message.push(event.clone()),
                Trigger::OnReaction { .. } => indexed.on_reaction.push(event.clone()),
                Trigger::OnInvoke { command } => {
                    indexed.on_invoke.push(event.clone());
                    indexed.commands.insert(command.clone());
                }
            }
        }
        indexed
    }
}

/// Every event by name, indexed by trigger type and persisted on every change.
pub struct Events {
    inner: RwLock<Indexed>,
    store: Box<dyn RecordStore>,
    writes: tokio::sync::Mutex<()>,
}

impl Events {
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Indexed::default()),
            store: Box::new(MemoryStore::new()),
            writes: tokio::sync::Mutex::new(()),
        }
    }

    /// Load `events.json` from `dir`.
    pub async fn load(dir: &Path) -> Result<Self> {
        Self::with_store(Box::new(JsonFileStore::in_dir(dir, "events"))).await
    }

    pub async fn with_store(store: Box<dyn RecordStore>) -> Result<Self> {
        let records = store.load().await?;
        let outdated = records
            .iter()
            .any(|r| r.get("_version").and_then(Value::as_u64) != Some(EVENT_VERSION));
        if outdated {
            store.backup(&format!(".v{}_backup", EVENT_VERSION - 1)).await?;
            tracing::info!("Upgrading event records");
        }

        let mut events = BTreeMap::new();
        for record in records {
            match Event::from_record(record) {
                Ok(event) => {
                    events.insert(event.name.clone(), Arc::new(event));
                }
                Err(e) => tracing::warn!(error = %e, "Skipped unreadable event"),
            }
        }
        Ok(Self {
            inner: RwLock::new(Indexed::new(events)),
            store,
            writes: tokio::sync::Mutex::new(()),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Indexed> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indexed> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Event>> {
        self.read().events.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().events.contains_key(name)
    }

    pub fn list(&self) -> Vec<Arc<Event>> {
        self.read().events.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every command some OnInvoke event listens for.
    pub fn invoke_commands(&self) -> BTreeSet<String> {
        self.read().commands.clone()
    }

    /// OnMessage events enabled in `channel` whose pattern occurs in `content`.
    pub fn on_message(&self, channel: &str, content: &str) -> Vec<(Arc<Event>, MessageMatch)> {
        self.read()
            .on_message
            .iter()
            .filter_map(|e| Some((e.clone(), e.test_message(channel, content)?)))
            .collect()
    }

    pub fn on_reaction(&self, channel: &str, emoji: &str) -> Vec<Arc<Event>> {
        self.read()
            .on_reaction
            .iter()
            .filter(|e| e.test_reaction(channel, emoji))
            .cloned()
            .collect()
    }

    pub fn on_invoke(&self, channel: &str, command: &str) -> Vec<Arc<Event>> {
        self.read()
            .on_invoke
            .iter()
            .filter(|e| e.test_invoke(channel, command))
            .cloned()
            .collect()
    }

    /// Apply `change` to the event map and persist the result.
    async fn modify<T>(&self, change: impl FnOnce(&mut BTreeMap<String, Arc<Event>>) -> T) -> Result<T> {
        let _guard = self.writes.lock().await;
        let (result, records) = {
            let mut inner = self.write();
            let mut events = std::mem::take(&mut inner.events);
            let result = change(&mut events);
            *inner = Indexed::new(events);
            let records = inner
                .events
                .values()
                .map(|e| e.to_record())
                .collect::<Result<Vec<_>>>()?;
            (result, records)
        };
        self.store.save(&records).await?;
        Ok(result)
    }

    /// Add or replace an event.
    pub async fn insert(&self, event: Event) -> Result<Arc<Event>> {
        let event = Arc::new(event);
        let inserted = event.clone();
        self.modify(move |events| events.insert(inserted.name.clone(), inserted))
            .await?;
        tracing::info!(name = %event.name, trigger = %event.trigger.kind(), "Event saved");
        Ok(event)
    }

    pub async fn remove(&self, name: &str) -> Result<Option<Arc<Event>>> {
        let removed = self.modify(|events| events.remove(name)).await?;
        if removed.is_some() {
            tracing::info!(name, "Event deleted");
        }
        Ok(removed)
    }

    /// Enable or disable an event in a channel. Returns `false` if there is no such event.
    pub async fn set_enabled(&self, name: &str, channel: &str, enabled: bool) -> Result<bool> {
        self.modify(|events| {
            let Some(event) = events.get_mut(name) else {
                return false;
            };
            let event = Arc::make_mut(event);
            if enabled {
                event.enable(channel);
            } else {
                event.disable(channel);
            }
            true
        })
        .await
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events").field("count", &self.len()).finish()
    }
}

// ---------------------------------------------------------------------------
// Definition commands
// ---------------------------------------------------------------------------

const COMMAND_PATTERN: &str =
    r"(?is)^\s*(NEW|EDIT)\s+EVENT\s+(\w[\w.]+)\s+ON\s+(MESSAGE|REACT(?:ION)?|INVOKE)\s+(.*?)\s*::\s*(.*)";

/// `NEW|EDIT EVENT name ON MESSAGE|REACT[ION]|INVOKE trigger :: script`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCommand {
    pub edit: bool,
    pub name: String,
    pub kind: TriggerKind,
    pub trigger: String,
    pub script: String,
}

impl EventCommand {
    /// `Ok(None)` if `text` is not an event command.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let pattern = Regex::new(COMMAND_PATTERN)?;
        let Some(caps) = pattern.captures(text) else {
            return Ok(None);
        };
        let Some(kind) = TriggerKind::from_keyword(&caps[3]) else {
            return Ok(None);
        };
        Ok(Some(Self {
            edit: caps[1].eq_ignore_ascii_case("EDIT"),
            name: caps[2].to_lowercase(),
            kind,
            trigger: caps[4].to_string(),
            script: caps[5].to_string(),
        }))
    }

    /// Carry out the command for `author` in `channel`, replying through `sink`.
    /// A new event starts out enabled in the channel it was defined in.
    ///
    /// Returns whether an event was saved.
    pub async fn run(&self, author: &User, channel: &str, rt: &Runtime, sink: &dyn OutputSink) -> Result<bool> {
        let name = &self.name;
        let existing = rt.events.get(name);
        match (&existing, self.edit) {
            (Some(_), false) => {
                sink.send_text(
                    "An event by that name already exists. Use EDIT instead of NEW, or choose a different name.",
                )
                .await?;
                return Ok(false);
            }
            (None, true) => {
                sink.send_text(
                    "An event by that name does not exist yet. Use NEW instead of EDIT, or choose an existing name.",
                )
                .await?;
                return Ok(false);
            }
            _ => {}
        }

        let errors = ExecutableScript::from_string(&self.script, rt).get_static_errors().clone();
        if errors.is_terminal() {
            sink.send_text("Failed to save event due to parsing errors:").await?;
            sink.send_error_log(&errors, name).await?;
            return Ok(false);
        }
        if !errors.is_empty() {
            sink.send_text("Encountered warnings while parsing event:").await?;
            sink.send_error_log(&errors, name).await?;
        }

        let verb = if self.edit { "update" } else { "register" };
        let trigger = match Trigger::parse(self.kind, &self.trigger) {
            Ok(trigger) => trigger,
            Err(e) => {
                sink.send_text(&format!("Failed to {verb} event:\n\t{}: {e}", e.kind()))
                    .await?;
                return Ok(false);
            }
        };

        let event = match existing {
            Some(existing) => {
                if existing.trigger.kind() != self.kind {
                    sink.send_text(&format!(
                        "Event \"{name}\" cannot be edited to be a different type. Try deleting it first."
                    ))
                    .await?;
                    return Ok(false);
                }
                let mut event = (*existing).clone();
                event.script = self.script.clone();
                event.trigger = trigger;
                event
            }
            None => {
                let mut event = Event::new(name.as_str(), author, self.script.as_str(), trigger);
                event.enable(channel);
                event
            }
        };

        let event = rt.events.insert(event).await?;
        let reply = if self.edit {
            format!("Event `{name}` updated.")
        } else {
            format!("New event `{name}` registered.")
        };
        sink.send_text(&format!("{reply}\n{event}")).await?;
        Ok(true)
    }
}
