//! The shared [`Runtime`] (registries, caches, configuration) and the
//! per-execution [`Context`] handed down through every evaluator.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pipescript_types::{Origin, Result, User};

use crate::events::Events;
use crate::macros::{Macro, MacroRegistry};
use crate::pipeline::Pipeline;
use crate::registry::NativeRegistry;
use crate::script::ExecutableScript;
use crate::spout_state::OutputSink;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Flows with more characters than this are refused for untrusted users.
    pub max_chars: usize,
    /// Number of parsed scripts (and macro pipelines) kept around.
    pub script_cache_size: usize,
    /// Where macro and event JSON files live. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// How deeply macros may call other macros.
    pub max_macro_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_chars: 10_000,
            script_cache_size: 40,
            data_dir: None,
            max_macro_depth: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// Parse cache
// ---------------------------------------------------------------------------

/// Least-recently-used cache keyed by source text.
pub(crate) struct Lru<V> {
    capacity: usize,
    entries: VecDeque<(String, V)>,
}

impl<V: Clone> Lru<V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub(crate) fn get(&mut self, key: &str) -> Option<V> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        let entry = self.entries.remove(pos)?;
        let value = entry.1.clone();
        self.entries.push_back(entry);
        Some(value)
    }

    pub(crate) fn insert(&mut self, key: String, value: V) {
        if self.capacity == 0 {
            return;
        }
        self.entries.retain(|(k, _)| *k != key);
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((key, value));
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Everything shared between script executions: native pipes, macros,
/// events, parse caches and the previous output per channel.
///
/// Loaded once at startup and passed around as `Arc<Runtime>`. Macros and
/// events are only mutated through their registries' write operations.
pub struct Runtime {
    pub config: RuntimeConfig,
    pub natives: NativeRegistry,
    pub macros: MacroRegistry,
    pub events: Events,
    scripts: Mutex<Lru<Arc<ExecutableScript>>>,
    pipelines: Mutex<Lru<Arc<Pipeline>>>,
    previous_output: Mutex<HashMap<String, Vec<String>>>,
}

impl Runtime {
    /// A runtime with in-memory macro and event registries.
    pub fn new(config: RuntimeConfig, natives: NativeRegistry) -> Self {
        Self::with_registries(config, natives, MacroRegistry::in_memory(), Events::in_memory())
    }

    /// A runtime whose macros and events are loaded from (and saved to)
    /// `config.data_dir`, or kept in memory if it is unset.
    pub async fn load(config: RuntimeConfig, natives: NativeRegistry) -> Result<Self> {
        let Some(dir) = config.data_dir.clone() else {
            return Ok(Self::new(config, natives));
        };
        tokio::fs::create_dir_all(&dir).await?;
        let macros = MacroRegistry::load(&dir).await?;
        let events = Events::load(&dir).await?;
        tracing::info!(
            data_dir = %dir.display(),
            macros = macros.len(),
            events = events.len(),
            "Runtime loaded"
        );
        Ok(Self::with_registries(config, natives, macros, events))
    }

    fn with_registries(
        config: RuntimeConfig,
        natives: NativeRegistry,
        macros: MacroRegistry,
        events: Events,
    ) -> Self {
        let size = config.script_cache_size;
        Self {
            config,
            natives,
            macros,
            events,
            scripts: Mutex::new(Lru::new(size)),
            pipelines: Mutex::new(Lru::new(size)),
            previous_output: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn cached_script(&self, script: &str) -> Option<Arc<ExecutableScript>> {
        lock(&self.scripts).get(script)
    }

    pub(crate) fn cache_script(&self, script: &str, parsed: Arc<ExecutableScript>) {
        lock(&self.scripts).insert(script.to_string(), parsed);
    }

    pub(crate) fn cached_pipeline(&self, code: &str) -> Option<Arc<Pipeline>> {
        lock(&self.pipelines).get(code)
    }

    pub(crate) fn cache_pipeline(&self, code: &str, parsed: Arc<Pipeline>) {
        lock(&self.pipelines).insert(code.to_string(), parsed);
    }

    pub fn cached_script_count(&self) -> usize {
        lock(&self.scripts).len()
    }

    /// The output of the last direct script executed in `channel`.
    pub fn previous_output(&self, channel: &str) -> Vec<String> {
        lock(&self.previous_output)
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_previous_output(&self, channel: &str, values: Vec<String>) {
        lock(&self.previous_output).insert(channel.to_string(), values);
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("natives", &self.natives)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Ambient information for one script execution.
///
/// Cheap to clone; a nested context (see [`Context::into_macro`]) copies
/// everything it does not replace.
#[derive(Clone)]
pub struct Context {
    pub runtime: Arc<Runtime>,
    pub origin: Arc<Origin>,
    /// The user whose authority the script runs with. For macros, the macro's author.
    pub author: User,
    pub channel: Option<String>,
    /// The message that triggered the execution, if any.
    pub message: Option<String>,
    /// The macro currently being executed, if any.
    pub macro_def: Option<Arc<Macro>>,
    /// Arguments bound by a macro call or an event trigger.
    pub arguments: Option<Arc<BTreeMap<String, String>>>,
    pub sink: Arc<dyn OutputSink>,
    pub execution_id: Uuid,
    /// Number of macro calls this context is nested in.
    pub depth: usize,
}

impl Context {
    pub fn new(runtime: Arc<Runtime>, origin: Origin, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            author: origin.activator.clone(),
            runtime,
            origin: Arc::new(origin),
            channel: None,
            message: None,
            macro_def: None,
            arguments: None,
            sink,
            execution_id: Uuid::new_v4(),
            depth: 0,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_author(mut self, author: User) -> Self {
        self.author = author;
        self
    }

    pub fn with_arguments(mut self, arguments: BTreeMap<String, String>) -> Self {
        self.arguments = Some(Arc::new(arguments));
        self
    }

    /// A child context for executing `macro_def` with the given arguments.
    pub fn into_macro(&self, macro_def: Arc<Macro>, arguments: BTreeMap<String, String>) -> Self {
        let mut ctx = self.clone();
        ctx.author = User::new(macro_def.author_id, macro_def.author_name.clone());
        ctx.macro_def = Some(macro_def);
        ctx.arguments = Some(Arc::new(arguments));
        ctx.depth += 1;
        ctx
    }

    /// Whether the user that started this execution is exempt from the flow size guard.
    pub fn is_trusted(&self) -> bool {
        self.origin.activator.trusted
    }

    #[cfg(test)]
    pub(crate) fn for_tests(runtime: Arc<Runtime>) -> Self {
        Self::new(
            runtime,
            Origin::direct(User::new(1, "tester")),
            Arc::new(crate::spout_state::CollectingSink::default()),
        )
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("origin", &self.origin)
            .field("author", &self.author)
            .field("channel", &self.channel)
            .field("macro", &self.macro_def.as_ref().map(|m| m.name.as_str()))
            .field("arguments", &self.arguments)
            .field("execution_id", &self.execution_id)
            .field("depth", &self.depth)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_runtime() -> Arc<Runtime> {
    Arc::new(Runtime::new(
        RuntimeConfig::default(),
        crate::natives::default_registry(),
    ))
}
