//! Native pipe, source and spout traits and the registry that holds them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use pipescript_types::{Result, ScriptError, User};

use crate::context::Context;
use crate::signature::{EvaluatedArguments, Signature};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// What every pipe, source and spout has in common.
pub trait Pipeoid: Send + Sync {
    fn name(&self) -> &str;

    fn aliases(&self) -> Vec<String> {
        Vec::new()
    }

    fn signature(&self) -> &Signature;

    fn doc(&self) -> &str {
        ""
    }

    /// Whether `user` may use this at all.
    fn may_use(&self, _user: &User) -> bool {
        true
    }
}

/// Transforms a list of items into a new list of items.
#[async_trait]
pub trait Pipe: Pipeoid {
    async fn apply(&self, items: Vec<String>, args: &EvaluatedArguments) -> Result<Vec<String>>;
}

/// Produces items out of nothing but its arguments and the context.
#[async_trait]
pub trait Source: Pipeoid {
    /// Whether `{all name}` makes sense, i.e. the source has a finite supply.
    fn depletable(&self) -> bool {
        false
    }

    /// Plural alias, so `{3 words}` reads naturally; only for sources taking `n`.
    fn plural(&self) -> Option<String> {
        self.signature()
            .contains("n")
            .then(|| format!("{}s", self.name()))
    }

    async fn generate(&self, ctx: &Context, args: &EvaluatedArguments) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoutMode {
    /// Performed once per time the spout was encountered.
    Simple,
    /// Performed once per script, with every encounter's values.
    Aggregated,
}

/// Performs a side effect after the script has finished; does not change items.
#[async_trait]
pub trait Spout: Pipeoid {
    fn mode(&self) -> SpoutMode {
        SpoutMode::Simple
    }

    async fn perform(&self, ctx: &Context, calls: &[(Vec<String>, EvaluatedArguments)]) -> Result<()>;
}

macro_rules! impl_debug_for_dyn {
    ($($t:ident),*) => {$(
        impl fmt::Debug for dyn $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($t), self.name())
            }
        }
    )*};
}

impl_debug_for_dyn!(Pipe, Source, Spout);

// ---------------------------------------------------------------------------
// PipeoidStore
// ---------------------------------------------------------------------------

/// Name (and alias) indexed collection of one kind of pipeoid.
pub struct PipeoidStore<T: ?Sized + Pipeoid> {
    kind: &'static str,
    by_name: HashMap<String, Arc<T>>,
    /// Primary names in registration order.
    order: Vec<String>,
}

impl<T: ?Sized + Pipeoid> PipeoidStore<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            by_name: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn add(&mut self, item: Arc<T>, extra: Option<String>) -> Result<()> {
        let mut names = vec![item.name().to_lowercase()];
        names.extend(item.aliases().into_iter().map(|a| a.to_lowercase()));
        names.extend(extra);

        for name in &names {
            if self.by_name.contains_key(name) {
                return Err(ScriptError::Other(format!(
                    "Overlapping name: {}:{name}",
                    self.kind
                )));
            }
        }
        tracing::debug!(kind = self.kind, name = %names[0], "Registered native");
        self.order.push(names[0].clone());
        for name in names {
            self.by_name.insert(name, item.clone());
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<T>> {
        self.by_name.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Every registered item once, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.order.iter().filter_map(|n| self.by_name.get(n))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ---------------------------------------------------------------------------
// NativeRegistry
// ---------------------------------------------------------------------------

pub struct NativeRegistry {
    pub pipes: PipeoidStore<dyn Pipe>,
    pub sources: PipeoidStore<dyn Source>,
    pub spouts: PipeoidStore<dyn Spout>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self {
            pipes: PipeoidStore::new("Pipe"),
            sources: PipeoidStore::new("Source"),
            spouts: PipeoidStore::new("Spout"),
        }
    }

    pub fn register_pipe(&mut self, pipe: impl Pipe + 'static) -> Result<()> {
        self.pipes.add(Arc::new(pipe), None)
    }

    pub fn register_source(&mut self, source: impl Source + 'static) -> Result<()> {
        let plural = source.plural();
        self.sources.add(Arc::new(source), plural)
    }

    pub fn register_spout(&mut self, spout: impl Spout + 'static) -> Result<()> {
        self.spouts.add(Arc::new(spout), None)
    }

    /// Whether any kind of native goes by `name`.
    pub fn has(&self, name: &str) -> bool {
        self.pipes.has(name) || self.sources.has(name) || self.spouts.has(name)
    }
}

impl Default for NativeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeRegistry")
            .field("pipes", &self.pipes.len())
            .field("sources", &self.sources.len())
            .field("spouts", &self.spouts.len())
            .finish()
    }
}
