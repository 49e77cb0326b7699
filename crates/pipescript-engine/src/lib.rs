//! Execution engine for pipeline scripts.
//!
//! A script is an origin (the starting items) followed by a pipeline of
//! `>`-separated segments. Each segment splits the items into groups with its
//! group mode and sends every group through one of its pipes, which may be
//! native pipes, sources, spouts, nested pipelines or user-defined macros.
//! Events run scripts in response to chat activity, routed by the
//! [`ScriptProcessor`].

pub mod condition;
pub mod context;
pub mod events;
pub mod groupmode;
pub mod macros;
pub mod natives;
pub mod pipeline;
pub mod processor;
pub mod registry;
pub mod script;
pub mod signature;
pub mod spout_state;
pub mod store;
pub mod templated;

pub use condition::Condition;
pub use context::{Context, Runtime, RuntimeConfig};
pub use events::{Event, EventCommand, Events, MessageMatch, Trigger, TriggerKind};
pub use groupmode::GroupMode;
pub use macros::{Macro, MacroCommand, MacroKind, MacroParam, MacroRegistry};
pub use natives::default_registry;
pub use pipeline::{Pipeline, PipelineOutput};
pub use processor::{IncomingMessage, ScriptProcessor};
pub use registry::{NativeRegistry, Pipe, Pipeoid, Source, Spout, SpoutMode};
pub use script::{print_table, ExecutableScript};
pub use signature::{ArgValue, Arguments, EvaluatedArguments, Par, ParamType, Signature};
pub use spout_state::{CollectingSink, OutputSink, SinkMessage, SpoutState};
pub use store::{JsonFileStore, MemoryStore, RecordStore};
pub use templated::TemplatedString;
