//! End-to-end tests for the script engine.
//!
//! Each test goes through the public API only: build a runtime, run scripts or
//! feed messages to the processor, and inspect what reached the output sink.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;

use pipescript_engine::groupmode::split_items;
use pipescript_engine::{
    default_registry, CollectingSink, Context, EvaluatedArguments, Event, ExecutableScript,
    IncomingMessage, Macro, MacroKind, MacroParam, ParamType, Par, Pipe, Pipeoid, Runtime,
    RuntimeConfig, ScriptProcessor, Signature, SinkMessage, Trigger,
};
use pipescript_grammar::{Split, SplitKind};
use pipescript_types::{Origin, Result, User};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn runtime() -> Arc<Runtime> {
    Arc::new(Runtime::new(RuntimeConfig::default(), default_registry()))
}

fn user() -> User {
    User::new(1, "tester")
}

/// Run `script` as a direct script and return everything the sink received.
async fn run(rt: &Arc<Runtime>, script: &str) -> Vec<SinkMessage> {
    let sink = CollectingSink::new();
    let ctx = Context::new(rt.clone(), Origin::direct(user()), sink.clone()).with_channel("test");
    ExecutableScript::from_string(script, rt)
        .execute(&ctx, None)
        .await
        .expect("execution failed");
    sink.messages()
}

async fn output(rt: &Arc<Runtime>, script: &str) -> String {
    let messages = run(rt, script).await;
    match messages.as_slice() {
        [SinkMessage::Text(text)] => text.clone(),
        other => panic!("expected a single text output, got {other:?}"),
    }
}

/// Surrounds every item with a bracket pair.
struct Bracket(Signature);

impl Bracket {
    fn new() -> Self {
        Self(Signature::new([(
            "style",
            Par::new(ParamType::Choice(vec!["round".into(), "square".into()]), "Bracket style")
                .with_default("square"),
        )]))
    }
}

impl Pipeoid for Bracket {
    fn name(&self) -> &str {
        "bracket"
    }

    fn signature(&self) -> &Signature {
        &self.0
    }
}

#[async_trait]
impl Pipe for Bracket {
    async fn apply(&self, items: Vec<String>, args: &EvaluatedArguments) -> Result<Vec<String>> {
        let (open, close) = match args.str("style")? {
            "round" => ("(", ")"),
            _ => ("[", "]"),
        };
        Ok(items.into_iter().map(|i| format!("{open}{i}{close}")).collect())
    }
}

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn group_modes_and_parallel_pipes() {
    let rt = runtime();
    assert_eq!(output(&rt, "[a|b|c|d] > (1) [upper|lower] > join s=-").await, "A-b-C-d");
    assert_eq!(output(&rt, "[a|b|c] > (2) join s=+ > join s=\"/\"").await, "a+b/c");
}

#[tokio::test]
async fn slash_opens_a_quoted_argument() {
    let rt = runtime();
    let messages = run(&rt, "[a|b] > join s=/").await;
    assert!(matches!(&messages[0], SinkMessage::ErrorLog { terminal: true, .. }));
}

#[tokio::test]
async fn custom_natives_are_callable() {
    let mut natives = default_registry();
    natives.register_pipe(Bracket::new()).unwrap();
    let rt = Arc::new(Runtime::new(RuntimeConfig::default(), natives));

    assert_eq!(output(&rt, "x > bracket").await, "[x]");
    assert_eq!(output(&rt, "x > bracket style=round").await, "(x)");

    let messages = run(&rt, "x > bracket style=curly").await;
    assert!(matches!(&messages[0], SinkMessage::ErrorLog { terminal: true, .. }));
}

#[tokio::test]
async fn templated_origins_use_sources_and_inline_scripts() {
    let rt = runtime();
    assert_eq!(output(&rt, "{>> shout > upper} and more").await, "SHOUT and more");
}

#[tokio::test]
async fn warnings_accompany_output() {
    let rt = runtime();
    let messages = run(&rt, "x > upper this is ignored").await;
    assert_eq!(messages[0], SinkMessage::Text("X".into()));
    assert!(matches!(
        &messages[1],
        SinkMessage::ErrorLog { terminal: false, body, .. } if body.contains("Unused implicit argument")
    ));
}

#[tokio::test]
async fn untrusted_users_are_held_to_the_character_limit() {
    let config = RuntimeConfig {
        max_chars: 10,
        ..RuntimeConfig::default()
    };
    let rt = Arc::new(Runtime::new(config, default_registry()));
    let messages = run(&rt, "abcdef > repeat times=3").await;
    assert!(matches!(
        &messages[0],
        SinkMessage::ErrorLog { terminal: true, body, .. } if body.contains("total characters")
    ));
}

// ---------------------------------------------------------------------------
// Macros and events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn macros_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = RuntimeConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..RuntimeConfig::default()
    };

    {
        let rt = Runtime::load(config.clone(), default_registry()).await.unwrap();
        let mut wrap = Macro::new(MacroKind::Pipe, "wrap", "join s={arg sep}", user());
        wrap.set_param(MacroParam::new("sep", Some(", "), "What goes between"));
        rt.macros.insert(wrap).await.unwrap();
        rt.macros
            .insert(Macro::new(MacroKind::Source, "letters", "[x|y|z]", user()))
            .await
            .unwrap();
    }
    assert!(dir.path().join("pipe_macros.json").exists());

    let rt = Arc::new(Runtime::load(config, default_registry()).await.unwrap());
    assert_eq!(rt.macros.len(), 2);
    assert_eq!(output(&rt, "{letters} > wrap").await, "x, y, z");
    assert_eq!(output(&rt, "{letters} > wrap sep=;").await, "x;y;z");
}

#[tokio::test]
async fn processor_runs_definitions_then_events() {
    let rt = runtime();
    let processor = ScriptProcessor::new(rt.clone(), ">>");
    let sink = CollectingSink::new();
    let say = |text: &str| IncomingMessage::new(user(), "general", text);

    processor
        .interpret_message(&say(">> NEW EVENT echo ON MESSAGE ^echo (.*)$ :: {0} > upper"), sink.clone())
        .await
        .unwrap();
    assert!(rt.events.get("echo").unwrap().is_enabled("general"));

    let ran = processor.on_message(&say("echo hello there"), sink.clone()).await.unwrap();
    assert_eq!(ran, 1);
    assert_eq!(sink.texts().last().unwrap(), "HELLO THERE");
}

#[tokio::test]
async fn invoked_events_see_their_arguments() {
    let rt = runtime();
    let mut event = Event::new("greet", &user(), "Hello {arg who}!", Trigger::on_invoke("greet"));
    event.enable("general");
    rt.events.insert(event).await.unwrap();

    let processor = ScriptProcessor::new(rt, ">>");
    let sink = CollectingSink::new();
    let arguments = BTreeMap::from([("who".to_string(), "world".to_string())]);
    processor
        .invoke("general", "greet", arguments, &User::new(2, "caller"), sink.clone())
        .await
        .unwrap();
    assert_eq!(sink.texts(), vec!["Hello world!"]);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn row_groups_keep_every_item_in_order(items in prop::collection::vec("[a-z]{0,3}", 0..40), size in 1usize..8) {
        let split = Split { kind: SplitKind::Row { size, padding: false }, strictness: 0 };
        let groups = split_items(&split, items.clone()).unwrap();

        let flattened: Vec<String> = groups.iter().flat_map(|(g, _)| g.clone()).collect();
        prop_assert_eq!(flattened, items.clone());
        if !items.is_empty() {
            prop_assert_eq!(groups.len(), items.len().div_ceil(size));
            prop_assert!(groups.iter().all(|(g, _)| g.len() <= size));
        }
    }
}
