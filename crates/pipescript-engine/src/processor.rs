//! Entry point for chat input: prefixed messages run as scripts or
//! definition commands, everything else is checked against events.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;

use pipescript_types::{ItemScope, Origin, OriginKind, Result, User};

use crate::context::{Context, Runtime};
use crate::events::{Event, EventCommand};
use crate::macros::MacroCommand;
use crate::script::ExecutableScript;
use crate::spout_state::OutputSink;

/// Anything that looks like a definition command, well formed or not.
const DEFINITION_PATTERN: &str = r"(?i)^\s*(NEW|EDIT|DESC).*::";

/// A message as received from a channel.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub author: User,
    pub channel: String,
    pub content: String,
}

impl IncomingMessage {
    pub fn new(author: User, channel: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            author,
            channel: channel.into(),
            content: content.into(),
        }
    }
}

pub struct ScriptProcessor {
    runtime: Arc<Runtime>,
    prefix: String,
}

impl ScriptProcessor {
    pub fn new(runtime: Arc<Runtime>, prefix: impl Into<String>) -> Self {
        Self {
            runtime,
            prefix: prefix.into(),
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Run a prefixed message as a script or a macro/event definition.
    ///
    /// Returns `false` if the message does not start with the prefix.
    pub async fn interpret_message(&self, message: &IncomingMessage, sink: Arc<dyn OutputSink>) -> Result<bool> {
        let Some(script) = message.content.strip_prefix(&self.prefix) else {
            return Ok(false);
        };
        let rt = &self.runtime;

        if Regex::new(DEFINITION_PATTERN)?.is_match(script) {
            if let Some(command) = MacroCommand::parse(script)? {
                tracing::info!(name = %command.name, mode = ?command.mode, "Macro command");
                command.run(&message.author, rt, sink.as_ref()).await?;
            } else if let Some(command) = EventCommand::parse(script)? {
                tracing::info!(name = %command.name, edit = command.edit, "Event command");
                command
                    .run(&message.author, &message.channel, rt, sink.as_ref())
                    .await?;
            } else {
                sink.send_text("Error: Poorly formed script-like command.").await?;
            }
            return Ok(true);
        }

        let ctx = Context::new(rt.clone(), Origin::direct(message.author.clone()), sink)
            .with_channel(message.channel.as_str())
            .with_message(message.content.as_str());
        self.execute_script(script, &ctx, None).await?;
        Ok(true)
    }

    fn event_context(&self, event: &Event, activator: &User, channel: &str, sink: Arc<dyn OutputSink>) -> Context {
        let origin = Origin::new(OriginKind::Event, activator.clone(), Some(event.name.clone()));
        Context::new(self.runtime.clone(), origin, sink)
            .with_author(event.author())
            .with_channel(channel)
    }

    /// Run every OnMessage event the message triggers. Returns how many ran.
    pub async fn on_message(&self, message: &IncomingMessage, sink: Arc<dyn OutputSink>) -> Result<usize> {
        let triggered = self.runtime.events.on_message(&message.channel, &message.content);
        for (event, matched) in &triggered {
            tracing::info!(event = %event.name, channel = %message.channel, "Message triggered event");
            let ctx = self
                .event_context(event, &message.author, &message.channel, sink.clone())
                .with_message(message.content.as_str())
                .with_arguments(matched.arguments.clone());
            let scope = ItemScope::root(matched.items.clone());
            self.execute_script(&event.script, &ctx, Some(&scope)).await?;
        }
        Ok(triggered.len())
    }

    /// Run every OnReaction event listening for `emoji` in `channel`.
    pub async fn on_reaction(
        &self,
        channel: &str,
        emoji: &str,
        user: &User,
        sink: Arc<dyn OutputSink>,
    ) -> Result<usize> {
        let triggered = self.runtime.events.on_reaction(channel, emoji);
        for event in &triggered {
            tracing::info!(event = %event.name, channel, emoji, "Reaction triggered event");
            let ctx = self
                .event_context(event, user, channel, sink.clone())
                .with_arguments(BTreeMap::from([("emoji".to_string(), emoji.to_string())]));
            let scope = ItemScope::root(vec![emoji.to_string(), user.id.to_string()]);
            self.execute_script(&event.script, &ctx, Some(&scope)).await?;
        }
        Ok(triggered.len())
    }

    /// Run every OnInvoke event for `command` in `channel`, with `arguments` bound.
    pub async fn invoke(
        &self,
        channel: &str,
        command: &str,
        arguments: BTreeMap<String, String>,
        user: &User,
        sink: Arc<dyn OutputSink>,
    ) -> Result<usize> {
        let triggered = self.runtime.events.on_invoke(channel, command);
        for event in &triggered {
            tracing::info!(event = %event.name, channel, command, "Invocation triggered event");
            let ctx = self
                .event_context(event, user, channel, sink.clone())
                .with_arguments(arguments.clone());
            self.execute_script(&event.script, &ctx, None).await?;
        }
        Ok(triggered.len())
    }

    pub async fn execute_script(&self, script: &str, ctx: &Context, scope: Option<&ItemScope>) -> Result<()> {
        ExecutableScript::from_string(script, &self.runtime)
            .execute(ctx, scope)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_runtime;
    use crate::events::Trigger;
    use crate::macros::MacroKind;
    use crate::spout_state::{CollectingSink, SinkMessage};

    fn user() -> User {
        User::new(7, "someone")
    }

    fn processor() -> ScriptProcessor {
        ScriptProcessor::new(test_runtime(), ">>")
    }

    #[tokio::test]
    async fn unprefixed_messages_are_ignored() {
        let sink = CollectingSink::new();
        let handled = processor()
            .interpret_message(&IncomingMessage::new(user(), "c", "hello"), sink.clone())
            .await
            .unwrap();
        assert!(!handled);
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn prefixed_messages_run_as_direct_scripts() {
        let p = processor();
        let sink = CollectingSink::new();
        p.interpret_message(&IncomingMessage::new(user(), "c", ">> hey > upper"), sink.clone())
            .await
            .unwrap();
        assert_eq!(sink.texts(), vec!["HEY"]);

        p.interpret_message(&IncomingMessage::new(user(), "c", ">> {output} > lower"), sink.clone())
            .await
            .unwrap();
        assert_eq!(sink.texts()[1], "hey");
    }

    #[tokio::test]
    async fn definitions_are_routed() {
        let p = processor();
        let sink = CollectingSink::new();
        for text in [
            ">> NEW pipe shout :: upper",
            ">>NEW EVENT hi ON MESSAGE hello :: hi",
            ">> NEW thing x :: y",
        ] {
            p.interpret_message(&IncomingMessage::new(user(), "c", text), sink.clone())
                .await
                .unwrap();
        }
        assert!(p.runtime().macros.contains(MacroKind::Pipe, "shout"));
        assert!(p.runtime().events.contains("hi"));
        assert_eq!(sink.texts().last().unwrap(), "Error: Poorly formed script-like command.");
    }

    #[tokio::test]
    async fn message_events_receive_groups() {
        let p = processor();
        let mut event = Event::new("greet", &user(), "Hi {0}, {arg 2}!", Trigger::on_message(r"I am (\w+) the (\w+)").unwrap());
        event.enable("c");
        p.runtime().events.insert(event).await.unwrap();

        let sink = CollectingSink::new();
        let ran = p
            .on_message(&IncomingMessage::new(user(), "c", "I am Bob the Builder"), sink.clone())
            .await
            .unwrap();
        assert_eq!(ran, 1);
        assert_eq!(sink.texts(), vec!["Hi Bob, Builder!"]);

        let ran = p
            .on_message(&IncomingMessage::new(user(), "elsewhere", "I am Bob the Builder"), sink)
            .await
            .unwrap();
        assert_eq!(ran, 0);
    }

    #[tokio::test]
    async fn reaction_events_receive_emoji_and_user() {
        let p = processor();
        let mut event = Event::new("react", &user(), "{arg emoji} from {1}", Trigger::on_reaction("⭐"));
        event.enable("c");
        p.runtime().events.insert(event).await.unwrap();

        let sink = CollectingSink::new();
        assert_eq!(p.on_reaction("c", "⭐", &user(), sink.clone()).await.unwrap(), 1);
        assert_eq!(p.on_reaction("c", "💤", &user(), sink.clone()).await.unwrap(), 0);
        assert_eq!(sink.texts(), vec!["⭐ from 7"]);
    }

    #[tokio::test]
    async fn event_errors_are_titled_with_the_event() {
        let p = processor();
        let mut event = Event::new("broken", &user(), "x > frobnicate", Trigger::on_invoke("go"));
        event.enable("c");
        p.runtime().events.insert(event).await.unwrap();

        let sink = CollectingSink::new();
        p.invoke("c", "GO", BTreeMap::new(), &user(), sink.clone()).await.unwrap();
        assert!(matches!(
            &sink.messages()[0],
            SinkMessage::ErrorLog { title, .. } if title == "Error log for Event: broken"
        ));
    }
}
