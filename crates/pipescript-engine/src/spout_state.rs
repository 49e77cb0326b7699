//! Side effects collected while a pipeline runs, performed once it is done.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use pipescript_types::{ErrorLog, Result};

use crate::registry::{Spout, SpoutMode};
use crate::signature::EvaluatedArguments;

// ---------------------------------------------------------------------------
// OutputSink
// ---------------------------------------------------------------------------

/// Where a script's visible output goes: a chat channel, a terminal, a test buffer.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Show an error or warning log, titled with the execution's name.
    async fn send_error_log(&self, errors: &ErrorLog, name: &str) -> Result<()>;
}

/// One thing an [`OutputSink`] received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkMessage {
    Text(String),
    ErrorLog {
        title: String,
        body: String,
        terminal: bool,
    },
}

/// Keeps everything it is sent, in order.
#[derive(Debug, Default)]
pub struct CollectingSink {
    messages: Mutex<Vec<SinkMessage>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<SinkMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Only the plain text messages.
    pub fn texts(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                SinkMessage::Text(t) => Some(t),
                SinkMessage::ErrorLog { .. } => None,
            })
            .collect()
    }

    fn push(&self, message: SinkMessage) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }
}

#[async_trait]
impl OutputSink for CollectingSink {
    async fn send_text(&self, text: &str) -> Result<()> {
        self.push(SinkMessage::Text(text.to_string()));
        Ok(())
    }

    async fn send_error_log(&self, errors: &ErrorLog, name: &str) -> Result<()> {
        self.push(SinkMessage::ErrorLog {
            title: errors.title(Some(name)),
            body: errors.render(),
            terminal: errors.is_terminal(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SpoutState
// ---------------------------------------------------------------------------

/// A single encounter of a simple spout.
#[derive(Debug, Clone)]
pub struct SpoutCall {
    pub spout: Arc<dyn Spout>,
    pub values: Vec<String>,
    pub args: EvaluatedArguments,
}

#[derive(Debug, Clone, Default)]
pub struct SpoutState {
    /// Columns of printed values, shown as a table at the end.
    pub print_values: Vec<Vec<String>>,
    pub callbacks: Vec<SpoutCall>,
    /// Aggregated spouts in order of first appearance, with every call made to them.
    pub aggregated: Vec<(Arc<dyn Spout>, Vec<(Vec<String>, EvaluatedArguments)>)>,
}

impl SpoutState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an encounter of `spout` with the given values and arguments.
    pub fn hook(&mut self, spout: Arc<dyn Spout>, values: Vec<String>, args: EvaluatedArguments) {
        match spout.mode() {
            SpoutMode::Simple => self.callbacks.push(SpoutCall { spout, values, args }),
            SpoutMode::Aggregated => {
                match self
                    .aggregated
                    .iter_mut()
                    .find(|(s, _)| s.name() == spout.name())
                {
                    Some((_, calls)) => calls.push((values, args)),
                    None => self.aggregated.push((spout, vec![(values, args)])),
                }
            }
        }
    }

    pub fn extend(&mut self, other: SpoutState, extend_print: bool) {
        if extend_print {
            self.print_values.extend(other.print_values);
        }
        self.callbacks.extend(other.callbacks);
        for (spout, calls) in other.aggregated {
            match self
                .aggregated
                .iter_mut()
                .find(|(s, _)| s.name() == spout.name())
            {
                Some((_, existing)) => existing.extend(calls),
                None => self.aggregated.push((spout, calls)),
            }
        }
    }

    /// Whether any spout at all was encountered.
    pub fn anything(&self) -> bool {
        !self.callbacks.is_empty() || !self.aggregated.is_empty()
    }

    pub fn has_spout(&self, name: &str) -> bool {
        self.callbacks.iter().any(|c| c.spout.name() == name)
            || self.aggregated.iter().any(|(s, _)| s.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::registry::Pipeoid;
    use crate::signature::Signature;

    struct Tally(SpoutMode, Signature);

    impl Pipeoid for Tally {
        fn name(&self) -> &str {
            match self.0 {
                SpoutMode::Simple => "simple",
                SpoutMode::Aggregated => "tally",
            }
        }
        fn signature(&self) -> &Signature {
            &self.1
        }
    }

    #[async_trait]
    impl Spout for Tally {
        fn mode(&self) -> SpoutMode {
            self.0
        }
        async fn perform(&self, _: &Context, _: &[(Vec<String>, EvaluatedArguments)]) -> Result<()> {
            Ok(())
        }
    }

    fn values(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn aggregated_calls_group_by_spout() {
        let tally: Arc<dyn Spout> = Arc::new(Tally(SpoutMode::Aggregated, Signature::empty()));
        let simple: Arc<dyn Spout> = Arc::new(Tally(SpoutMode::Simple, Signature::empty()));
        let mut state = SpoutState::new();
        assert!(!state.anything());

        state.hook(tally.clone(), values(&["a"]), EvaluatedArguments::new());
        state.hook(simple, values(&["b"]), EvaluatedArguments::new());
        state.hook(tally, values(&["c"]), EvaluatedArguments::new());

        assert!(state.anything());
        assert_eq!(state.callbacks.len(), 1);
        assert_eq!(state.aggregated.len(), 1);
        assert_eq!(state.aggregated[0].1.len(), 2);
        assert!(state.has_spout("tally"));
        assert!(!state.has_spout("say"));
    }

    #[test]
    fn extend_only_takes_print_values_when_asked() {
        let mut a = SpoutState::new();
        let mut b = SpoutState::new();
        b.print_values.push(values(&["x"]));
        a.extend(b.clone(), false);
        assert!(a.print_values.is_empty());
        a.extend(b, true);
        assert_eq!(a.print_values, vec![values(&["x"])]);
    }

    #[tokio::test]
    async fn collecting_sink_records_in_order() {
        let sink = CollectingSink::new();
        sink.send_text("hello").await.unwrap();
        let mut errors = ErrorLog::new();
        errors.log("bad", true);
        sink.send_error_log(&errors, "someone's script").await.unwrap();

        let messages = sink.messages();
        assert_eq!(messages[0], SinkMessage::Text("hello".into()));
        assert!(matches!(
            &messages[1],
            SinkMessage::ErrorLog { title, terminal: true, .. } if title == "Error log for someone's script"
        ));
        assert_eq!(sink.texts(), vec!["hello"]);
    }
}
