use serde::{Deserialize, Serialize};

/// Where a script execution was initiated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    /// A user typed a `>>` script directly.
    Direct,
    DirectTargetingMessage,
    Command,
    /// An event fired in response to a message or reaction.
    Event,
    InteractionCallback,
    EvaluateSourcesPipe,
}

/// A chat user, as far as the script engine cares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
    /// Trusted users are exempt from the flow size guard.
    #[serde(default)]
    pub trusted: bool,
}

impl User {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            trusted: false,
        }
    }

    pub fn trusted(mut self) -> Self {
        self.trusted = true;
        self
    }
}

/// Information on how and why an execution started. Shared unchanged by every
/// nested context of that execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub kind: OriginKind,
    /// Human readable name of who/what/where this execution came from.
    pub name: String,
    pub activator: User,
    /// Name of the event that triggered this execution, if any.
    pub event: Option<String>,
}

impl Origin {
    pub fn new(kind: OriginKind, activator: User, event: Option<String>) -> Self {
        let name = match (&event, kind) {
            (Some(event), _) => format!("Event: {event}"),
            (None, OriginKind::Direct) => format!("{}'s script", activator.name),
            (None, _) => activator.name.clone(),
        };
        Self {
            kind,
            name,
            activator,
            event,
        }
    }

    pub fn direct(activator: User) -> Self {
        Self::new(OriginKind::Direct, activator, None)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}
