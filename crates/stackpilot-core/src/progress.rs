//! Progress events
//!
//! Everything the orchestration loop, the engine driver and the recovery
//! engine want to tell the outside world goes through a `ProgressSink`.
//! The sink wraps an unbounded channel: sending never waits on the consumer,
//! so a slow UI cannot stall the engine's output pipes.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Stdout,
    Stderr,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Stdout => write!(f, "stdout"),
            Channel::Stderr => write!(f, "stderr"),
        }
    }
}

/// Action the engine reported for a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAction {
    Creating,
    Modifying,
    Destroying,
}

impl std::fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceAction::Creating => write!(f, "creating"),
            ResourceAction::Modifying => write!(f, "modifying"),
            ResourceAction::Destroying => write!(f, "destroying"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A deployment phase or recovery milestone
    Stage { name: String, text: String },

    /// A raw engine output line
    Stream { channel: Channel, text: String },

    /// The engine started working on a resource
    ResourceAction {
        resource: String,
        action: ResourceAction,
    },
}

impl ProgressEvent {
    pub fn stage(name: impl Into<String>, text: impl Into<String>) -> Self {
        ProgressEvent::Stage {
            name: name.into(),
            text: text.into(),
        }
    }

    pub fn stream(channel: Channel, text: impl Into<String>) -> Self {
        ProgressEvent::Stream {
            channel,
            text: text.into(),
        }
    }
}

impl std::fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressEvent::Stage { name, text } => write!(f, "[{}] {}", name, text),
            ProgressEvent::Stream { text, .. } => write!(f, "{}", text),
            ProgressEvent::ResourceAction { resource, action } => {
                write!(f, "{} {}", action, resource)
            }
        }
    }
}

/// Sending half of a progress channel. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    /// Create a sink and the receiver that consumes its events
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops every event
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Deliver an event. A closed receiver is not an error for the sender.
    pub fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn stage(&self, name: impl Into<String>, text: impl Into<String>) {
        self.send(ProgressEvent::stage(name, text));
    }
}
