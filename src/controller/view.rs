//! What the panel should show. The controller only describes views; drawing
//! them is up to whoever consumes the events.

use serde::Serialize;

use crate::api::models::{Direction, Instance, Message, PairingCode, Status, StatusClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingView {
    Loading { message: String, detail: Option<String> },
    Code(PairingCode),
    Paired(String),
    TimedOut,
    Error(String),
}

impl PairingView {
    pub fn loading(message: &str, detail: Option<String>) -> Self {
        Self::Loading { message: message.to_string(), detail }
    }

    /// Views after which the current attempt will not change on its own.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Paired(_) | Self::TimedOut | Self::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceCard {
    pub instance_key: String,
    pub phone_number: String,
    pub status: Status,
    pub class: StatusClass,
    pub selected: bool,
}

impl InstanceCard {
    pub fn new(instance: &Instance, selected: Option<&str>) -> Self {
        Self {
            instance_key: instance.instance_key.clone(),
            phone_number: instance.phone_number.clone(),
            status: instance.status.clone(),
            class: instance.status.display_class(),
            selected: selected == Some(instance.instance_key.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageView {
    pub direction: Direction,
    pub counterparty: String,
    pub body: String,
    pub time: String,
}

impl MessageView {
    pub fn new(message: &Message, direction: Direction) -> Self {
        Self {
            direction,
            counterparty: message.counterparty().to_string(),
            body: message.body().to_string(),
            time: message.local_time().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Media,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Notify { level: Level, message: String },
    Pairing(PairingView),
    StatusIndicator(Status),
    Instances(Vec<InstanceCard>),
    Selected { instance_key: String, phone_number: String, status: Status },
    Config { api_key: String, base_url: String },
    /// The composer for `kind` was sent and can be emptied.
    ComposerCleared(MessageKind),
    Messages { direction: Direction, items: Vec<MessageView> },
}

impl UiEvent {
    pub fn notify(level: Level, message: impl Into<String>) -> Self {
        Self::Notify { level, message: message.into() }
    }
}
