use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod catalog;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProbeCommand {
    Ping,
    Ping6,
    Host,
    Traceroute4,
    Traceroute6,
}

impl ProbeCommand {
    pub const ALL: [ProbeCommand; 5] = [
        ProbeCommand::Ping,
        ProbeCommand::Ping6,
        ProbeCommand::Host,
        ProbeCommand::Traceroute4,
        ProbeCommand::Traceroute6,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProbeCommand::Ping => "ping",
            ProbeCommand::Ping6 => "ping6",
            ProbeCommand::Host => "host",
            ProbeCommand::Traceroute4 => "traceroute4",
            ProbeCommand::Traceroute6 => "traceroute6",
        }
    }
}

impl fmt::Display for ProbeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown command {}", self.0)
    }
}

impl std::error::Error for UnknownCommand {}

impl FromStr for ProbeCommand {
    type Err = UnknownCommand;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ProbeCommand::ALL
            .into_iter()
            .find(|command| command.as_str() == value)
            .ok_or_else(|| UnknownCommand(value.to_string()))
    }
}

/// Client to server frame.
///
/// `command` stays a plain string on the wire so an unrecognised command can
/// still be answered with an `ERROR` for its id instead of failing the frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Execute {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        id: String,
    },
}

impl ClientMessage {
    pub fn execute(id: impl Into<String>, command: ProbeCommand, target: impl Into<String>) -> Self {
        ClientMessage::Execute {
            command: command.as_str().to_string(),
            args: vec![target.into()],
            id: id.into(),
        }
    }
}

/// Server to client frame. Every execution id receives zero or more `Line`
/// frames followed by exactly one terminal frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Line { id: String, text: String },
    Eof { id: String },
    Error { id: String },
    RateLimited { id: String },
}

impl ServerMessage {
    pub fn line(id: impl Into<String>, text: impl Into<String>) -> Self {
        ServerMessage::Line {
            id: id.into(),
            text: text.into(),
        }
    }

    pub fn eof(id: impl Into<String>) -> Self {
        ServerMessage::Eof { id: id.into() }
    }

    pub fn error(id: impl Into<String>) -> Self {
        ServerMessage::Error { id: id.into() }
    }

    pub fn rate_limited(id: impl Into<String>) -> Self {
        ServerMessage::RateLimited { id: id.into() }
    }

    pub fn id(&self) -> &str {
        match self {
            ServerMessage::Line { id, .. }
            | ServerMessage::Eof { id }
            | ServerMessage::Error { id }
            | ServerMessage::RateLimited { id } => id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ServerMessage::Line { .. })
    }
}
