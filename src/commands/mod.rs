mod builtin;
mod record;
mod registry;

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::connection::{ConnectionError, HttpConnection, Protocol, UdpConnection};
use crate::logging::Logger;

pub use builtin::{register_builtin_commands, NoopCommand, PingCommand};
pub use record::{CommandRecord, CommandType, Priority, DEFAULT_PRIORITY};
pub use registry::{CommandFactory, CommandRegistry, RegisteredCommand, RegistryError};

/// A command rebuilt from its record and ready to run on a lane worker.
pub trait Executable: Send {
    fn execute(&mut self) -> Result<(), CommandError>;

    /// Human-readable label shown as the lane's current description.
    fn describe(&self) -> String;
}

/// Remote endpoint a command talks to. Lanes hold such commands back while
/// the endpoint is banned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionRequirement {
    None,
    Udp,
    Http,
}

impl ConnectionRequirement {
    pub fn protocol(self) -> Option<Protocol> {
        match self {
            Self::None => None,
            Self::Udp => Some(Protocol::Udp),
            Self::Http => Some(Protocol::Http),
        }
    }
}

/// Shared collaborators handed to every command factory.
#[derive(Clone)]
pub struct CommandContext {
    pub logger: Arc<Logger>,
    pub udp: Option<Arc<UdpConnection>>,
    pub http: Option<Arc<HttpConnection>>,
}

impl CommandContext {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self {
            logger,
            udp: None,
            http: None,
        }
    }

    pub fn with_udp(mut self, udp: Arc<UdpConnection>) -> Self {
        self.udp = Some(udp);
        self
    }

    pub fn with_http(mut self, http: Arc<HttpConnection>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn require_udp(&self) -> Result<Arc<UdpConnection>, CommandError> {
        self.udp
            .clone()
            .ok_or(CommandError::MissingConnection {
                protocol: Protocol::Udp,
            })
    }

    pub fn require_http(&self) -> Result<Arc<HttpConnection>, CommandError> {
        self.http
            .clone()
            .ok_or(CommandError::MissingConnection {
                protocol: Protocol::Http,
            })
    }
}

#[derive(Debug)]
pub enum CommandError {
    InvalidPayload {
        command_type: String,
        source: serde_json::Error,
    },
    MissingConnection {
        protocol: Protocol,
    },
    Connection(ConnectionError),
    Failed {
        message: String,
    },
}

impl CommandError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPayload {
                command_type,
                source,
            } => write!(f, "invalid payload for '{command_type}': {source}"),
            Self::MissingConnection { protocol } => write!(
                f,
                "command needs the {} connection but it is not configured",
                protocol.as_str()
            ),
            Self::Connection(source) => write!(f, "{source}"),
            Self::Failed { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidPayload { source, .. } => Some(source),
            Self::Connection(source) => Some(source),
            _ => None,
        }
    }
}

impl From<ConnectionError> for CommandError {
    fn from(value: ConnectionError) -> Self {
        Self::Connection(value)
    }
}

/// Decodes a JSON payload; an empty payload decodes as `null`.
pub fn decode_payload<T: DeserializeOwned>(
    command_type: &str,
    payload: &str,
) -> Result<T, CommandError> {
    let raw = if payload.trim().is_empty() {
        "null"
    } else {
        payload
    };
    serde_json::from_str(raw).map_err(|source| CommandError::InvalidPayload {
        command_type: command_type.to_owned(),
        source,
    })
}
