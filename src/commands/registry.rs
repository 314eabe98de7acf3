use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{
    CommandContext, CommandError, CommandRecord, CommandType, ConnectionRequirement, Executable,
};

pub type CommandFactory =
    Arc<dyn Fn(&str, &CommandContext) -> Result<Box<dyn Executable>, CommandError> + Send + Sync>;

/// A command type that knows its own tag and how to rebuild itself.
pub trait RegisteredCommand: Executable + Sized + 'static {
    const COMMAND_TYPE: &'static str;
    const REQUIREMENT: ConnectionRequirement;

    fn from_payload(payload: &str, context: &CommandContext) -> Result<Self, CommandError>;
}

#[derive(Debug)]
pub enum RegistryError {
    DuplicateCommandType {
        command_type: String,
    },
    UnknownCommandType {
        command_id: String,
        command_type: String,
    },
    Construction {
        command_id: String,
        command_type: String,
        source: CommandError,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateCommandType { command_type } => {
                write!(f, "command type '{command_type}' is already registered")
            }
            Self::UnknownCommandType {
                command_id,
                command_type,
            } => write!(
                f,
                "command '{command_id}' has unknown command type '{command_type}'"
            ),
            Self::Construction {
                command_id,
                command_type,
                source,
            } => write!(
                f,
                "failed to rebuild command '{command_id}' of type '{command_type}': {source}"
            ),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Construction { source, .. } => Some(source),
            _ => None,
        }
    }
}

struct RegistryEntry {
    requirement: ConnectionRequirement,
    factory: CommandFactory,
}

/// Explicit tag-to-factory table, filled once during startup and shared
/// read-only by all lanes afterwards.
pub struct CommandRegistry {
    context: CommandContext,
    entries: HashMap<CommandType, RegistryEntry>,
}

impl CommandRegistry {
    pub fn new(context: CommandContext) -> Self {
        Self {
            context,
            entries: HashMap::new(),
        }
    }

    pub fn context(&self) -> &CommandContext {
        &self.context
    }

    pub fn register<F>(
        &mut self,
        command_type: impl Into<CommandType>,
        requirement: ConnectionRequirement,
        factory: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&str, &CommandContext) -> Result<Box<dyn Executable>, CommandError>
            + Send
            + Sync
            + 'static,
    {
        let command_type = command_type.into();
        if self.entries.contains_key(&command_type) {
            return Err(RegistryError::DuplicateCommandType {
                command_type: command_type.to_string(),
            });
        }
        self.entries.insert(
            command_type,
            RegistryEntry {
                requirement,
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    pub fn register_command<C: RegisteredCommand>(&mut self) -> Result<(), RegistryError> {
        self.register(C::COMMAND_TYPE, C::REQUIREMENT, |payload, context| {
            let command = C::from_payload(payload, context)?;
            Ok(Box::new(command) as Box<dyn Executable>)
        })
    }

    pub fn requirement_of(&self, command_type: &CommandType) -> Option<ConnectionRequirement> {
        self.entries
            .get(command_type)
            .map(|entry| entry.requirement)
    }

    pub fn command_types(&self) -> Vec<&str> {
        let mut types = self
            .entries
            .keys()
            .map(CommandType::as_str)
            .collect::<Vec<_>>();
        types.sort_unstable();
        types
    }

    pub fn resolve(&self, record: &CommandRecord) -> Result<Box<dyn Executable>, RegistryError> {
        let Some(entry) = self.entries.get(&record.command_type) else {
            return Err(RegistryError::UnknownCommandType {
                command_id: record.command_id.clone(),
                command_type: record.command_type.to_string(),
            });
        };

        (entry.factory)(&record.payload, &self.context).map_err(|source| {
            RegistryError::Construction {
                command_id: record.command_id.clone(),
                command_type: record.command_type.to_string(),
                source,
            }
        })
    }
}
