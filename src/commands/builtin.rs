use std::sync::Arc;

use serde::Deserialize;

use crate::connection::{udp_status_code, UdpConnection};
use crate::logging::Logger;

use super::{
    decode_payload, CommandContext, CommandError, CommandRegistry, ConnectionRequirement,
    Executable, RegisteredCommand, RegistryError,
};

const PONG: u16 = 300;

/// Round-trips `PING` over the UDP API.
pub struct PingCommand {
    udp: Arc<UdpConnection>,
}

impl Executable for PingCommand {
    fn execute(&mut self) -> Result<(), CommandError> {
        let reply = self.udp.request("PING")?;
        match udp_status_code(&reply) {
            Some(PONG) => Ok(()),
            _ => Err(CommandError::failed(format!(
                "unexpected PING reply: '{}'",
                reply.trim()
            ))),
        }
    }

    fn describe(&self) -> String {
        "Pinging metadata service".to_owned()
    }
}

impl RegisteredCommand for PingCommand {
    const COMMAND_TYPE: &'static str = "connection.ping";
    const REQUIREMENT: ConnectionRequirement = ConnectionRequirement::Udp;

    fn from_payload(_payload: &str, context: &CommandContext) -> Result<Self, CommandError> {
        Ok(Self {
            udp: context.require_udp()?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct NoopPayload {
    #[serde(default)]
    label: Option<String>,
}

/// Does nothing except log its label.
pub struct NoopCommand {
    label: String,
    logger: Arc<Logger>,
}

impl Executable for NoopCommand {
    fn execute(&mut self) -> Result<(), CommandError> {
        self.logger
            .debug(Some("commands::noop"), &format!("noop '{}' executed", self.label));
        Ok(())
    }

    fn describe(&self) -> String {
        format!("No-op: {}", self.label)
    }
}

impl RegisteredCommand for NoopCommand {
    const COMMAND_TYPE: &'static str = "queue.noop";
    const REQUIREMENT: ConnectionRequirement = ConnectionRequirement::None;

    fn from_payload(payload: &str, context: &CommandContext) -> Result<Self, CommandError> {
        let payload: Option<NoopPayload> = decode_payload(Self::COMMAND_TYPE, payload)?;
        let label = payload
            .unwrap_or_default()
            .label
            .unwrap_or_else(|| "unnamed".to_owned());
        Ok(Self {
            label,
            logger: Arc::clone(&context.logger),
        })
    }
}

/// Registers every command shipped with the crate. Hosts add their own
/// commands to the same registry afterwards.
pub fn register_builtin_commands(registry: &mut CommandRegistry) -> Result<(), RegistryError> {
    registry.register_command::<PingCommand>()?;
    registry.register_command::<NoopCommand>()?;
    Ok(())
}
