use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::events::{ConnectionStateChange, ConnectionStateKind, EventEmitter, Notification};
use crate::logging::{LogLevel, Logger};

use super::clock::{elapsed_between, Clock};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Http,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Http => "http",
        }
    }

    pub fn ban_kind(self) -> ConnectionStateKind {
        match self {
            Self::Udp => ConnectionStateKind::UdpBan,
            Self::Http => ConnectionStateKind::HttpBan,
        }
    }

    fn log_context(self) -> &'static str {
        match self {
            Self::Udp => "connection::udp",
            Self::Http => "connection::http",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerState {
    Active,
    Banned,
}

#[derive(Debug, Default)]
struct BanState {
    banned_at: Option<DateTime<Utc>>,
}

/// Ban-aware view of one remote endpoint.
///
/// Bans are state, not errors: the handler records them, reports them through
/// the event emitter and lets them lapse once the cooldown has passed. It never
/// retries a request on its own.
pub struct ConnectionHandler {
    protocol: Protocol,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    emitter: Arc<EventEmitter>,
    logger: Arc<Logger>,
    ban: RwLock<BanState>,
}

impl ConnectionHandler {
    pub fn new(
        protocol: Protocol,
        cooldown: Duration,
        clock: Arc<dyn Clock>,
        emitter: Arc<EventEmitter>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            protocol,
            cooldown,
            clock,
            emitter,
            logger,
            ban: RwLock::new(BanState::default()),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Reports the current ban and lifts it once the cooldown has elapsed.
    pub fn is_banned(&self) -> bool {
        let banned_at = {
            let ban = self.ban.read().unwrap_or_else(PoisonError::into_inner);
            match ban.banned_at {
                Some(banned_at) => banned_at,
                None => return false,
            }
        };

        if elapsed_between(banned_at, self.clock.now()) < self.cooldown {
            return true;
        }

        if self.lift_ban("cooldown expired", Some(banned_at)) {
            return false;
        }
        // A newer ban replaced the expired one before it could be lifted.
        self.ban
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .banned_at
            .is_some()
    }

    pub fn banned_at(&self) -> Option<DateTime<Utc>> {
        if !self.is_banned() {
            return None;
        }
        self.ban
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .banned_at
    }

    pub fn state(&self) -> HandlerState {
        if self.is_banned() {
            HandlerState::Banned
        } else {
            HandlerState::Active
        }
    }

    pub fn on_ban_signal(&self) {
        let now = self.clock.now();
        let previous = self
            .ban
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .banned_at
            .replace(now);

        match previous {
            Some(banned_at) if elapsed_between(banned_at, now) < self.cooldown => {
                self.logger.warn(
                    Some(self.protocol.log_context()),
                    "Ban signal received while already banned; cooldown restarted",
                );
                return;
            }
            Some(banned_at) => self.announce_lift("cooldown expired", banned_at, now),
            None => {}
        }

        self.logger.log(
            LogLevel::Warn,
            Some(self.protocol.log_context()),
            "Remote endpoint banned this client",
            Some(json!({
                "protocol": self.protocol.as_str(),
                "banned_at": now.to_rfc3339(),
                "cooldown_s": self.cooldown.as_secs()
            })),
        );
        self.publish(ConnectionStateChange::new(self.protocol.ban_kind(), true, now));
    }

    /// Clears the ban explicitly. Returns `false` if no ban was active.
    pub fn on_ban_cleared(&self) -> bool {
        self.lift_ban("cleared by successful exchange", None)
    }

    pub fn on_invalid_session(&self) {
        self.logger.warn(
            Some(self.protocol.log_context()),
            "Remote rejected the session key",
        );
        self.publish(ConnectionStateChange::new(
            ConnectionStateKind::InvalidSession,
            true,
            self.clock.now(),
        ));
    }

    pub fn on_awaiting_response(&self, awaiting: bool) {
        self.publish(ConnectionStateChange::new(
            ConnectionStateKind::AwaitingResponse,
            awaiting,
            self.clock.now(),
        ));
    }

    pub fn on_overload_backoff(&self, pause: Duration, message: &str) {
        self.logger.log(
            LogLevel::Warn,
            Some(self.protocol.log_context()),
            "Remote asked the client to back off",
            Some(json!({ "pause_s": pause.as_secs(), "message": message })),
        );
        let mut change = ConnectionStateChange::new(
            ConnectionStateKind::OverloadBackoff,
            true,
            self.clock.now(),
        );
        change.pause_seconds = Some(pause.as_secs());
        change.message = Some(message.to_owned());
        self.publish(change);
    }

    /// Clears the stored ban. With `expected`, clears only if the stored
    /// timestamp still matches it.
    fn lift_ban(&self, reason: &str, expected: Option<DateTime<Utc>>) -> bool {
        let lifted = {
            let mut ban = self.ban.write().unwrap_or_else(PoisonError::into_inner);
            if expected.is_some_and(|expected| ban.banned_at != Some(expected)) {
                return false;
            }
            ban.banned_at.take()
        };
        let Some(banned_at) = lifted else {
            return false;
        };

        self.announce_lift(reason, banned_at, self.clock.now());
        true
    }

    fn announce_lift(&self, reason: &str, banned_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.logger.log(
            LogLevel::Info,
            Some(self.protocol.log_context()),
            "Ban lifted",
            Some(json!({
                "reason": reason,
                "banned_at": banned_at.to_rfc3339(),
                "banned_for_s": elapsed_between(banned_at, now).as_secs()
            })),
        );
        self.publish(ConnectionStateChange::new(
            self.protocol.ban_kind(),
            false,
            now,
        ));
    }

    fn publish(&self, change: ConnectionStateChange) {
        if let Err(error) = self
            .emitter
            .emit(Notification::ConnectionStateChanged(change))
        {
            self.logger.warn(
                Some(self.protocol.log_context()),
                &format!("connection state notification failed: {error}"),
            );
        }
    }
}
