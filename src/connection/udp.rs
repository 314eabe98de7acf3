use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;

use crate::config::UdpConfig;
use crate::events::EventEmitter;
use crate::logging::{LogLevel, Logger};

use super::{
    classify_udp_response, Clock, ConnectionError, ConnectionHandler, Protocol, ProtocolSignal,
    ProtocolTransport, RequestThrottle, ThrottlePolicy,
};

const LOG_CONTEXT: &str = "connection::udp";
const MIN_RESPONSE_LEN: usize = 3;

/// Session-bearing request helper over the UDP API.
///
/// A request while banned fails fast with [`ConnectionError::Banned`] instead
/// of touching the network.
pub struct UdpConnection {
    handler: Arc<ConnectionHandler>,
    transport: ProtocolTransport,
    throttle: RequestThrottle,
    /// Spans the throttle claim and the exchange so request spacing holds
    /// across lanes.
    in_flight: Mutex<()>,
    session: Mutex<Option<String>>,
    logger: Arc<Logger>,
}

impl UdpConnection {
    pub fn new(
        handler: Arc<ConnectionHandler>,
        transport: ProtocolTransport,
        throttle: RequestThrottle,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            handler,
            transport,
            throttle,
            in_flight: Mutex::new(()),
            session: Mutex::new(None),
            logger,
        }
    }

    pub fn from_config(
        config: &UdpConfig,
        clock: Arc<dyn Clock>,
        emitter: Arc<EventEmitter>,
        logger: Arc<Logger>,
    ) -> Result<Self, ConnectionError> {
        let transport = ProtocolTransport::connect(
            &config.remote_host,
            config.remote_port,
            config.local_port,
            Arc::clone(&logger),
        )?;
        let handler = Arc::new(ConnectionHandler::new(
            Protocol::Udp,
            Duration::from_secs(config.ban_cooldown_minutes * 60),
            Arc::clone(&clock),
            emitter,
            Arc::clone(&logger),
        ));
        let throttle = RequestThrottle::new(ThrottlePolicy::from_udp_config(config), clock);
        Ok(Self::new(handler, transport, throttle, logger))
    }

    pub fn handler(&self) -> &Arc<ConnectionHandler> {
        &self.handler
    }

    pub fn session(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_session(&self, session_key: impl Into<String>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session_key.into());
    }

    pub fn clear_session(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    /// Sends one API command and returns the reply text when the reply carries
    /// no ban, session or backoff signal.
    pub fn request(&self, command: &str) -> Result<String, ConnectionError> {
        if self.handler.is_banned() {
            return Err(ConnectionError::banned(&self.handler));
        }
        self.exchange(command)
    }

    /// Sends an authenticated command even while banned. A reply that passes
    /// classification proves the client is trusted again and clears the ban.
    pub fn probe(&self, command: &str) -> Result<String, ConnectionError> {
        let response = self.exchange(&self.with_session(command)?)?;
        if self.handler.on_ban_cleared() {
            self.logger.info(Some(LOG_CONTEXT), "Ban cleared by authenticated probe");
        }
        Ok(response)
    }

    /// Like [`request`](Self::request) but appends the session key.
    pub fn request_with_session(&self, command: &str) -> Result<String, ConnectionError> {
        self.request(&self.with_session(command)?)
    }

    pub fn close(&self) {
        self.transport.close();
    }

    fn with_session(&self, command: &str) -> Result<String, ConnectionError> {
        let Some(session_key) = self.session() else {
            return Err(ConnectionError::InvalidSession);
        };
        let separator = if command.contains(' ') { '&' } else { ' ' };
        Ok(format!("{command}{separator}s={session_key}"))
    }

    fn exchange(&self, command: &str) -> Result<String, ConnectionError> {
        let guard = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let waited = self.throttle.wait_turn();
        self.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "Sending UDP request",
            Some(json!({
                "command": command_name(command),
                "throttled_ms": waited.as_millis() as u64
            })),
        );

        self.handler.on_awaiting_response(true);
        let result = self.transport.send(command.as_bytes());
        self.handler.on_awaiting_response(false);
        drop(guard);

        let response = String::from_utf8_lossy(&result?).into_owned();
        if response.trim_end().len() < MIN_RESPONSE_LEN {
            return Err(ConnectionError::InvalidResponse { response });
        }

        match classify_udp_response(&response) {
            ProtocolSignal::Ok => Ok(response),
            ProtocolSignal::Banned { reason } => {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("ban reported for '{}': {reason}", command_name(command)),
                );
                self.handler.on_ban_signal();
                Err(ConnectionError::banned(&self.handler))
            }
            ProtocolSignal::InvalidSession => {
                self.clear_session();
                self.handler.on_invalid_session();
                Err(ConnectionError::InvalidSession)
            }
            ProtocolSignal::Backoff { pause, message } => {
                self.handler.on_overload_backoff(pause, &message);
                Err(ConnectionError::Backoff { pause, message })
            }
        }
    }
}

fn command_name(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or(command)
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use crate::connection::transport::tests::{timeout, ScriptLog, ScriptedChannel};
    use crate::connection::{
        ConnectionError, ConnectionHandler, ManualClock, Protocol, ProtocolTransport,
        RequestThrottle, SystemClock, ThrottlePolicy,
    };
    use crate::events::tests::recording_emitter;
    use crate::events::{ConnectionStateKind, Notification};
    use crate::logging::Logger;

    use super::UdpConnection;

    fn connection(
        replies: Vec<io::Result<Vec<u8>>>,
    ) -> (
        UdpConnection,
        Arc<Mutex<ScriptLog>>,
        Arc<Mutex<Vec<Notification>>>,
    ) {
        let clock = Arc::new(ManualClock::default());
        let (emitter, seen) = recording_emitter();
        let logger = Arc::new(Logger::silent());
        let handler = Arc::new(ConnectionHandler::new(
            Protocol::Udp,
            Duration::from_secs(90 * 60),
            clock.clone(),
            emitter,
            Arc::clone(&logger),
        ));
        let (channel, log) = ScriptedChannel::new(replies);
        let transport = ProtocolTransport::with_channel(Box::new(channel), Arc::clone(&logger));
        let throttle = RequestThrottle::new(ThrottlePolicy::flat(Duration::ZERO), clock);
        (UdpConnection::new(handler, transport, throttle, logger), log, seen)
    }

    #[test]
    fn successful_request_returns_reply_and_toggles_awaiting() {
        let (connection, log, seen) = connection(vec![Ok(b"300 PONG\n".to_vec())]);

        let reply = connection.request("PING").expect("ping should work");
        assert_eq!(reply, "300 PONG\n");
        assert_eq!(log.lock().expect("script log poisoned").sent, vec![b"PING".to_vec()]);

        let awaiting = seen
            .lock()
            .expect("recording mutex poisoned")
            .iter()
            .filter_map(|notification| match notification {
                Notification::ConnectionStateChanged(change)
                    if change.kind == ConnectionStateKind::AwaitingResponse =>
                {
                    Some(change.value)
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(awaiting, vec![true, false]);
    }

    #[test]
    fn ban_reply_sets_state_and_short_circuits_later_requests() {
        let (connection, log, _seen) = connection(vec![
            Ok(b"555 BANNED\nflooding".to_vec()),
            Ok(b"300 PONG".to_vec()),
        ]);

        let error = connection.request("PING").expect_err("ban should fail");
        assert!(error.is_banned());
        assert!(connection.handler().is_banned());

        let error = connection.request("PING").expect_err("banned client should fail fast");
        assert!(matches!(
            error,
            ConnectionError::Banned {
                protocol: Protocol::Udp,
                banned_at: Some(_),
                ..
            }
        ));
        assert_eq!(log.lock().expect("script log poisoned").sent.len(), 1);
    }

    #[test]
    fn invalid_session_reply_clears_session_key() {
        let (connection, log, _seen) = connection(vec![Ok(b"506 INVALID SESSION".to_vec())]);
        connection.set_session("abc12");

        let error = connection
            .request_with_session("ANIME aid=1")
            .expect_err("invalid session should fail");
        assert!(matches!(error, ConnectionError::InvalidSession));
        assert_eq!(connection.session(), None);
        assert_eq!(
            log.lock().expect("script log poisoned").sent,
            vec![b"ANIME aid=1&s=abc12".to_vec()]
        );
    }

    #[test]
    fn session_request_without_key_never_hits_network() {
        let (connection, log, _seen) = connection(vec![Ok(b"300 PONG".to_vec())]);

        let error = connection
            .request_with_session("UPTIME")
            .expect_err("missing session should fail");
        assert!(matches!(error, ConnectionError::InvalidSession));
        assert!(log.lock().expect("script log poisoned").sent.is_empty());
    }

    #[test]
    fn authenticated_probe_clears_recorded_ban() {
        let (connection, log, seen) = connection(vec![Ok(b"208 UPTIME\n12345".to_vec())]);
        connection.set_session("key");
        connection.handler().on_ban_signal();
        assert!(connection.request_with_session("UPTIME").is_err());

        let reply = connection.probe("UPTIME").expect("probe should work");
        assert!(!connection.handler().is_banned());
        assert!(reply.starts_with("208"));
        assert_eq!(
            log.lock().expect("script log poisoned").sent,
            vec![b"UPTIME s=key".to_vec()]
        );
        let bans = seen
            .lock()
            .expect("recording mutex poisoned")
            .iter()
            .filter_map(|notification| match notification {
                Notification::ConnectionStateChanged(change)
                    if change.kind == ConnectionStateKind::UdpBan =>
                {
                    Some(change.value)
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(bans, vec![true, false]);
    }

    #[test]
    fn backoff_reply_is_reported_with_pause() {
        let (connection, _log, seen) = connection(vec![Ok(b"602 SERVER BUSY".to_vec())]);

        let error = connection.request("PING").expect_err("busy should fail");
        assert!(matches!(
            error,
            ConnectionError::Backoff { pause, .. } if pause == Duration::from_secs(300)
        ));
        assert!(seen
            .lock()
            .expect("recording mutex poisoned")
            .iter()
            .any(|notification| matches!(
                notification,
                Notification::ConnectionStateChanged(change)
                    if change.kind == ConnectionStateKind::OverloadBackoff
                        && change.pause_seconds == Some(300)
            )));
    }

    #[test]
    fn transport_failure_and_short_reply_are_errors() {
        let (connection, _log, _seen) = connection(vec![timeout(), timeout(), Ok(b"3".to_vec())]);
        assert!(matches!(
            connection.request("PING"),
            Err(ConnectionError::Transport(_))
        ));
        assert!(matches!(
            connection.request("PING"),
            Err(ConnectionError::InvalidResponse { .. })
        ));
        assert!(!connection.handler().is_banned());
    }

    #[test]
    fn concurrent_requests_keep_throttle_spacing() {
        let clock = Arc::new(SystemClock);
        let logger = Arc::new(Logger::silent());
        let (emitter, _seen) = recording_emitter();
        let handler = Arc::new(ConnectionHandler::new(
            Protocol::Udp,
            Duration::from_secs(90 * 60),
            clock.clone(),
            emitter,
            Arc::clone(&logger),
        ));
        let (channel, log) = ScriptedChannel::new(vec![
            Ok(b"300 PONG".to_vec()),
            Ok(b"300 PONG".to_vec()),
            Ok(b"300 PONG".to_vec()),
        ]);
        let transport = ProtocolTransport::with_channel(Box::new(channel), Arc::clone(&logger));
        let throttle =
            RequestThrottle::new(ThrottlePolicy::flat(Duration::from_millis(150)), clock);
        let connection = Arc::new(UdpConnection::new(handler, transport, throttle, logger));

        connection.request("PING").expect("first ping should work");
        let lanes = (0..2)
            .map(|_| {
                let connection = Arc::clone(&connection);
                thread::spawn(move || connection.request("PING"))
            })
            .collect::<Vec<_>>();
        for lane in lanes {
            lane.join()
                .expect("request thread should not panic")
                .expect("ping should work");
        }

        let log = log.lock().expect("script log poisoned");
        assert_eq!(log.sent_at.len(), 3);
        for pair in log.sent_at.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_millis(140));
        }
    }
}
