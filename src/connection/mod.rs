//! Remote metadata endpoints: the datagram transport, ban state, request
//! spacing and the request helpers commands call through.

mod clock;
mod handler;
mod http;
mod signal;
mod throttle;
mod transport;
mod udp;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

pub use clock::{Clock, ManualClock, SystemClock};
pub use handler::{ConnectionHandler, HandlerState, Protocol};
pub use http::{HttpConnection, HttpFetcher, HttpResponse, ReqwestFetcher};
pub use signal::{classify_http_response, classify_udp_response, udp_status_code, ProtocolSignal};
pub use throttle::{RequestThrottle, ThrottlePolicy};
pub use transport::{
    decode_frame, DatagramChannel, ProtocolTransport, TransportError, UdpChannel,
    COMPRESSED_FRAME_MARKER, MAX_DATAGRAM_SIZE_BYTES, RECEIVE_TIMEOUT,
};
pub use udp::UdpConnection;

/// Failures raised by the request helpers. The handler itself never returns
/// these; it only records state.
#[derive(Debug)]
pub enum ConnectionError {
    Banned {
        protocol: Protocol,
        banned_at: Option<DateTime<Utc>>,
        cooldown: Duration,
    },
    Transport(TransportError),
    Http {
        url: String,
        message: String,
    },
    InvalidSession,
    Backoff {
        pause: Duration,
        message: String,
    },
    InvalidResponse {
        response: String,
    },
}

impl ConnectionError {
    pub fn is_banned(&self) -> bool {
        matches!(self, Self::Banned { .. })
    }

    pub(crate) fn banned(handler: &ConnectionHandler) -> Self {
        Self::Banned {
            protocol: handler.protocol(),
            banned_at: handler.banned_at(),
            cooldown: handler.cooldown(),
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Banned {
                protocol,
                banned_at,
                cooldown,
            } => match banned_at {
                Some(banned_at) => write!(
                    f,
                    "{} endpoint banned this client at {} (cooldown {}s)",
                    protocol.as_str(),
                    banned_at.to_rfc3339(),
                    cooldown.as_secs()
                ),
                None => write!(f, "{} endpoint banned this client", protocol.as_str()),
            },
            Self::Transport(source) => write!(f, "transport failure: {source}"),
            Self::Http { url, message } => write!(f, "HTTP request to '{url}' failed: {message}"),
            Self::InvalidSession => write!(f, "session is missing or was rejected by the remote"),
            Self::Backoff { pause, message } => write!(
                f,
                "remote asked to back off for {}s: {message}",
                pause.as_secs()
            ),
            Self::InvalidResponse { response } => {
                write!(f, "remote returned an unusable response: '{response}'")
            }
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(source) => Some(source),
            _ => None,
        }
    }
}

impl From<TransportError> for ConnectionError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}
