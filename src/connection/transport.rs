//! Single-flight request/response exchange over an unreliable datagram channel.
//!
//! The remote service keys its session on the client's source address and port,
//! so the local port is fixed by configuration and every exchange goes through
//! one mutex shared by all callers.

use std::fmt;
use std::io::{self, Read};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use flate2::read::DeflateDecoder;
use serde_json::json;

use crate::logging::{LogLevel, Logger};

pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_DATAGRAM_SIZE_BYTES: usize = 1600;
pub const COMPRESSED_FRAME_MARKER: [u8; 2] = [0x00, 0x00];
const MAX_STRAY_DATAGRAMS_PER_DRAIN: usize = 16;
const LOG_CONTEXT: &str = "connection::transport";

#[derive(Debug)]
pub enum TransportError {
    Resolve { host: String, source: io::Error },
    NoAddress { host: String },
    Bind { address: SocketAddr, source: io::Error },
    Configure { source: io::Error },
    Send(io::Error),
    Receive(io::Error),
    ReceiveTimeout,
    EmptyResponse,
    Decompress(io::Error),
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve { host, source } => {
                write!(f, "failed to resolve remote host '{host}': {source}")
            }
            Self::NoAddress { host } => write!(f, "remote host '{host}' resolved to no address"),
            Self::Bind { address, source } => {
                write!(f, "failed to bind local datagram socket on {address}: {source}")
            }
            Self::Configure { source } => {
                write!(f, "failed to configure datagram socket: {source}")
            }
            Self::Send(source) => write!(f, "failed to send datagram: {source}"),
            Self::Receive(source) => write!(f, "failed to receive datagram: {source}"),
            Self::ReceiveTimeout => write!(
                f,
                "no response within {}s after one retry",
                RECEIVE_TIMEOUT.as_secs()
            ),
            Self::EmptyResponse => write!(f, "remote returned an empty response"),
            Self::Decompress(source) => {
                write!(f, "failed to inflate compressed response frame: {source}")
            }
            Self::Closed => write!(f, "transport is closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Minimal datagram socket surface the transport needs.
pub trait DatagramChannel: Send {
    fn send(&mut self, payload: &[u8]) -> io::Result<usize>;

    /// Blocks until a datagram arrives or the receive timeout elapses.
    fn recv(&mut self, buffer: &mut [u8]) -> io::Result<usize>;

    /// Returns an already-buffered datagram without blocking.
    fn try_recv(&mut self, buffer: &mut [u8]) -> io::Result<Option<usize>>;

    fn close(&mut self) -> io::Result<()>;
}

pub struct UdpChannel {
    socket: UdpSocket,
}

impl UdpChannel {
    pub fn connect(
        remote_host: &str,
        remote_port: u16,
        local_port: u16,
        receive_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let remote = (remote_host, remote_port)
            .to_socket_addrs()
            .map_err(|source| TransportError::Resolve {
                host: remote_host.to_owned(),
                source,
            })?
            .min_by_key(|address| address.is_ipv6())
            .ok_or_else(|| TransportError::NoAddress {
                host: remote_host.to_owned(),
            })?;

        let local: SocketAddr = if remote.is_ipv6() {
            SocketAddr::from(([0u16; 8], local_port))
        } else {
            SocketAddr::from(([0u8; 4], local_port))
        };
        let socket = UdpSocket::bind(local).map_err(|source| TransportError::Bind {
            address: local,
            source,
        })?;
        socket
            .set_read_timeout(Some(receive_timeout))
            .map_err(|source| TransportError::Configure { source })?;
        socket
            .connect(remote)
            .map_err(|source| TransportError::Configure { source })?;

        Ok(Self { socket })
    }
}

impl DatagramChannel for UdpChannel {
    fn send(&mut self, payload: &[u8]) -> io::Result<usize> {
        self.socket.send(payload)
    }

    fn recv(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buffer)
    }

    fn try_recv(&mut self, buffer: &mut [u8]) -> io::Result<Option<usize>> {
        self.socket.set_nonblocking(true)?;
        let result = match self.socket.recv(buffer) {
            Ok(size) => Ok(Some(size)),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(error),
        };
        self.socket.set_nonblocking(false)?;
        result
    }

    fn close(&mut self) -> io::Result<()> {
        match self.socket.take_error()? {
            Some(pending) => Err(pending),
            None => Ok(()),
        }
    }
}

pub struct ProtocolTransport {
    channel: Mutex<Option<Box<dyn DatagramChannel>>>,
    logger: Arc<Logger>,
}

impl ProtocolTransport {
    /// Binds the fixed local port and resolves the remote. A failure here needs
    /// operator attention; callers should not loop on it.
    pub fn connect(
        remote_host: &str,
        remote_port: u16,
        local_port: u16,
        logger: Arc<Logger>,
    ) -> Result<Self, TransportError> {
        let channel = UdpChannel::connect(remote_host, remote_port, local_port, RECEIVE_TIMEOUT)
            .inspect_err(|error| {
                logger.error(
                    Some(LOG_CONTEXT),
                    &format!("datagram transport setup failed: {error}"),
                );
            })?;
        logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Datagram transport connected",
            Some(json!({
                "remote_host": remote_host,
                "remote_port": remote_port,
                "local_port": local_port,
                "receive_timeout_s": RECEIVE_TIMEOUT.as_secs()
            })),
        );
        Ok(Self::with_channel(Box::new(channel), logger))
    }

    pub fn with_channel(channel: Box<dyn DatagramChannel>, logger: Arc<Logger>) -> Self {
        Self {
            channel: Mutex::new(Some(channel)),
            logger,
        }
    }

    pub fn is_open(&self) -> bool {
        self.channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Exchanges one request for one response. Holds the transport lock for the
    /// whole exchange, including the single retry after a receive timeout.
    pub fn send(&self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = guard.as_mut().ok_or(TransportError::Closed)?;

        let result = match self.exchange(channel.as_mut(), payload) {
            Err(TransportError::ReceiveTimeout) => {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    "receive timed out; resending request once",
                );
                self.exchange(channel.as_mut(), payload)
            }
            other => other,
        };

        if let Err(error) = &result {
            self.logger.error(
                Some(LOG_CONTEXT),
                &format!("datagram exchange failed: {error}"),
            );
        }
        result
    }

    pub fn close(&self) {
        let taken = self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut channel) = taken else {
            return;
        };
        match channel.close() {
            Ok(()) => self.logger.info(Some(LOG_CONTEXT), "Datagram transport closed"),
            Err(error) => self.logger.warn(
                Some(LOG_CONTEXT),
                &format!("error while closing datagram transport: {error}"),
            ),
        }
    }

    fn exchange(
        &self,
        channel: &mut dyn DatagramChannel,
        payload: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        self.drain_stray(channel);
        channel.send(payload).map_err(TransportError::Send)?;

        let mut buffer = [0u8; MAX_DATAGRAM_SIZE_BYTES];
        let size = channel.recv(&mut buffer).map_err(|error| match error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::ReceiveTimeout,
            _ => TransportError::Receive(error),
        })?;

        let response = decode_frame(&buffer[..size])?;
        self.drain_stray(channel);
        if response.is_empty() {
            return Err(TransportError::EmptyResponse);
        }
        Ok(response)
    }

    fn drain_stray(&self, channel: &mut dyn DatagramChannel) {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE_BYTES];
        for _ in 0..MAX_STRAY_DATAGRAMS_PER_DRAIN {
            match channel.try_recv(&mut buffer) {
                Ok(Some(size)) => {
                    let preview = String::from_utf8_lossy(&buffer[..size.min(64)]).into_owned();
                    self.logger.log(
                        LogLevel::Warn,
                        Some(LOG_CONTEXT),
                        "Discarding unexpected buffered datagram",
                        Some(json!({ "size_bytes": size, "preview": preview })),
                    );
                }
                Ok(None) => return,
                Err(error) => {
                    self.logger.debug(
                        Some(LOG_CONTEXT),
                        &format!("stray datagram drain stopped: {error}"),
                    );
                    return;
                }
            }
        }
    }
}

/// Inflates a frame that starts with the two-byte compression marker; any
/// other frame is returned as is.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<u8>, TransportError> {
    let Some(compressed) = frame.strip_prefix(&COMPRESSED_FRAME_MARKER[..]) else {
        return Ok(frame.to_vec());
    };

    let mut inflated = Vec::with_capacity(compressed.len() * 4);
    DeflateDecoder::new(compressed)
        .read_to_end(&mut inflated)
        .map_err(TransportError::Decompress)?;
    inflated.shrink_to_fit();
    Ok(inflated)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use flate2::write::DeflateEncoder;
    use flate2::Compression;

    use crate::logging::tests::memory_logger;
    use crate::logging::{LogLevel, Logger};

    use super::{decode_frame, DatagramChannel, ProtocolTransport, TransportError};

    #[derive(Default)]
    pub(crate) struct ScriptLog {
        pub(crate) sent: Vec<Vec<u8>>,
        pub(crate) sent_at: Vec<Instant>,
        /// Sends issued while an earlier send still waited for its reply.
        pub(crate) overlapping_sends: usize,
        pub(crate) awaiting_reply: bool,
        pub(crate) receives: usize,
        pub(crate) closed: bool,
    }

    /// Channel whose receive results are scripted up front.
    pub(crate) struct ScriptedChannel {
        pub(crate) replies: VecDeque<io::Result<Vec<u8>>>,
        pub(crate) stray: VecDeque<Vec<u8>>,
        pub(crate) reply_delay: Duration,
        pub(crate) log: Arc<Mutex<ScriptLog>>,
    }

    impl ScriptedChannel {
        pub(crate) fn new(replies: Vec<io::Result<Vec<u8>>>) -> (Self, Arc<Mutex<ScriptLog>>) {
            let log = Arc::new(Mutex::new(ScriptLog::default()));
            (
                Self {
                    replies: replies.into(),
                    stray: VecDeque::new(),
                    reply_delay: Duration::ZERO,
                    log: Arc::clone(&log),
                },
                log,
            )
        }
    }

    impl DatagramChannel for ScriptedChannel {
        fn send(&mut self, payload: &[u8]) -> io::Result<usize> {
            let mut log = self.log.lock().expect("script log poisoned");
            log.sent.push(payload.to_vec());
            log.sent_at.push(Instant::now());
            if log.awaiting_reply {
                log.overlapping_sends += 1;
            }
            log.awaiting_reply = true;
            Ok(payload.len())
        }

        fn recv(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
            if !self.reply_delay.is_zero() {
                thread::sleep(self.reply_delay);
            }
            {
                let mut log = self.log.lock().expect("script log poisoned");
                log.receives += 1;
                log.awaiting_reply = false;
            }
            let reply = self
                .replies
                .pop_front()
                .unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::WouldBlock, "script exhausted")))?;
            buffer[..reply.len()].copy_from_slice(&reply);
            Ok(reply.len())
        }

        fn try_recv(&mut self, buffer: &mut [u8]) -> io::Result<Option<usize>> {
            Ok(self.stray.pop_front().map(|datagram| {
                buffer[..datagram.len()].copy_from_slice(&datagram);
                datagram.len()
            }))
        }

        fn close(&mut self) -> io::Result<()> {
            self.log.lock().expect("script log poisoned").closed = true;
            Ok(())
        }
    }

    pub(crate) fn timeout() -> io::Result<Vec<u8>> {
        Err(io::Error::new(io::ErrorKind::WouldBlock, "timed out"))
    }

    fn deflate(raw: &[u8]) -> Vec<u8> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw).expect("deflate write should work");
        encoder.finish().expect("deflate finish should work")
    }

    fn transport(channel: ScriptedChannel) -> ProtocolTransport {
        ProtocolTransport::with_channel(Box::new(channel), Arc::new(Logger::silent()))
    }

    #[test]
    fn plain_response_is_returned_unchanged() {
        let (channel, log) = ScriptedChannel::new(vec![Ok(b"300 PONG\n".to_vec())]);
        let transport = transport(channel);

        let response = transport.send(b"PING").expect("exchange should work");
        assert_eq!(response, b"300 PONG\n");

        let log = log.lock().expect("script log poisoned");
        assert_eq!(log.sent, vec![b"PING".to_vec()]);
        assert_eq!(log.receives, 1);
    }

    #[test]
    fn compressed_frame_is_inflated_exactly() {
        let body = "230 ANIME\n1|2002|TV Series|".repeat(20);
        let mut frame = vec![0x00, 0x00];
        frame.extend_from_slice(&deflate(body.as_bytes()));
        let (channel, _log) = ScriptedChannel::new(vec![Ok(frame)]);

        let response = transport(channel).send(b"ANIME aid=1").expect("exchange should work");
        assert_eq!(response, body.as_bytes());
        assert_eq!(response.len(), body.len());
    }

    #[test]
    fn corrupt_compressed_frame_is_a_transport_failure() {
        let (channel, _log) =
            ScriptedChannel::new(vec![Ok(vec![0x00, 0x00, 0xff, 0xfe, 0xfd, 0xfc])]);

        let error = transport(channel).send(b"ANIME aid=1").expect_err("inflate should fail");
        assert!(matches!(error, TransportError::Decompress(_)));
    }

    #[test]
    fn retries_exactly_once_after_timeout() {
        let (channel, log) = ScriptedChannel::new(vec![
            timeout(),
            Ok(b"300 PONG".to_vec()),
            Ok(b"never read".to_vec()),
        ]);

        let response = transport(channel).send(b"PING").expect("retry should succeed");
        assert_eq!(response, b"300 PONG");

        let log = log.lock().expect("script log poisoned");
        assert_eq!(log.receives, 2);
        assert_eq!(log.sent.len(), 2);
    }

    #[test]
    fn two_timeouts_surface_an_error() {
        let (channel, log) = ScriptedChannel::new(vec![
            timeout(),
            timeout(),
            Ok(b"too late".to_vec()),
        ]);

        let error = transport(channel).send(b"PING").expect_err("second timeout should fail");
        assert!(matches!(error, TransportError::ReceiveTimeout));
        assert_eq!(log.lock().expect("script log poisoned").receives, 2);
    }

    #[test]
    fn non_timeout_receive_error_is_not_retried() {
        let (channel, log) = ScriptedChannel::new(vec![
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
            Ok(b"300 PONG".to_vec()),
        ]);

        let error = transport(channel).send(b"PING").expect_err("refused should fail");
        assert!(matches!(error, TransportError::Receive(_)));
        assert_eq!(log.lock().expect("script log poisoned").receives, 1);
    }

    #[test]
    fn stray_datagrams_are_drained_and_logged() {
        let (mut channel, _log) = ScriptedChannel::new(vec![Ok(b"300 PONG".to_vec())]);
        channel.stray.push_back(b"200 LOGIN ACCEPTED late".to_vec());
        let (logger, sink) = memory_logger(LogLevel::Warn);
        let transport = ProtocolTransport::with_channel(Box::new(channel), logger);

        let response = transport.send(b"PING").expect("exchange should work");
        assert_eq!(response, b"300 PONG");
        let lines = sink.snapshot();
        assert!(lines
            .iter()
            .any(|line| line.contains("Discarding unexpected buffered datagram")));
    }

    #[test]
    fn closed_transport_rejects_sends() {
        let (channel, log) = ScriptedChannel::new(vec![Ok(b"300 PONG".to_vec())]);
        let transport = transport(channel);

        transport.close();
        transport.close();
        assert!(!transport.is_open());
        assert!(log.lock().expect("script log poisoned").closed);
        assert!(matches!(transport.send(b"PING"), Err(TransportError::Closed)));
    }

    #[test]
    fn compressed_empty_body_is_an_empty_response() {
        let mut frame = vec![0x00, 0x00];
        frame.extend_from_slice(&deflate(b""));
        let (channel, _log) = ScriptedChannel::new(vec![Ok(frame)]);
        assert!(matches!(
            transport(channel).send(b"PING"),
            Err(TransportError::EmptyResponse)
        ));
    }

    #[test]
    fn frames_without_marker_pass_through_decode() {
        assert_eq!(decode_frame(b"\x00A").expect("plain frame"), b"\x00A".to_vec());
        assert_eq!(decode_frame(b"").expect("empty frame"), Vec::<u8>::new());
    }

    #[test]
    fn concurrent_senders_never_overlap_on_the_channel() {
        let (mut channel, log) = ScriptedChannel::new(vec![
            Ok(b"300 PONG general".to_vec()),
            Ok(b"300 PONG hashing".to_vec()),
            Ok(b"300 PONG image".to_vec()),
        ]);
        channel.reply_delay = Duration::from_millis(30);
        let transport = Arc::new(transport(channel));

        let senders = ["general", "hashing", "image"]
            .into_iter()
            .map(|lane| {
                let transport = Arc::clone(&transport);
                thread::spawn(move || transport.send(format!("PING {lane}").as_bytes()))
            })
            .collect::<Vec<_>>();
        for sender in senders {
            sender
                .join()
                .expect("sender thread should not panic")
                .expect("exchange should work");
        }

        let log = log.lock().expect("script log poisoned");
        assert_eq!(log.sent.len(), 3);
        assert_eq!(log.receives, 3);
        assert_eq!(log.overlapping_sends, 0);
    }
}
