use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;

use crate::config::HttpConfig;
use crate::events::EventEmitter;
use crate::logging::{LogLevel, Logger};

use super::{
    classify_http_response, Clock, ConnectionError, ConnectionHandler, Protocol, ProtocolSignal,
    RequestThrottle, ThrottlePolicy,
};

const LOG_CONTEXT: &str = "connection::http";
const USER_AGENT: &str = concat!("mediaqueue/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Blocking GET seam so the connection can be driven without a network.
pub trait HttpFetcher: Send + Sync {
    fn get(&self, url: &str) -> Result<HttpResponse, String>;
}

pub struct ReqwestFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, ConnectionError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|error| ConnectionError::Http {
                url: String::new(),
                message: format!("failed to create HTTP client: {error}"),
            })?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestFetcher {
    fn get(&self, url: &str) -> Result<HttpResponse, String> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|error| format!("request failed: {error}"))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|error| format!("failed to read response body: {error}"))?;
        Ok(HttpResponse { status, body })
    }
}

/// Request helper over the HTTP API. Shares ban semantics with the UDP side
/// but keeps its own ban state and cooldown.
pub struct HttpConnection {
    handler: Arc<ConnectionHandler>,
    fetcher: Box<dyn HttpFetcher>,
    throttle: RequestThrottle,
    base_url: String,
    in_flight: Mutex<()>,
    logger: Arc<Logger>,
}

impl HttpConnection {
    pub fn new(
        handler: Arc<ConnectionHandler>,
        fetcher: Box<dyn HttpFetcher>,
        throttle: RequestThrottle,
        base_url: impl Into<String>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            handler,
            fetcher,
            throttle,
            base_url: base_url.into(),
            in_flight: Mutex::new(()),
            logger,
        }
    }

    pub fn from_config(
        config: &HttpConfig,
        clock: Arc<dyn Clock>,
        emitter: Arc<EventEmitter>,
        logger: Arc<Logger>,
    ) -> Result<Self, ConnectionError> {
        let fetcher = ReqwestFetcher::new(Duration::from_millis(config.request_timeout_ms))?;
        let handler = Arc::new(ConnectionHandler::new(
            Protocol::Http,
            Duration::from_secs(config.ban_cooldown_hours * 60 * 60),
            Arc::clone(&clock),
            emitter,
            Arc::clone(&logger),
        ));
        let throttle = RequestThrottle::new(ThrottlePolicy::from_http_config(config), clock);
        logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "HTTP connection configured",
            Some(json!({
                "base_url": config.base_url,
                "min_interval_ms": config.min_interval_ms,
                "ban_cooldown_h": config.ban_cooldown_hours
            })),
        );
        Ok(Self::new(
            handler,
            Box::new(fetcher),
            throttle,
            config.base_url.clone(),
            logger,
        ))
    }

    pub fn handler(&self) -> &Arc<ConnectionHandler> {
        &self.handler
    }

    /// Fetches `<base_url>?<query>`; fails fast while banned.
    pub fn get(&self, query: &str) -> Result<String, ConnectionError> {
        if self.handler.is_banned() {
            return Err(ConnectionError::banned(&self.handler));
        }

        let url = if query.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}?{query}", self.base_url)
        };

        let _guard = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        self.throttle.wait_turn();
        self.handler.on_awaiting_response(true);
        let result = self.fetcher.get(&url);
        self.handler.on_awaiting_response(false);

        let response = result.map_err(|message| {
            self.logger.error(
                Some(LOG_CONTEXT),
                &format!("HTTP request to '{url}' failed: {message}"),
            );
            ConnectionError::Http {
                url: url.clone(),
                message,
            }
        })?;

        self.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "HTTP response received",
            Some(json!({ "status": response.status, "size_bytes": response.body.len() })),
        );

        match classify_http_response(response.status, &response.body) {
            ProtocolSignal::Ok if (200..300).contains(&response.status) => Ok(response.body),
            ProtocolSignal::Ok => Err(ConnectionError::Http {
                url,
                message: format!("unexpected status {}", response.status),
            }),
            ProtocolSignal::Banned { reason } => {
                self.logger
                    .warn(Some(LOG_CONTEXT), &format!("ban reported: {reason}"));
                self.handler.on_ban_signal();
                Err(ConnectionError::banned(&self.handler))
            }
            ProtocolSignal::InvalidSession => {
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

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::connection::{
        ConnectionError, ConnectionHandler, ManualClock, Protocol, RequestThrottle, ThrottlePolicy,
    };
    use crate::events::tests::recording_emitter;
    use crate::logging::Logger;

    use super::{HttpConnection, HttpFetcher, HttpResponse};

    struct FakeFetcher {
        replies: Mutex<VecDeque<Result<HttpResponse, String>>>,
        urls: Arc<Mutex<Vec<String>>>,
    }

    impl HttpFetcher for FakeFetcher {
        fn get(&self, url: &str) -> Result<HttpResponse, String> {
            self.urls
                .lock()
                .expect("url log poisoned")
                .push(url.to_owned());
            self.replies
                .lock()
                .expect("reply script poisoned")
                .pop_front()
                .unwrap_or_else(|| Err("script exhausted".to_owned()))
        }
    }

    fn ok(body: &str) -> Result<HttpResponse, String> {
        Ok(HttpResponse {
            status: 200,
            body: body.to_owned(),
        })
    }

    fn connection(
        replies: Vec<Result<HttpResponse, String>>,
    ) -> (HttpConnection, Arc<ManualClock>, Arc<Mutex<Vec<String>>>) {
        let clock = Arc::new(ManualClock::default());
        let (emitter, _seen) = recording_emitter();
        let logger = Arc::new(Logger::silent());
        let handler = Arc::new(ConnectionHandler::new(
            Protocol::Http,
            Duration::from_secs(12 * 60 * 60),
            clock.clone(),
            emitter,
            Arc::clone(&logger),
        ));
        let urls = Arc::new(Mutex::new(Vec::new()));
        let fetcher = FakeFetcher {
            replies: Mutex::new(replies.into()),
            urls: Arc::clone(&urls),
        };
        let throttle = RequestThrottle::new(ThrottlePolicy::flat(Duration::ZERO), clock.clone());
        (
            HttpConnection::new(
                handler,
                Box::new(fetcher),
                throttle,
                "http://localhost:9001/httpapi",
                logger,
            ),
            clock,
            urls,
        )
    }

    #[test]
    fn returns_body_and_builds_query_url() {
        let (connection, _clock, urls) = connection(vec![ok("<anime id=\"1\"/>")]);

        let body = connection
            .get("request=anime&aid=1")
            .expect("request should work");
        assert_eq!(body, "<anime id=\"1\"/>");
        assert_eq!(
            urls.lock().expect("url log poisoned").as_slice(),
            ["http://localhost:9001/httpapi?request=anime&aid=1"]
        );
    }

    #[test]
    fn banned_body_trips_independent_http_ban() {
        let (connection, clock, urls) = connection(vec![
            ok("<error code=\"500\">banned</error>"),
            ok("<anime/>"),
        ]);

        let error = connection.get("request=anime&aid=1").expect_err("ban should fail");
        assert!(matches!(
            error,
            ConnectionError::Banned {
                protocol: Protocol::Http,
                ..
            }
        ));
        assert!(connection.get("request=anime&aid=2").is_err());
        assert_eq!(urls.lock().expect("url log poisoned").len(), 1);

        clock.advance(chrono::Duration::hours(12));
        assert!(!connection.handler().is_banned());
        assert_eq!(
            connection.get("request=anime&aid=2").expect("ban should have lapsed"),
            "<anime/>"
        );
    }

    #[test]
    fn fetch_failures_and_bad_status_are_http_errors() {
        let (connection, _clock, _urls) = connection(vec![
            Err("connection refused".to_owned()),
            Ok(HttpResponse {
                status: 404,
                body: String::new(),
            }),
        ]);

        assert!(matches!(
            connection.get("request=anime&aid=1"),
            Err(ConnectionError::Http { .. })
        ));
        assert!(matches!(
            connection.get("request=anime&aid=1"),
            Err(ConnectionError::Http { .. })
        ));
        assert!(!connection.handler().is_banned());
    }
}
