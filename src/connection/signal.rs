use std::time::Duration;

/// What a response tells the connection layer beyond its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolSignal {
    Ok,
    Banned { reason: String },
    InvalidSession,
    Backoff { pause: Duration, message: String },
}

const UDP_BANNED: u16 = 555;
const UDP_LOGIN_FIRST: u16 = 501;
const UDP_INVALID_SESSION: u16 = 506;

/// Parses the leading three-digit status code of a UDP API reply.
pub fn udp_status_code(response: &str) -> Option<u16> {
    let code = response.get(..3)?;
    if !code.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    code.parse().ok()
}

pub fn classify_udp_response(response: &str) -> ProtocolSignal {
    let first_line = response.lines().next().unwrap_or_default().trim();
    let Some(code) = udp_status_code(first_line) else {
        return ProtocolSignal::Ok;
    };

    match code {
        UDP_BANNED => {
            let reason = response
                .lines()
                .nth(1)
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .unwrap_or(first_line);
            ProtocolSignal::Banned {
                reason: reason.to_owned(),
            }
        }
        UDP_LOGIN_FIRST | UDP_INVALID_SESSION => ProtocolSignal::InvalidSession,
        600 | 602 => backoff(Duration::from_secs(5 * 60), first_line),
        601 => backoff(Duration::from_secs(30 * 60), first_line),
        604 => backoff(Duration::from_secs(60), first_line),
        _ => ProtocolSignal::Ok,
    }
}

const HTTP_TOO_MANY_REQUESTS: u16 = 429;
const HTTP_SERVICE_UNAVAILABLE: u16 = 503;

pub fn classify_http_response(status: u16, body: &str) -> ProtocolSignal {
    if status == HTTP_SERVICE_UNAVAILABLE {
        return ProtocolSignal::Banned {
            reason: format!("HTTP {status}"),
        };
    }
    if status == HTTP_TOO_MANY_REQUESTS {
        return backoff(Duration::from_secs(5 * 60), "HTTP 429 Too Many Requests");
    }

    let head = body.get(..body.len().min(512)).unwrap_or(body);
    let lowered = head.to_ascii_lowercase();
    if lowered.contains("<error") && lowered.contains("banned") {
        return ProtocolSignal::Banned {
            reason: head.trim().to_owned(),
        };
    }
    ProtocolSignal::Ok
}

fn backoff(pause: Duration, message: &str) -> ProtocolSignal {
    ProtocolSignal::Backoff {
        pause,
        message: message.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{classify_http_response, classify_udp_response, udp_status_code, ProtocolSignal};

    #[test]
    fn parses_leading_status_code() {
        assert_eq!(udp_status_code("300 PONG"), Some(300));
        assert_eq!(udp_status_code("PONG"), None);
        assert_eq!(udp_status_code("30"), None);
    }

    #[test]
    fn classifies_udp_ban_with_reason_line() {
        let signal = classify_udp_response("555 BANNED\nLeech\n");
        assert_eq!(
            signal,
            ProtocolSignal::Banned {
                reason: "Leech".to_owned()
            }
        );
    }

    #[test]
    fn classifies_udp_session_and_backoff_codes() {
        assert_eq!(classify_udp_response("506 INVALID SESSION"), ProtocolSignal::InvalidSession);
        assert_eq!(classify_udp_response("501 LOGIN FIRST"), ProtocolSignal::InvalidSession);
        assert_eq!(
            classify_udp_response("601 ANIDB OUT OF SERVICE - TRY AGAIN LATER"),
            ProtocolSignal::Backoff {
                pause: Duration::from_secs(1800),
                message: "601 ANIDB OUT OF SERVICE - TRY AGAIN LATER".to_owned()
            }
        );
        assert!(matches!(
            classify_udp_response("604 TIMEOUT - DELAY AND RESUBMIT"),
            ProtocolSignal::Backoff { pause, .. } if pause == Duration::from_secs(60)
        ));
        assert_eq!(classify_udp_response("230 ANIME\n1|2002"), ProtocolSignal::Ok);
    }

    #[test]
    fn classifies_http_ban_and_throttle() {
        assert!(matches!(
            classify_http_response(200, "<error code=\"500\">banned</error>"),
            ProtocolSignal::Banned { .. }
        ));
        assert!(matches!(
            classify_http_response(503, ""),
            ProtocolSignal::Banned { .. }
        ));
        assert!(matches!(
            classify_http_response(429, ""),
            ProtocolSignal::Backoff { .. }
        ));
        assert_eq!(
            classify_http_response(200, "<anime id=\"1\"></anime>"),
            ProtocolSignal::Ok
        );
    }
}
