//! socket.io v0.9 HTTP negotiation
//!
//! `POST {base}/socket.io/1/?[params&]t=<ms>` answers
//! `sid:heartbeat:timeout:transport1,transport2,...`. The WebSocket target
//! is then `ws(s)://{host}{base}/socket.io/1/websocket/{sid}`.

use std::time::Duration;

use time::OffsetDateTime;
use tracing::debug;
use url::Url;

use crate::protocols::{ProtocolError, Result};

/// Heartbeat interval used when the server leaves the field empty
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

/// Added to the heartbeat when the server leaves the timeout field empty
pub const DEFAULT_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

const SOCKET_IO_PATH: &str = "socket.io/1";

/// Negotiated session parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub session_id: String,
    pub heartbeat: Duration,
    pub timeout: Duration,
    pub transports: Vec<String>,
    pub ws_url: Url,
}

/// Handshake URL for `base` with the cache-busting timestamp appended
pub fn handshake_url(base: &str, timestamp_ms: u64) -> Result<Url> {
    let mut url = Url::parse(base).map_err(|e| ProtocolError::InvalidUrl(format!("{base}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProtocolError::InvalidUrl(format!(
            "{base}: expected http or https"
        )));
    }

    if !url.path().contains(SOCKET_IO_PATH) {
        let path = format!("{}/{SOCKET_IO_PATH}/", url.path().trim_end_matches('/'));
        url.set_path(&path);
    } else if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    let query = match url.query().filter(|q| !q.is_empty()) {
        Some(params) => format!("{params}&t={timestamp_ms}"),
        None => format!("t={timestamp_ms}"),
    };
    url.set_query(Some(&query));
    Ok(url)
}

/// WebSocket URL for a session: scheme swapped, query dropped
pub fn websocket_url(handshake_url: &Url, session_id: &str) -> Result<Url> {
    let scheme = match handshake_url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(ProtocolError::InvalidUrl(format!(
                "unsupported scheme: {other}"
            )))
        }
    };
    let host = handshake_url
        .host_str()
        .ok_or_else(|| ProtocolError::InvalidUrl(format!("{handshake_url}: missing host")))?;
    let authority = match handshake_url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let path = handshake_url.path().trim_end_matches('/');

    let target = format!("{scheme}://{authority}{path}/websocket/{session_id}");
    Url::parse(&target).map_err(|e| ProtocolError::InvalidUrl(format!("{target}: {e}")))
}

/// Parse the negotiation body.
///
/// Empty heartbeat means 15 s; an empty or omitted timeout means
/// heartbeat + 10 s. The transport list is always the last field, so
/// `sid:20:websocket` and `sid:20:60:websocket` both parse.
pub fn parse_handshake_response(text: &str, handshake_url: &Url) -> Result<Handshake> {
    let text = text.trim();
    let fields: Vec<&str> = text.splitn(4, ':').collect();

    let session_id = fields[0];
    if session_id.is_empty() || fields.len() < 2 {
        return Err(ProtocolError::MalformedHandshake(text.to_string()));
    }
    let (heartbeat_field, timeout_field, transport_field) = match fields.as_slice() {
        [_, transports] => ("", "", *transports),
        [_, heartbeat, transports] => (*heartbeat, "", *transports),
        [_, heartbeat, timeout, transports] => (*heartbeat, *timeout, *transports),
        _ => return Err(ProtocolError::MalformedHandshake(text.to_string())),
    };

    let heartbeat = match heartbeat_field {
        "" => DEFAULT_HEARTBEAT,
        secs => Duration::from_secs(parse_secs(secs, text)?),
    };
    let timeout = match timeout_field {
        "" => heartbeat + DEFAULT_TIMEOUT_MARGIN,
        secs => Duration::from_secs(parse_secs(secs, text)?),
    };

    let transports: Vec<String> = transport_field
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if !transports.iter().any(|t| t == "websocket") {
        return Err(ProtocolError::UnsupportedTransport(transports.join(",")));
    }

    Ok(Handshake {
        session_id: session_id.to_string(),
        heartbeat,
        timeout,
        transports,
        ws_url: websocket_url(handshake_url, session_id)?,
    })
}

fn parse_secs(field: &str, text: &str) -> Result<u64> {
    field
        .trim()
        .parse()
        .map_err(|_| ProtocolError::MalformedHandshake(text.to_string()))
}

/// Milliseconds since the Unix epoch
fn timestamp_ms() -> u64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
}

/// Run the HTTP pre-flight against `base`
pub async fn negotiate(base: &str, accept_invalid_certs: bool) -> Result<Handshake> {
    let url = handshake_url(base, timestamp_ms())?;
    debug!(target: "socketio", url = %url, "Negotiating session");

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()?;
    let text = client
        .post(url.clone())
        .body("")
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    let handshake = parse_handshake_response(&text, &url)?;
    debug!(
        target: "socketio",
        session = %handshake.session_id,
        heartbeat_secs = handshake.heartbeat.as_secs(),
        timeout_secs = handshake.timeout.as_secs(),
        "Session negotiated"
    );
    Ok(handshake)
}
