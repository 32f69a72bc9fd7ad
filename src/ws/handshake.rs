//! WebSocket opening handshake (client side)
//!
//! Builds the HTTP Upgrade request, reads the response header block
//! byte-by-byte (never past the blank line, so no frame bytes are lost)
//! and validates status, Upgrade, Connection and Sec-WebSocket-Accept.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::ws::connection::WebSocketConfig;
use crate::ws::error::{Result, WebSocketError};

/// Fixed GUID appended to the key before hashing
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the response header block
pub const MAX_RESPONSE_HEADER: usize = 8 * 1024;

/// Random 16-byte key, base64-encoded
pub fn generate_key() -> String {
    BASE64_STANDARD.encode(rand::random::<[u8; 16]>())
}

/// base64(SHA-1(key + GUID))
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

/// Encoded Upgrade request plus the key it carries
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    key: String,
    head: String,
}

impl HandshakeRequest {
    pub fn new(url: &Url, config: &WebSocketConfig) -> Result<Self> {
        Self::with_key(url, config, generate_key())
    }

    /// Build the request with a caller-chosen key
    pub fn with_key(url: &Url, config: &WebSocketConfig, key: String) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| WebSocketError::InvalidUrl(format!("{url}: missing host")))?;

        let mut target = url.path().to_string();
        if target.is_empty() {
            target.push('/');
        }
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }

        // url::Url::port() is None when the port is the scheme default
        let host_header = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let origin = config
            .origin
            .clone()
            .unwrap_or_else(|| format!("{}://{}", url.scheme(), host));

        let mut head = format!(
            "GET {target} HTTP/1.1\r\n\
             Host: {host_header}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Origin: {origin}\r\n\
             Sec-WebSocket-Origin: {origin}\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: {}\r\n",
            config.version
        );
        for (name, value) in &config.extra_headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        Ok(Self { key, head })
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.head.as_bytes()
    }
}

/// Parsed `101 Switching Protocols` response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub status_line: String,
    pub headers: Vec<(String, String)>,
}

impl HandshakeResponse {
    /// Case-insensitive header lookup (first match)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn parse(block: &str) -> Result<Self> {
        let mut lines = block.split("\r\n").filter(|l| !l.is_empty());
        let status_line = lines
            .next()
            .ok_or_else(|| WebSocketError::HandshakeFailed("empty response".into()))?
            .to_string();

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                WebSocketError::HandshakeFailed(format!("malformed header line: {line}"))
            })?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            status_line,
            headers,
        })
    }

    fn validate(&self, key: &str) -> Result<()> {
        if !self.status_line.starts_with("HTTP/1.1 101") {
            return Err(WebSocketError::HandshakeFailed(format!(
                "unexpected status: {}",
                self.status_line
            )));
        }

        let upgrade_ok = self
            .header("Upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        if !upgrade_ok {
            return Err(WebSocketError::HandshakeFailed("missing Upgrade: websocket".into()));
        }

        let connection_ok = self.header("Connection").is_some_and(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
        if !connection_ok {
            return Err(WebSocketError::HandshakeFailed("missing Connection: Upgrade".into()));
        }

        match self.header("Sec-WebSocket-Accept") {
            Some(accept) if accept == accept_key(key) => Ok(()),
            _ => Err(WebSocketError::HandshakeFailed(
                "Sec-WebSocket-Accept does not match key".into(),
            )),
        }
    }
}

/// Send the request and validate the response on an already-connected stream
pub async fn perform<S>(stream: &mut S, request: &HandshakeRequest) -> Result<HandshakeResponse>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let block = read_response_head(stream).await?;
    let response = HandshakeResponse::parse(&block)?;
    response.validate(request.key())?;
    Ok(response)
}

async fn read_response_head<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];

    while !buf.ends_with(b"\r\n\r\n") {
        if buf.len() >= MAX_RESPONSE_HEADER {
            return Err(WebSocketError::HandshakeFailed(
                "response header block too large".into(),
            ));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(WebSocketError::HandshakeFailed(
                "connection closed during handshake".into(),
            ));
        }
        buf.push(byte[0]);
    }

    String::from_utf8(buf)
        .map_err(|_| WebSocketError::HandshakeFailed("response is not valid UTF-8".into()))
}
