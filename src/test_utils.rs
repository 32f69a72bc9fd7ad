//! Test utilities: an in-memory WebSocket server peer
//!
//! `TestServer::pair()` hands the client half of a duplex pipe to the code
//! under test and keeps the other half for scripted server behaviour.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::core::{Frame, OpCode};
use crate::hot_path::{apply_mask, encode_frame, next_mask, Decoder, Role};
use crate::ws::handshake::accept_key;
use crate::ws::{ConnectionState, WebSocket};

const PIPE_SIZE: usize = 1024 * 1024;

/// Frame as it appeared on the wire, mask bit included
#[derive(Debug)]
pub struct RawFrame {
    pub opcode: u8,
    pub masked: bool,
    /// Unmasked payload
    pub payload: Bytes,
}

pub struct TestServer {
    stream: DuplexStream,
    decoder: Decoder,
}

impl TestServer {
    pub fn pair() -> (DuplexStream, TestServer) {
        let (client, server) = tokio::io::duplex(PIPE_SIZE);
        let server = TestServer {
            stream: server,
            decoder: Decoder::new(Role::Server, u64::MAX >> 1),
        };
        (client, server)
    }

    /// Read the upgrade request and answer 101. Returns the request text.
    pub async fn accept(&mut self) -> String {
        let request = self.read_request().await;
        let key = request_key(&request);
        self.respond(&accept_key(&key)).await;
        request
    }

    /// Same as `accept` but with a wrong `Sec-WebSocket-Accept`
    pub async fn accept_corrupted(&mut self) -> String {
        let request = self.read_request().await;
        self.respond("AAAAAAAAAAAAAAAAAAAAAAAAAAA=").await;
        request
    }

    async fn read_request(&mut self) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            if self.stream.read(&mut byte).await.unwrap_or(0) == 0 {
                break;
            }
            buf.push(byte[0]);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    async fn respond(&mut self, accept: &str) {
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\r\n"
        );
        self.stream.write_all(response.as_bytes()).await.unwrap();
    }

    /// Next client frame, unmasked. `None` on EOF or a protocol error.
    pub async fn read_frame(&mut self) -> Option<Frame> {
        self.decoder.read_frame(&mut self.stream).await.ok().flatten()
    }

    /// Next client frame with its mask bit reported
    pub async fn read_raw_frame(&mut self) -> Option<RawFrame> {
        let mut head = [0u8; 2];
        self.stream.read_exact(&mut head).await.ok()?;
        let masked = head[1] & 0x80 != 0;
        let len = match head[1] & 0x7F {
            126 => self.stream.read_u16().await.ok()? as usize,
            127 => self.stream.read_u64().await.ok()? as usize,
            short => short as usize,
        };
        let mut key = [0u8; 4];
        if masked {
            self.stream.read_exact(&mut key).await.ok()?;
        }
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await.ok()?;
        if masked {
            apply_mask(&mut payload, key);
        }
        Some(RawFrame {
            opcode: head[0] & 0x0F,
            masked,
            payload: payload.into(),
        })
    }

    pub async fn send_frame(&mut self, opcode: OpCode, payload: &[u8]) {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, None);
        self.send_raw(&buf).await;
    }

    /// Masked frame, which a client must reject
    pub async fn send_masked_frame(&mut self, opcode: OpCode, payload: &[u8]) {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, Some(next_mask()));
        self.send_raw(&buf).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.send_frame(OpCode::Text, text.as_bytes()).await;
    }

    /// Write bytes as-is. A client that already hung up is not an error.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let _ = self.stream.write_all(bytes).await;
    }
}

fn request_key(request: &str) -> String {
    request
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("sec-websocket-key")
                .then(|| value.trim().to_string())
        })
        .expect("request without Sec-WebSocket-Key")
}

/// Poll until `ws` reaches `state`, panicking after two seconds
pub async fn wait_for_state(ws: &WebSocket, state: ConnectionState) {
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        while ws.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "state {:?} not reached, still {:?}", state, ws.state());
}
