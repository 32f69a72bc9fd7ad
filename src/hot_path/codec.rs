//! RFC6455 frame codec
//!
//! Encode side:
//! - `encode_frame` / `encode_frame_raw`: general path, appends to any `BytesMut`
//! - `FrameEncoder`: fixed 64 KiB scratch buffer reused for every send,
//!   larger payloads go through a one-off overflow allocation
//!
//! Decode side:
//! - `Decoder::read_frame` pulls exactly one frame from an `AsyncRead`,
//!   reusing a 64 KiB payload buffer for small frames
//!
//! Only FIN frames are supported. Extensions and compression are not.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core::{Frame, OpCode};
use crate::hot_path::mask::{apply_mask, next_mask};
use crate::ws::WebSocketError;

/// Size of the reusable send/receive buffers
pub const SCRATCH_SIZE: usize = 64 * 1024;

/// 2 base bytes + 8 extended length bytes + 4 mask bytes
pub const MAX_HEADER_SIZE: usize = 14;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_BITS: u8 = 0x0F;
const LEN_BITS: u8 = 0x7F;

const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

type Result<T> = std::result::Result<T, WebSocketError>;

/// Which side of the connection the decoder sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Receives server frames; a set mask bit is a protocol violation
    Client,
    /// Receives client frames; masked payloads are unmasked
    Server,
}

/// Total wire size of a frame carrying `payload_len` bytes
#[inline]
pub const fn encoded_len(payload_len: usize, masked: bool) -> usize {
    let ext = if payload_len < LEN_16 as usize {
        0
    } else if payload_len < 65536 {
        2
    } else {
        8
    };
    2 + ext + if masked { 4 } else { 0 } + payload_len
}

/// Append one FIN frame to `dst`.
///
/// With `mask = Some(key)` the mask bit is set, the key is written after the
/// length and the payload is XORed on the way into `dst`.
pub fn encode_frame(dst: &mut BytesMut, opcode: OpCode, payload: &[u8], mask: Option<[u8; 4]>) {
    write_frame(dst, opcode.as_u8(), payload, mask);
}

/// Same as `encode_frame` but for a raw opcode nibble coming from callers
/// that do not hold an `OpCode`.
pub fn encode_frame_raw(
    dst: &mut BytesMut,
    opcode: u8,
    payload: &[u8],
    mask: Option<[u8; 4]>,
) -> Result<()> {
    if opcode > OPCODE_BITS {
        return Err(WebSocketError::InvalidOpcode(opcode));
    }
    write_frame(dst, opcode, payload, mask);
    Ok(())
}

#[inline]
fn write_frame(dst: &mut BytesMut, opcode: u8, payload: &[u8], mask: Option<[u8; 4]>) {
    let len = payload.len();
    dst.reserve(encoded_len(len, mask.is_some()));

    dst.put_u8(FIN_BIT | (opcode & OPCODE_BITS));

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    if len < LEN_16 as usize {
        dst.put_u8(mask_bit | len as u8);
    } else if len < 65536 {
        dst.put_u8(mask_bit | LEN_16);
        dst.put_u16(len as u16);
    } else {
        dst.put_u8(mask_bit | LEN_64);
        dst.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(payload);
            apply_mask(&mut dst[start..], key);
        }
        None => dst.put_slice(payload),
    }
}

/// Reusable send-side encoder.
///
/// Owned by the connection's send lock; never shared without it.
#[derive(Debug)]
pub struct FrameEncoder {
    scratch: BytesMut,
    masking: bool,
}

impl FrameEncoder {
    pub fn new(masking: bool) -> Self {
        Self {
            scratch: BytesMut::with_capacity(SCRATCH_SIZE + MAX_HEADER_SIZE),
            masking,
        }
    }

    #[inline]
    pub fn masking(&self) -> bool {
        self.masking
    }

    /// Whether `payload_len` fits the fixed scratch path
    #[inline(always)]
    pub const fn fits(payload_len: usize) -> bool {
        payload_len < SCRATCH_SIZE
    }

    /// Fixed path: encode into the scratch buffer and borrow the result.
    ///
    /// Fails with `FrameTooLarge` for payloads of 64 KiB or more.
    pub fn encode(&mut self, opcode: OpCode, payload: &[u8]) -> Result<&[u8]> {
        if !Self::fits(payload.len()) {
            return Err(WebSocketError::FrameTooLarge(payload.len() as u64));
        }
        let mask = self.masking.then(next_mask);
        self.scratch.clear();
        encode_frame(&mut self.scratch, opcode, payload, mask);
        Ok(&self.scratch[..])
    }

    /// Overflow path: fresh allocation sized for this one frame
    pub fn encode_overflow(&self, opcode: OpCode, payload: &[u8]) -> BytesMut {
        let mask = self.masking.then(next_mask);
        let mut buf = BytesMut::with_capacity(encoded_len(payload.len(), mask.is_some()));
        encode_frame(&mut buf, opcode, payload, mask);
        buf
    }
}

/// Receive-side decoder.
///
/// Owned by the receive loop task only.
#[derive(Debug)]
pub struct Decoder {
    role: Role,
    max_payload: u64,
    payload: BytesMut,
}

impl Decoder {
    pub fn new(role: Role, max_payload: u64) -> Self {
        Self {
            role,
            max_payload,
            payload: BytesMut::with_capacity(SCRATCH_SIZE),
        }
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Read exactly one frame.
    ///
    /// Returns `Ok(None)` on a clean EOF before the first header byte. EOF
    /// anywhere inside a frame is `UnexpectedEndOfStream`.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Frame>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut head = [0u8; 2];
        if reader.read(&mut head[..1]).await? == 0 {
            return Ok(None);
        }
        read_exact(reader, &mut head[1..]).await?;

        let fin = head[0] & FIN_BIT != 0;
        let raw_opcode = head[0] & OPCODE_BITS;
        let masked = head[1] & MASK_BIT != 0;

        // Reserved bits (0x70) are ignored
        if !fin || raw_opcode == OpCode::Continuation.as_u8() {
            return Err(WebSocketError::FragmentedFrameUnsupported);
        }
        if masked && self.role == Role::Client {
            return Err(WebSocketError::UnexpectedServerMasking);
        }
        let opcode = OpCode::try_from(raw_opcode)?;

        let len = match head[1] & LEN_BITS {
            LEN_16 => {
                let mut ext = [0u8; 2];
                read_exact(reader, &mut ext).await?;
                u16::from_be_bytes(ext) as u64
            }
            LEN_64 => {
                let mut ext = [0u8; 8];
                read_exact(reader, &mut ext).await?;
                let len = u64::from_be_bytes(ext);
                if len & (1 << 63) != 0 {
                    return Err(WebSocketError::FrameTooLarge(len));
                }
                len
            }
            short => short as u64,
        };
        if len > self.max_payload {
            return Err(WebSocketError::FrameTooLarge(len));
        }

        let mask = if masked {
            let mut key = [0u8; 4];
            read_exact(reader, &mut key).await?;
            Some(key)
        } else {
            None
        };

        let len = usize::try_from(len).map_err(|_| WebSocketError::FrameTooLarge(len))?;
        let mut buf = if len <= SCRATCH_SIZE {
            self.payload.clear();
            self.payload.reserve(len);
            self.payload.resize(len, 0);
            self.payload.split()
        } else {
            BytesMut::zeroed(len)
        };
        read_exact(reader, &mut buf[..]).await?;

        if let Some(key) = mask {
            apply_mask(&mut buf, key);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            payload: buf.freeze(),
        }))
    }
}

#[inline]
async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(WebSocketError::UnexpectedEndOfStream)
        }
        Err(e) => Err(WebSocketError::Io(e)),
    }
}

/// Convenience for tests and benches: encode one frame to owned bytes
pub fn frame_bytes(opcode: OpCode, payload: &[u8], mask: Option<[u8; 4]>) -> Bytes {
    let mut buf = BytesMut::new();
    encode_frame(&mut buf, opcode, payload, mask);
    buf.freeze()
}

// Codec Checklist:
// ✓ Scratch encoder reused under the send lock
// ✓ Small payloads decoded into a reused buffer
// ✓ Length class picked by 125/126 and 65535/65536 boundaries
// ✓ No unsafe
