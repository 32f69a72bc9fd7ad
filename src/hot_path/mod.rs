//! Hot path operations - frame encode/decode, zero panic
//!
//! This module contains the per-frame code:
//! - Payload masking
//! - Frame encoding (fixed scratch path and overflow path)
//! - Frame decoding from any async byte stream

pub mod codec;
pub mod mask;

pub use codec::{
    encode_frame, encode_frame_raw, encoded_len, frame_bytes, Decoder, FrameEncoder, Role,
    MAX_HEADER_SIZE, SCRATCH_SIZE,
};
pub use mask::{apply_mask, next_mask};
