//! Core wire types shared by the codec, the transport socket and the
//! protocol adapters
//!
//! - OpCode: 4-bit frame purpose tag
//! - CloseCode: status code carried by Close frames
//! - Frame: one decoded FIN frame

pub mod frame;

pub use frame::{close_payload, CloseCode, Frame, OpCode};
