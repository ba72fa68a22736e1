use std::io;

use thiserror::Error;

/// Errors that may occur when decoding a packet.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("Packet too short! Expected at least {expected} bytes, but got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("Packet length {0} is not a multiple of the word size")]
    Misaligned(usize),
    #[error("Received invalid opcode 0x{0:08x}")]
    InvalidOpcode(u32),
    #[error("Packet too large! Maximum is {max} words, but got {got}")]
    TooManyWords { max: usize, got: usize },
    #[error("{0} unexpected trailing bytes after packet")]
    TrailingBytes(usize),
}
