use std::io;

use thiserror::Error;
use ucp_protocol::Opcode;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors that end an exchange with the board.
#[derive(Debug, Error)]
pub enum Error {
    /// The board did not answer, neither to the command nor to any retry
    #[error("No reply to {opcode} at address 0x{address:08x} after {attempts} attempts")]
    Timeout {
        address: u32,
        opcode: Opcode,
        attempts: u32,
    },
    /// Sending or receiving failed on the socket itself. Never retried.
    #[error("Socket error: {0}")]
    Socket(#[from] io::Error),
    /// The matching reply did not carry the requested number of words
    #[error("Reply to psn {psn} carried {got} words, expected {expected}")]
    UnexpectedPayload { psn: u32, expected: usize, got: usize },
    /// A transfer would wrap around the 32 bit address space
    #[error("Transfer of {count} words at address 0x{address:08x} exceeds the address space")]
    AddressOverflow { address: u32, count: usize },
    /// Single bit writes address bits 0 to 31 of a word
    #[error("Bit {0} is outside of a 32 bit word")]
    InvalidBit(u8),
    #[error("Connection is closed")]
    Disconnected,
}

impl Error {
    /// Whether the error leaves the socket unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Socket(_) | Error::Disconnected)
    }
}

/// A write that was aborted part way through a split transfer.
///
/// Words before `written` reached the board, the packet starting at `written` failed
/// and nothing after it was sent.
#[derive(Debug, Error)]
#[error("Write aborted after {written} words: {source}")]
pub struct WriteError {
    /// Index of the first word that was not acknowledged
    pub written: usize,
    #[source]
    pub source: Error,
}

impl WriteError {
    pub fn into_inner(self) -> Error {
        self.source
    }
}
