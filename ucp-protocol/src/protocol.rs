use std::fmt::Display;

/// Size of a single protocol word in bytes. All values on the wire are 32 bit.
pub const WORD_SIZE: usize = 4;

/// Size of the command header: psn, opcode, value count and address.
pub const COMMAND_HEADER_SIZE: usize = 4 * WORD_SIZE;

/// Size of the reply header: psn and the echoed address.
pub const REPLY_HEADER_SIZE: usize = 2 * WORD_SIZE;

/// Largest UDP payload that fits into an IPv4 datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Most payload words a single command can carry, whatever the MTU.
pub const MAX_WORDS_PER_DATAGRAM: usize = (MAX_DATAGRAM_SIZE - COMMAND_HEADER_SIZE) / WORD_SIZE;

/// Operation requested by a command. The numeric values are fixed by the board firmware.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum Opcode {
    /// Read N words starting at an address
    Read = 0x01,
    /// Write N words starting at an address
    Write = 0x02,
    /// AND the word at an address with a mask
    BitwiseAnd = 0x03,
    /// OR the word at an address with a mask
    BitwiseOr = 0x04,
    FlashWrite = 0x06,
    FlashRead = 0x07,
    FlashErase = 0x08,
    /// Pop N words from a FIFO. The address is not incremented.
    FifoRead = 0x09,
    /// Push N words into a FIFO. The address is not incremented.
    FifoWrite = 0x0A,
    /// Set or clear a single bit of a word
    BitWrite = 0x0B,
    ResetBoard = 0x11,
    /// Subscribe to periodic telemetry of a memory area
    PeriodicUpdate = 0x12,
    /// Request a one-shot asynchronous update of a memory area
    AsyncUpdate = 0x13,
    /// Cancel an outstanding subscription
    CancelUpdate = 0x14,
    /// Block until the next pulse-per-second edge on the board
    WaitForPps = 0xFFFF_FFFF,
}

impl Opcode {
    /// Whether commands with this opcode carry `value_count` payload words.
    pub fn carries_payload(&self) -> bool {
        matches!(
            self,
            Opcode::Write
                | Opcode::BitwiseAnd
                | Opcode::BitwiseOr
                | Opcode::FlashWrite
                | Opcode::FifoWrite
                | Opcode::BitWrite
        )
    }

    /// Whether replies to this opcode carry `value_count` payload words.
    pub fn returns_payload(&self) -> bool {
        matches!(self, Opcode::Read | Opcode::FlashRead | Opcode::FifoRead)
    }

    /// Whether consecutive words of a transfer map to consecutive addresses.
    /// FIFO transfers always target the same address.
    pub fn increments_address(&self) -> bool {
        !matches!(self, Opcode::FifoRead | Opcode::FifoWrite)
    }
}

impl TryFrom<u32> for Opcode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Opcode::Read,
            0x02 => Opcode::Write,
            0x03 => Opcode::BitwiseAnd,
            0x04 => Opcode::BitwiseOr,
            0x06 => Opcode::FlashWrite,
            0x07 => Opcode::FlashRead,
            0x08 => Opcode::FlashErase,
            0x09 => Opcode::FifoRead,
            0x0A => Opcode::FifoWrite,
            0x0B => Opcode::BitWrite,
            0x11 => Opcode::ResetBoard,
            0x12 => Opcode::PeriodicUpdate,
            0x13 => Opcode::AsyncUpdate,
            0x14 => Opcode::CancelUpdate,
            0xFFFF_FFFF => Opcode::WaitForPps,
            other => return Err(other),
        })
    }
}

impl From<Opcode> for u32 {
    fn from(value: Opcode) -> Self {
        value as u32
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (0x{:02x})", self, *self as u32)
    }
}

/// A command is sent from the client to the board.
/// For each command, the client waits for the matching reply before sending the next one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Command {
    /// packet sequence number, echoed by the board in the reply
    pub psn: u32,
    pub opcode: Opcode,
    /// Number of words the command operates on.
    /// For payload carrying opcodes this is also the number of payload words.
    pub value_count: u32,
    pub address: u32,
    /// Payload words. Empty for opcodes that carry no payload.
    pub payload: Box<[u32]>,
}

impl Command {
    /// Creates a command without payload that operates on `value_count` words.
    pub fn new(psn: u32, opcode: Opcode, address: u32, value_count: u32) -> Command {
        Command {
            psn,
            opcode,
            value_count,
            address,
            payload: Box::default(),
        }
    }

    /// Creates a command that carries `payload`. The value count is the payload length.
    pub fn with_payload(psn: u32, opcode: Opcode, address: u32, payload: &[u32]) -> Command {
        Command {
            psn,
            opcode,
            value_count: payload.len() as u32,
            address,
            payload: payload.into(),
        }
    }

    /// Size of the encoded datagram in bytes.
    pub fn encoded_len(&self) -> usize {
        COMMAND_HEADER_SIZE + self.payload.len() * WORD_SIZE
    }
}

/// A reply is sent from the board to the client for every command it executed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reply {
    /// sequence number of the command this reply answers
    pub psn: u32,
    /// the address of the command, echoed
    pub address: u32,
    /// Payload words. Only present for read-class opcodes.
    pub payload: Box<[u32]>,
}

impl Reply {
    /// Creates an acknowledgement without payload.
    pub fn ack(psn: u32, address: u32) -> Reply {
        Reply {
            psn,
            address,
            payload: Box::default(),
        }
    }

    pub fn with_payload(psn: u32, address: u32, payload: impl Into<Box<[u32]>>) -> Reply {
        Reply {
            psn,
            address,
            payload: payload.into(),
        }
    }

    /// Size of the encoded datagram in bytes.
    pub fn encoded_len(&self) -> usize {
        REPLY_HEADER_SIZE + self.payload.len() * WORD_SIZE
    }
}

/// Returns how many payload words fit into one datagram for a link with the given MTU.
///
/// The MTU covers the IPv4 (20 bytes) and UDP (8 bytes) headers as well as the command header.
/// Replies have a smaller header than commands, so the command side is the limiting one.
pub fn max_words_for_mtu(mtu: usize) -> usize {
    const IP_UDP_OVERHEAD: usize = 20 + 8;
    mtu.saturating_sub(IP_UDP_OVERHEAD + COMMAND_HEADER_SIZE) / WORD_SIZE
}

#[test]
fn opcode_round_trips_through_u32() {
    for opcode in [
        Opcode::Read,
        Opcode::FifoWrite,
        Opcode::CancelUpdate,
        Opcode::WaitForPps,
    ] {
        assert_eq!(Opcode::try_from(u32::from(opcode)), Ok(opcode));
    }
    assert_eq!(Opcode::try_from(0x05), Err(0x05));
}

#[test]
fn datagram_limit() {
    assert_eq!(MAX_WORDS_PER_DATAGRAM, 16372);
    assert!(REPLY_HEADER_SIZE + MAX_WORDS_PER_DATAGRAM * WORD_SIZE <= MAX_DATAGRAM_SIZE);
}

#[test]
fn payload_classes() {
    assert!(Opcode::Write.carries_payload());
    assert!(!Opcode::Read.carries_payload());
    assert!(Opcode::FlashRead.returns_payload());
    assert!(!Opcode::BitwiseOr.returns_payload());
    assert!(!Opcode::FifoRead.increments_address());
}

#[test]
fn standard_ethernet_mtu() {
    assert_eq!(max_words_for_mtu(1500), 364);
    assert_eq!(max_words_for_mtu(10), 0);
}
