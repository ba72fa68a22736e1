//! # UCP Client
//!
//! A blocking Rust client for reading and writing the memory of FPGA digital boards
//! over the UCP protocol.
//!
//! ## Overview
//!
//! A [`Connection`] owns one UDP socket and the packet sequence counter for one board.
//! Every operation is a request/reply exchange: the command is sent, the caller blocks until
//! the reply with the same sequence number arrives, and unanswered commands are resent
//! unchanged until the retry budget is spent. Replies with any other sequence number
//! are late answers to earlier commands and are dropped.
//!
//! Transfers larger than one packet are split into consecutive sub-transfers of at most
//! [`Config::max_words_per_packet`] words. Sub-transfers are strictly sequential, there is
//! never more than one command in flight.
//!
//! For the packet format, see the [`ucp_protocol`] crate.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use ucp_client::{BitwiseOp, Connection};
//!
//! let mut board = Connection::open("10.0.10.2:10000")?;
//!
//! // Read 1024 words, split into as many packets as needed
//! let values = board.read_words(0x3000_0000, 1024)?;
//!
//! // Write back the first two words
//! board.write_words(0x3000_0000, &values[..2])?;
//!
//! // Clear bit 0 of a control register without a read-modify-write round trip
//! board.bitwise_update(0x3000_0008, !0x1, BitwiseOp::And)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Thread Safety
//!
//! All operations take `&mut self`. A connection shared between threads must be
//! wrapped in a mutex by the caller.
use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    time::Instant,
};

use ucp_protocol::{Command, MAX_DATAGRAM_SIZE, Reply};

mod config;
pub mod error;

pub use config::{Builder, Config};
pub use error::{Error, Result, WriteError};
pub use ucp_protocol::Opcode;

/// The two masked update operations that execute on the board in one exchange.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BitwiseOp {
    And,
    Or,
}

impl From<BitwiseOp> for Opcode {
    fn from(value: BitwiseOp) -> Self {
        match value {
            BitwiseOp::And => Opcode::BitwiseAnd,
            BitwiseOp::Or => Opcode::BitwiseOr,
        }
    }
}

/// Connection to a single board.
pub struct Connection {
    socket: Option<UdpSocket>,
    peer: SocketAddr,
    psn: u32,
    config: Config,
    recv_buf: Box<[u8]>,
}

impl Connection {
    /// Connects to a board with the default configuration.
    pub fn open(addr: impl ToSocketAddrs) -> io::Result<Connection> {
        Connection::connect(addr, Config::default())
    }

    /// Opens a socket on an ephemeral local port and directs it at `addr`.
    /// No packet is exchanged, so this succeeds even when the board is offline.
    pub fn connect(addr: impl ToSocketAddrs, config: Config) -> io::Result<Connection> {
        let peer = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Address resolved to nothing")
        })?;
        let local: SocketAddr = match peer.ip() {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(peer)?;
        log::info!(
            "Opened UCP connection to {} from {}",
            peer,
            socket.local_addr()?
        );
        log::debug!(
            "Connection config: timeout={:?}, retries={}, max_words_per_packet={}",
            config.timeout,
            config.retries,
            config.max_words_per_packet()
        );
        Ok(Connection {
            socket: Some(socket),
            peer,
            psn: 0,
            config,
            recv_buf: vec![0; MAX_DATAGRAM_SIZE].into_boxed_slice(),
        })
    }

    /// Releases the socket. Calling this more than once has no effect.
    pub fn disconnect(&mut self) {
        if self.socket.take().is_some() {
            log::info!("Closed UCP connection to {}", self.peer);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Address of the board
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The sequence number the next command will carry
    pub fn next_sequence_number(&self) -> u32 {
        self.psn
    }

    /// Read `count` consecutive words starting at `address`.
    pub fn read_words(&mut self, address: u32, count: usize) -> Result<Vec<u32>> {
        self.split_read(Opcode::Read, address, count)
    }

    /// Write `values` to consecutive words starting at `address`.
    ///
    /// The transfer is not atomic. If a packet fails, the words of earlier packets stay written.
    pub fn write_words(
        &mut self,
        address: u32,
        values: &[u32],
    ) -> std::result::Result<(), WriteError> {
        self.split_write(Opcode::Write, address, values)
    }

    /// Combine the word at `address` with `mask` on the board.
    pub fn bitwise_update(&mut self, address: u32, mask: u32, op: BitwiseOp) -> Result<()> {
        self.exchange(op.into(), address, 1, &[mask]).map(drop)
    }

    /// Set or clear a single bit of the word at `address`. Bits are numbered 0 to 31.
    pub fn write_bit(&mut self, address: u32, bit: u8, value: bool) -> Result<()> {
        if bit >= 32 {
            return Err(Error::InvalidBit(bit));
        }
        self.exchange(Opcode::BitWrite, address, 2, &[u32::from(bit), u32::from(value)])
            .map(drop)
    }

    pub fn flash_read(&mut self, address: u32, count: usize) -> Result<Vec<u32>> {
        self.split_read(Opcode::FlashRead, address, count)
    }

    pub fn flash_write(
        &mut self,
        address: u32,
        values: &[u32],
    ) -> std::result::Result<(), WriteError> {
        self.split_write(Opcode::FlashWrite, address, values)
    }

    /// Erase `count` words of flash starting at `address`.
    pub fn flash_erase(&mut self, address: u32, count: u32) -> Result<()> {
        self.exchange(Opcode::FlashErase, address, count, &[]).map(drop)
    }

    /// Pop `count` words from the FIFO at `address`.
    pub fn fifo_read(&mut self, address: u32, count: usize) -> Result<Vec<u32>> {
        self.split_read(Opcode::FifoRead, address, count)
    }

    /// Push `values` into the FIFO at `address`.
    pub fn fifo_write(
        &mut self,
        address: u32,
        values: &[u32],
    ) -> std::result::Result<(), WriteError> {
        self.split_write(Opcode::FifoWrite, address, values)
    }

    pub fn reset_board(&mut self) -> Result<()> {
        self.exchange(Opcode::ResetBoard, 0, 0, &[]).map(drop)
    }

    /// Ask the board to periodically publish `count` words starting at `address`.
    pub fn subscribe_periodic(&mut self, address: u32, count: u32) -> Result<()> {
        self.exchange(Opcode::PeriodicUpdate, address, count, &[]).map(drop)
    }

    /// Ask the board to publish `count` words starting at `address` once.
    pub fn request_async_update(&mut self, address: u32, count: u32) -> Result<()> {
        self.exchange(Opcode::AsyncUpdate, address, count, &[]).map(drop)
    }

    /// Cancel the subscription for `address`.
    pub fn cancel_update(&mut self, address: u32) -> Result<()> {
        self.exchange(Opcode::CancelUpdate, address, 0, &[]).map(drop)
    }

    /// Block until the board saw the next pulse-per-second edge.
    pub fn wait_for_pps(&mut self) -> Result<()> {
        self.exchange(Opcode::WaitForPps, 0, 0, &[]).map(drop)
    }

    /// Rejects transfers that would run past the end of the address space.
    fn check_range(opcode: Opcode, address: u32, count: usize) -> Result<()> {
        let last = u64::from(address) + count.saturating_sub(1) as u64;
        if opcode.increments_address() && last > u64::from(u32::MAX) {
            return Err(Error::AddressOverflow { address, count });
        }
        Ok(())
    }

    /// Address of the sub-transfer starting `offset` words into a transfer at `address`.
    /// Only valid after [Self::check_range] accepted the transfer.
    fn chunk_address(opcode: Opcode, address: u32, offset: usize) -> u32 {
        if opcode.increments_address() {
            address.wrapping_add(offset as u32)
        } else {
            address
        }
    }

    fn split_read(&mut self, opcode: Opcode, address: u32, count: usize) -> Result<Vec<u32>> {
        Self::check_range(opcode, address, count)?;
        let max_words = self.config.max_words_per_packet();
        if count > max_words {
            log::debug!(
                "Splitting {} of {} words into {} packets",
                opcode,
                count,
                count.div_ceil(max_words)
            );
        }
        let mut values = Vec::with_capacity(count);
        while values.len() < count {
            let chunk = (count - values.len()).min(max_words);
            let chunk_address = Self::chunk_address(opcode, address, values.len());
            let payload = self.exchange(opcode, chunk_address, chunk as u32, &[])?;
            values.extend_from_slice(&payload);
        }
        Ok(values)
    }

    fn split_write(
        &mut self,
        opcode: Opcode,
        address: u32,
        values: &[u32],
    ) -> std::result::Result<(), WriteError> {
        Self::check_range(opcode, address, values.len())
            .map_err(|source| WriteError { written: 0, source })?;
        let max_words = self.config.max_words_per_packet();
        if values.len() > max_words {
            log::debug!(
                "Splitting {} of {} words into {} packets",
                opcode,
                values.len(),
                values.len().div_ceil(max_words)
            );
        }
        let mut written = 0;
        for chunk in values.chunks(max_words) {
            let chunk_address = Self::chunk_address(opcode, address, written);
            self.exchange(opcode, chunk_address, chunk.len() as u32, chunk)
                .map_err(|source| WriteError { written, source })?;
            written += chunk.len();
        }
        Ok(())
    }

    /// Performs one request/reply exchange and returns the reply payload.
    ///
    /// Each attempt waits `timeout` from its own send. Stale or malformed datagrams
    /// received during the wait are dropped and do not extend it.
    fn exchange(
        &mut self,
        opcode: Opcode,
        address: u32,
        value_count: u32,
        payload: &[u32],
    ) -> Result<Box<[u32]>> {
        let socket = self.socket.as_ref().ok_or(Error::Disconnected)?;
        let psn = self.psn;
        self.psn = self.psn.wrapping_add(1);

        let command = Command {
            psn,
            opcode,
            value_count,
            address,
            payload: payload.into(),
        };
        let datagram = command.encode();
        let attempts = self.config.attempts();

        log::debug!(
            "Sending {}: psn={}, address=0x{:08x}, value_count={}",
            opcode,
            psn,
            address,
            value_count
        );
        if !payload.is_empty() {
            log::trace!("Command payload: {:08x?}", payload);
        }

        for attempt in 1..=attempts {
            if attempt > 1 {
                log::warn!(
                    "No reply to psn {} from {}, resending (attempt {}/{})",
                    psn,
                    self.peer,
                    attempt,
                    attempts
                );
            }
            socket.send(&datagram)?;
            let deadline = Instant::now() + self.config.timeout;

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                socket.set_read_timeout(Some(remaining))?;
                let len = match socket.recv(&mut self.recv_buf) {
                    Ok(len) => len,
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) =>
                    {
                        break;
                    }
                    Err(err) => return Err(Error::Socket(err)),
                };

                let reply = match Reply::decode(&self.recv_buf[..len]) {
                    Ok(reply) => reply,
                    Err(e) => {
                        log::warn!("Dropping malformed reply from {}: {}", self.peer, e);
                        continue;
                    }
                };
                if reply.psn != psn {
                    log::debug!(
                        "Dropping stale reply with psn {} while waiting for {}",
                        reply.psn,
                        psn
                    );
                    continue;
                }
                return Self::accept(command, reply);
            }
        }

        log::error!(
            "Giving up on {} at 0x{:08x} after {} attempts",
            opcode,
            address,
            attempts
        );
        Err(Error::Timeout {
            address,
            opcode,
            attempts,
        })
    }

    fn accept(command: Command, reply: Reply) -> Result<Box<[u32]>> {
        if reply.address != command.address {
            log::warn!(
                "Reply to psn {} echoed address 0x{:08x}, expected 0x{:08x}",
                reply.psn,
                reply.address,
                command.address
            );
        }
        let expected = if command.opcode.returns_payload() {
            command.value_count as usize
        } else {
            0
        };
        if reply.payload.len() != expected {
            return Err(Error::UnexpectedPayload {
                psn: reply.psn,
                expected,
                got: reply.payload.len(),
            });
        }
        log::trace!("Reply payload: {:08x?}", &reply.payload[..]);
        Ok(reply.payload)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod test {
    use std::{
        net::UdpSocket,
        thread,
        time::{Duration, Instant},
    };

    use ucp_protocol::{Command, Opcode, Reply};

    use crate::{BitwiseOp, Builder, Connection, Error};

    const MAX_WORDS: usize = 364;

    fn fake_board() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        socket
    }

    fn recv_command(board: &UdpSocket) -> (Command, std::net::SocketAddr) {
        let mut buf = [0u8; 2048];
        let (len, from) = board.recv_from(&mut buf).unwrap();
        (Command::decode(&buf[..len], MAX_WORDS).unwrap(), from)
    }

    fn connect(board: &UdpSocket, builder: Builder) -> Connection {
        builder.connect(board.local_addr().unwrap()).unwrap()
    }

    #[test]
    fn sequence_numbers_increase() {
        let board = fake_board();
        let mut conn = connect(&board, Builder::new());
        let handle = thread::spawn(move || {
            let mut psns = Vec::new();
            for _ in 0..3 {
                let (cmd, from) = recv_command(&board);
                psns.push(cmd.psn);
                board
                    .send_to(&Reply::ack(cmd.psn, cmd.address).encode(), from)
                    .unwrap();
            }
            psns
        });
        conn.write_words(0x10, &[1]).unwrap();
        conn.bitwise_update(0x10, 0xF0, BitwiseOp::Or).unwrap();
        conn.reset_board().unwrap();
        assert_eq!(handle.join().unwrap(), vec![0, 1, 2]);
        assert_eq!(conn.next_sequence_number(), 3);
    }

    #[test]
    fn timeout_after_configured_retries() {
        let board = fake_board();
        let mut conn = connect(
            &board,
            Builder::new()
                .timeout(Duration::from_millis(50))
                .retries(2),
        );
        match conn.read_words(0x40, 1) {
            Err(Error::Timeout {
                address,
                opcode,
                attempts,
            }) => {
                assert_eq!(address, 0x40);
                assert_eq!(opcode, Opcode::Read);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
        // every attempt carried the same sequence number
        let sent: Vec<Command> = (0..3).map(|_| recv_command(&board).0).collect();
        assert!(sent.iter().all(|cmd| cmd == &sent[0]));
        assert_eq!(sent[0].psn, 0);
        board
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        assert!(board.recv_from(&mut [0u8; 64]).is_err());
        // the next exchange uses a fresh sequence number
        assert_eq!(conn.next_sequence_number(), 1);
    }

    #[test]
    fn retry_reuses_sequence_number() {
        let board = fake_board();
        let mut conn = connect(
            &board,
            Builder::new()
                .timeout(Duration::from_millis(100))
                .retries(1),
        );
        let handle = thread::spawn(move || {
            let (first, _) = recv_command(&board);
            let (second, from) = recv_command(&board);
            board
                .send_to(
                    &Reply::with_payload(second.psn, second.address, vec![0xA5u32]).encode(),
                    from,
                )
                .unwrap();
            (first, second)
        });
        assert_eq!(conn.read_words(0x10, 1).unwrap(), vec![0xA5]);
        let (first, second) = handle.join().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn stale_replies_are_dropped() {
        let board = fake_board();
        let mut conn = connect(&board, Builder::new().retries(0));
        let handle = thread::spawn(move || {
            let (cmd, from) = recv_command(&board);
            let stale = Reply::with_payload(cmd.psn.wrapping_sub(1), cmd.address, vec![0xBADu32]);
            board.send_to(&stale.encode(), from).unwrap();
            board.send_to(&[0u8; 3], from).unwrap();
            let good = Reply::with_payload(cmd.psn, cmd.address, vec![0x600Du32]);
            board.send_to(&good.encode(), from).unwrap();
        });
        assert_eq!(conn.read_words(0x20, 1).unwrap(), vec![0x600D]);
        handle.join().unwrap();
    }

    #[test]
    fn stale_reply_alone_does_not_complete() {
        let board = fake_board();
        let mut conn = connect(
            &board,
            Builder::new()
                .timeout(Duration::from_millis(100))
                .retries(0),
        );
        let handle = thread::spawn(move || {
            let (cmd, from) = recv_command(&board);
            let stale = Reply::with_payload(cmd.psn + 7, cmd.address, vec![1u32]);
            board.send_to(&stale.encode(), from).unwrap();
        });
        assert!(matches!(
            conn.read_words(0x20, 1),
            Err(Error::Timeout { attempts: 1, .. })
        ));
        handle.join().unwrap();
    }

    #[test]
    fn stale_replies_do_not_extend_the_wait() {
        let board = fake_board();
        let mut conn = connect(
            &board,
            Builder::new()
                .timeout(Duration::from_millis(100))
                .retries(1),
        );
        let handle = thread::spawn(move || {
            let (cmd, from) = recv_command(&board);
            let stale =
                Reply::with_payload(cmd.psn.wrapping_sub(1), cmd.address, vec![0xBADu32]).encode();
            // a steady stream of wrong answers, well past both attempts
            let start = Instant::now();
            while start.elapsed() < Duration::from_millis(800) {
                board.send_to(&stale, from).unwrap();
                thread::sleep(Duration::from_millis(5));
            }
        });
        let start = Instant::now();
        assert!(matches!(
            conn.read_words(0x20, 1),
            Err(Error::Timeout { attempts: 2, .. })
        ));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(500), "waited {:?}", elapsed);
        handle.join().unwrap();
    }

    #[test]
    fn bits_outside_the_word_are_rejected() {
        let board = fake_board();
        let mut conn = connect(&board, Builder::new());
        assert!(matches!(
            conn.write_bit(0x10, 40, true),
            Err(Error::InvalidBit(40))
        ));
        assert!(matches!(
            conn.write_bit(0x10, 32, false),
            Err(Error::InvalidBit(32))
        ));
        assert_eq!(conn.next_sequence_number(), 0);
    }

    #[test]
    fn reads_are_split_and_reassembled() {
        let board = fake_board();
        let mut conn = connect(&board, Builder::new().max_words_per_packet(4));
        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for _ in 0..3 {
                let (cmd, from) = recv_command(&board);
                let payload: Vec<u32> = (0..cmd.value_count).map(|i| cmd.address + i).collect();
                board
                    .send_to(
                        &Reply::with_payload(cmd.psn, cmd.address, payload).encode(),
                        from,
                    )
                    .unwrap();
                requests.push((cmd.address, cmd.value_count));
            }
            requests
        });
        let values = conn.read_words(0x100, 10).unwrap();
        assert_eq!(values, (0x100..0x10A).collect::<Vec<u32>>());
        assert_eq!(
            handle.join().unwrap(),
            vec![(0x100, 4), (0x104, 4), (0x108, 2)]
        );
    }

    #[test]
    fn fifo_transfers_keep_address() {
        let board = fake_board();
        let mut conn = connect(&board, Builder::new().max_words_per_packet(2));
        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for _ in 0..2 {
                let (cmd, from) = recv_command(&board);
                board
                    .send_to(&Reply::ack(cmd.psn, cmd.address).encode(), from)
                    .unwrap();
                requests.push((cmd.opcode, cmd.address, cmd.payload));
            }
            requests
        });
        conn.fifo_write(0x50, &[1, 2, 3]).unwrap();
        let requests = handle.join().unwrap();
        assert_eq!(requests[0].0, Opcode::FifoWrite);
        assert_eq!(requests[0].1, 0x50);
        assert_eq!(requests[1].1, 0x50);
        assert_eq!(&*requests[0].2, &[1, 2]);
        assert_eq!(&*requests[1].2, &[3]);
    }

    #[test]
    fn partial_write_reports_first_failed_word() {
        let board = fake_board();
        let mut conn = connect(
            &board,
            Builder::new()
                .max_words_per_packet(2)
                .timeout(Duration::from_millis(50))
                .retries(0),
        );
        let handle = thread::spawn(move || {
            for _ in 0..2 {
                let (cmd, from) = recv_command(&board);
                board
                    .send_to(&Reply::ack(cmd.psn, cmd.address).encode(), from)
                    .unwrap();
            }
            // swallow the third packet
            recv_command(&board).0
        });
        let err = conn.write_words(0x0, &[1, 2, 3, 4, 5]).unwrap_err();
        assert_eq!(err.written, 4);
        assert!(matches!(err.source, Error::Timeout { address: 4, .. }));
        assert_eq!(&*handle.join().unwrap().payload, &[5]);
    }

    #[test]
    fn short_read_reply_is_rejected() {
        let board = fake_board();
        let mut conn = connect(&board, Builder::new());
        let handle = thread::spawn(move || {
            let (cmd, from) = recv_command(&board);
            board
                .send_to(
                    &Reply::with_payload(cmd.psn, cmd.address, vec![1u32]).encode(),
                    from,
                )
                .unwrap();
        });
        assert!(matches!(
            conn.read_words(0x0, 2),
            Err(Error::UnexpectedPayload {
                expected: 2,
                got: 1,
                ..
            })
        ));
        handle.join().unwrap();
    }

    #[test]
    fn empty_transfers_send_nothing() {
        let board = fake_board();
        let mut conn = connect(&board, Builder::new());
        assert!(conn.read_words(0x0, 0).unwrap().is_empty());
        conn.write_words(0x0, &[]).unwrap();
        assert_eq!(conn.next_sequence_number(), 0);
    }

    #[test]
    fn address_overflow_is_rejected() {
        let board = fake_board();
        let mut conn = connect(&board, Builder::new().max_words_per_packet(2));
        assert!(matches!(
            conn.read_words(u32::MAX - 1, 4),
            Err(Error::AddressOverflow { count: 4, .. })
        ));
        assert_eq!(conn.write_words(u32::MAX, &[1, 2]).unwrap_err().written, 0);
        // nothing reached the board
        assert_eq!(conn.next_sequence_number(), 0);
        assert_eq!(conn.read_words(u32::MAX, 0).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let board = fake_board();
        let mut conn = connect(&board, Builder::new());
        conn.disconnect();
        conn.disconnect();
        assert!(!conn.is_connected());
        assert!(matches!(conn.reset_board(), Err(Error::Disconnected)));
    }
}
