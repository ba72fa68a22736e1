use std::{
    future::Future,
    io,
    net::SocketAddr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio_util::codec::{Decoder, Encoder};
use ucp_protocol::{
    COMMAND_HEADER_SIZE, Command, MAX_DATAGRAM_SIZE, Opcode, REPLY_HEADER_SIZE, Reply, WORD_SIZE,
    framed::CommandCodec,
};

use crate::Backend;

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of datagrams at the start that are dropped without being executed
    pub drop_first: usize,
    /// Send a reply with the previous sequence number ahead of every reply
    pub stale_replies: bool,
    /// Size of the receive buffer. Longer datagrams are truncated and rejected.
    pub max_datagram: usize,
}

impl Config {
    /// Largest number of payload words accepted in one command
    pub fn max_words(&self) -> usize {
        self.max_datagram.saturating_sub(COMMAND_HEADER_SIZE) / WORD_SIZE
    }

    /// Largest number of payload words sent back in one reply
    pub fn max_reply_words(&self) -> usize {
        self.max_datagram.saturating_sub(REPLY_HEADER_SIZE) / WORD_SIZE
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            drop_first: 0,
            stale_replies: false,
            max_datagram: MAX_DATAGRAM_SIZE,
        }
    }
}

#[derive(Debug)]
pub struct Server<T: Backend> {
    backend: T,
    config: Config,
}

/// Builder to create a [Server] instance and modify configuration options
///
/// # Example
///
/// ```
/// use ucp_emulator::{RegisterFile, server::Builder};
///
/// let server = Builder::new()
///     .drop_first(2)
///     .stale_replies(true)
///     .build(RegisterFile::new());
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Drop the first `count` datagrams, as if they were lost on the network
    pub fn drop_first(mut self, count: usize) -> Self {
        self.config.drop_first = count;
        self
    }

    /// Precede every reply by one carrying an outdated sequence number
    pub fn stale_replies(mut self, enabled: bool) -> Self {
        self.config.stale_replies = enabled;
        self
    }

    /// Set the largest datagram this server is expected to receive
    pub fn max_datagram(mut self, size: usize) -> Self {
        self.config.max_datagram = size;
        self
    }

    /// Build and return the server
    pub fn build<T: Backend>(self, backend: T) -> Server<T> {
        Server::new(backend, self.config)
    }
}

impl<T: Backend> Server<T> {
    pub fn new(backend: T, config: Config) -> Server<T> {
        Server { backend, config }
    }

    /// Binds a socket to `addr` and serves it forever.
    pub async fn listen(self, addr: impl ToSocketAddrs) -> io::Result<()> {
        let socket = UdpSocket::bind(addr).await?;
        self.serve(socket).await
    }

    /// Answers commands arriving on `socket` until a socket error occurs.
    pub async fn serve(self, socket: UdpSocket) -> io::Result<()> {
        self.serve_until(socket, std::future::pending()).await
    }

    /// Answers commands arriving on `socket` until `shutdown` completes.
    pub async fn serve_until(
        mut self,
        socket: UdpSocket,
        shutdown: impl Future<Output = ()>,
    ) -> io::Result<()> {
        log::info!("Emulated board listening on {}", socket.local_addr()?);
        log::debug!(
            "Emulator config: drop_first={}, stale_replies={}, max_words={}",
            self.config.drop_first,
            self.config.stale_replies,
            self.config.max_words()
        );
        let mut codec = CommandCodec::new(self.config.max_words());
        let mut buf = vec![0u8; self.config.max_datagram];
        tokio::pin!(shutdown);

        loop {
            let (len, peer) = tokio::select! {
                received = socket.recv_from(&mut buf) => received?,
                _ = &mut shutdown => {
                    log::info!("Emulated board shutting down");
                    return Ok(());
                }
            };
            let command = match codec.decode(&mut BytesMut::from(&buf[..len])) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Dropping malformed command from {}: {}", peer, e);
                    continue;
                }
            };
            if self.config.drop_first > 0 {
                self.config.drop_first -= 1;
                log::debug!("Dropping psn {} from {}", command.psn, peer);
                continue;
            }
            if let Some(reply) = self.process_command(command).await
                && let Err(e) = self.send(&socket, &mut codec, reply, peer).await
            {
                log::warn!("Failed to send reply to {}: {}", peer, e);
            }
        }
    }

    async fn send(
        &self,
        socket: &UdpSocket,
        codec: &mut CommandCodec,
        reply: Reply,
        peer: SocketAddr,
    ) -> io::Result<()> {
        let mut datagram = BytesMut::new();
        if self.config.stale_replies {
            let stale = Reply {
                psn: reply.psn.wrapping_sub(1),
                address: reply.address,
                payload: reply.payload.clone(),
            };
            codec.encode(stale, &mut datagram)?;
            socket.send_to(&datagram, peer).await?;
            datagram.clear();
        }
        codec.encode(reply, &mut datagram)?;
        socket.send_to(&datagram, peer).await?;
        Ok(())
    }

    /// Executes a command on the backend. Returns `None` for commands that cannot be
    /// executed, which are left unanswered.
    async fn process_command(&self, command: Command) -> Option<Reply> {
        let Command {
            psn,
            opcode,
            value_count,
            address,
            payload,
        } = command;
        log::debug!(
            "Received {}: psn={}, address=0x{:08x}, value_count={}",
            opcode,
            psn,
            address,
            value_count
        );
        if !payload.is_empty() {
            log::trace!("Command payload: {:08x?}", &payload[..]);
        }
        if opcode.returns_payload() && value_count as usize > self.config.max_reply_words() {
            log::warn!(
                "{} of {} words does not fit into a reply, ignoring psn {}",
                opcode,
                value_count,
                psn
            );
            return None;
        }

        let data = match opcode {
            Opcode::Read => Some(self.backend.read(address, value_count)),
            Opcode::FlashRead => Some(self.backend.flash_read(address, value_count)),
            Opcode::FifoRead => Some(self.backend.fifo_read(address, value_count)),
            Opcode::Write => {
                self.backend.write(address, &payload);
                None
            }
            Opcode::FlashWrite => {
                self.backend.flash_write(address, &payload);
                None
            }
            Opcode::FifoWrite => {
                self.backend.fifo_write(address, &payload);
                None
            }
            Opcode::BitwiseAnd | Opcode::BitwiseOr => {
                let Some(&mask) = payload.first() else {
                    log::warn!("{} without mask, ignoring psn {}", opcode, psn);
                    return None;
                };
                if opcode == Opcode::BitwiseAnd {
                    self.backend.and(address, mask);
                } else {
                    self.backend.or(address, mask);
                }
                None
            }
            Opcode::BitWrite => {
                let [bit, value] = payload[..] else {
                    log::warn!(
                        "{} needs bit and value, got {} words, ignoring psn {}",
                        opcode,
                        payload.len(),
                        psn
                    );
                    return None;
                };
                self.backend.write_bit(address, bit, value != 0);
                None
            }
            Opcode::FlashErase => {
                self.backend.flash_erase(address, value_count);
                None
            }
            Opcode::ResetBoard => {
                log::info!("Resetting emulated board");
                self.backend.reset();
                None
            }
            Opcode::PeriodicUpdate | Opcode::AsyncUpdate => {
                self.backend
                    .subscribe(address, value_count, opcode == Opcode::PeriodicUpdate);
                None
            }
            Opcode::CancelUpdate => {
                self.backend.cancel_update(address);
                None
            }
            Opcode::WaitForPps => {
                tokio::time::sleep(until_next_second()).await;
                None
            }
        };

        Some(match data {
            Some(data) => {
                log::trace!("Reply payload: {:08x?}", &data[..]);
                Reply::with_payload(psn, address, data)
            }
            None => Reply::ack(psn, address),
        })
    }
}

/// Time until the next full second of the system clock, where the emulated PPS edge is
fn until_next_second() -> Duration {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Duration::from_secs(1) - Duration::from_nanos(u64::from(since_epoch.subsec_nanos()))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::{net::UdpSocket, sync::oneshot, time::timeout};
    use ucp_protocol::{Command, Opcode, Reply};

    use super::*;
    use crate::RegisterFile;

    async fn start(builder: Builder, registers: RegisterFile) -> (UdpSocket, oneshot::Sender<()>) {
        let board = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(board.local_addr().unwrap()).await.unwrap();
        let (stop, stopped) = oneshot::channel();
        let server = builder.build(registers);
        tokio::spawn(async move {
            server
                .serve_until(board, async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });
        (client, stop)
    }

    async fn exchange(client: &UdpSocket, command: Command) -> Reply {
        client.send(&command.encode()).await.unwrap();
        recv(client).await
    }

    async fn recv(client: &UdpSocket) -> Reply {
        let mut buf = [0u8; 2048];
        let len = timeout(Duration::from_secs(5), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        Reply::decode(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn read_and_write() {
        let registers = RegisterFile::new();
        let (client, _stop) = start(Builder::new(), registers.clone()).await;

        let ack = exchange(
            &client,
            Command::with_payload(0, Opcode::Write, 0x10, &[0xA5, 0x5A]),
        )
        .await;
        assert_eq!(ack, Reply::ack(0, 0x10));
        assert_eq!(registers.word(0x11), 0x5A);

        let reply = exchange(&client, Command::new(1, Opcode::Read, 0x10, 2)).await;
        assert_eq!(reply.psn, 1);
        assert_eq!(reply.address, 0x10);
        assert_eq!(&*reply.payload, &[0xA5, 0x5A]);
    }

    #[tokio::test]
    async fn bit_operations() {
        let registers = RegisterFile::new();
        registers.load(0x20, &[0xFF]);
        let (client, _stop) = start(Builder::new(), registers.clone()).await;

        exchange(&client, Command::with_payload(7, Opcode::BitwiseAnd, 0x20, &[0x0F])).await;
        exchange(&client, Command::with_payload(8, Opcode::BitwiseOr, 0x20, &[0x100])).await;
        exchange(&client, Command::with_payload(9, Opcode::BitWrite, 0x20, &[0, 0])).await;
        assert_eq!(registers.word(0x20), 0x10E);
    }

    #[tokio::test]
    async fn malformed_commands_are_ignored() {
        let (client, _stop) = start(Builder::new(), RegisterFile::new()).await;
        client.send(&[0u8; 5]).await.unwrap();
        // bit write without payload words
        client
            .send(&Command::new(3, Opcode::BitWrite, 0x0, 0).encode())
            .await
            .unwrap();
        let reply = exchange(&client, Command::new(4, Opcode::ResetBoard, 0, 0)).await;
        assert_eq!(reply.psn, 4);
    }

    #[tokio::test]
    async fn drops_first_datagrams() {
        let (client, _stop) = start(Builder::new().drop_first(2), RegisterFile::new()).await;
        let command = Command::new(0, Opcode::Read, 0x0, 1).encode();
        for _ in 0..3 {
            client.send(&command).await.unwrap();
        }
        let reply = recv(&client).await;
        assert_eq!(reply.psn, 0);
        let mut buf = [0u8; 64];
        assert!(
            timeout(Duration::from_millis(100), client.recv(&mut buf))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn stale_reply_comes_first() {
        let (client, _stop) = start(Builder::new().stale_replies(true), RegisterFile::new()).await;
        client
            .send(&Command::new(5, Opcode::Read, 0x0, 1).encode())
            .await
            .unwrap();
        assert_eq!(recv(&client).await.psn, 4);
        assert_eq!(recv(&client).await.psn, 5);
    }

    #[tokio::test]
    async fn fifo_and_flash() {
        let registers = RegisterFile::new();
        let (client, _stop) = start(Builder::new(), registers.clone()).await;
        exchange(&client, Command::with_payload(0, Opcode::FifoWrite, 0x30, &[1, 2, 3])).await;
        let reply = exchange(&client, Command::new(1, Opcode::FifoRead, 0x30, 2)).await;
        assert_eq!(&*reply.payload, &[1, 2]);
        assert_eq!(registers.fifo_len(0x30), 1);

        exchange(&client, Command::with_payload(2, Opcode::FlashWrite, 0x0, &[0x1234])).await;
        let reply = exchange(&client, Command::new(3, Opcode::FlashRead, 0x0, 2)).await;
        assert_eq!(&*reply.payload, &[0x1234, u32::MAX]);
        exchange(&client, Command::new(4, Opcode::FlashErase, 0x0, 1)).await;
        assert_eq!(registers.flash_word(0x0), u32::MAX);
    }

    #[tokio::test]
    async fn shutdown() {
        let board = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = Builder::new().build(RegisterFile::new());
        let result = timeout(
            Duration::from_secs(5),
            server.serve_until(board, async {}),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn oversized_reads_are_ignored() {
        let registers = RegisterFile::new();
        registers.load(0x0, &[0xA5]);
        let (client, _stop) = start(Builder::new().max_datagram(1472), registers).await;
        for (psn, opcode, count) in [
            (0, Opcode::Read, 400),
            (1, Opcode::FlashRead, u32::MAX),
            (2, Opcode::FifoRead, 1000),
        ] {
            client
                .send(&Command::new(psn, opcode, 0x0, count).encode())
                .await
                .unwrap();
        }
        // the server is still answering, and nothing came back for the large reads
        let reply = exchange(&client, Command::new(3, Opcode::Read, 0x0, 1)).await;
        assert_eq!(reply.psn, 3);
        assert_eq!(&*reply.payload, &[0xA5]);
    }

    #[test]
    fn max_words_follow_datagram_size() {
        assert_eq!(Builder::new().max_datagram(1472).config.max_words(), 364);
        assert_eq!(Builder::new().max_datagram(1472).config.max_reply_words(), 366);
        assert_eq!(Config::default().max_words(), 16372);
        assert_eq!(Config::default().max_reply_words(), 16374);
    }
}
