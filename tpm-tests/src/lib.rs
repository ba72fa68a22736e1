//! Test harness shared by the integration tests.
//!
//! [Emulator] runs a [ucp_emulator::server::Server] on a background thread with its own
//! tokio runtime, so that the blocking clients can be tested against it from plain
//! `#[test]` functions. [FakeBoard] answers a fixed number of commands and records every
//! command it receives, for tests that look at the packets themselves.
use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::mpsc,
    thread::{self, JoinHandle},
    time::Duration,
};

use tokio::sync::oneshot;
use tpm_access::register_map::RegisterMap;
use ucp_emulator::{RegisterFile, server::Builder};
use ucp_protocol::{Command, Reply};

/// Register map used throughout the tests.
pub const MAP: &str = r#"
    [[device]]
    name = "fpga1"

    [[device.register]]
    name = "regfile.ctrl"
    address = 0x10

    [[device.register]]
    name = "regfile.status"
    address = 0x14
    permission = "r"

    [[device.register]]
    name = "regfile.coeffs"
    address = 0x100
    count = 8

    [[device.register]]
    name = "regfile.mode"
    address = 0x18
    kind = "bitfield"
    bitmask = 0x0000_FF00

    [[device.register]]
    name = "regfile.samples"
    address = 0x200
    count = 1024
    kind = "fifo"

    [[device]]
    name = "board"

    [[device.register]]
    name = "config"
    address = 0x0
    count = 16
    kind = "flash"
"#;

pub fn register_map() -> RegisterMap {
    match RegisterMap::load(MAP) {
        Ok(map) => map,
        Err(e) => panic!("test register map is invalid: {}", e),
    }
}

/// An emulated board serving on an ephemeral localhost port.
/// The server stops when this is dropped.
pub struct Emulator {
    addr: SocketAddr,
    registers: RegisterFile,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Emulator {
    pub fn start() -> io::Result<Emulator> {
        Emulator::with_builder(Builder::new())
    }

    pub fn with_builder(builder: Builder) -> io::Result<Emulator> {
        let registers = RegisterFile::new();
        let server = builder.build(registers.clone());
        let (ready, bound) = mpsc::channel();
        let (stop, stopped) = oneshot::channel::<()>();

        let thread = thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready.send(Err(e));
                    return;
                }
            };
            runtime.block_on(async move {
                let socket = match tokio::net::UdpSocket::bind("127.0.0.1:0").await {
                    Ok(socket) => socket,
                    Err(e) => {
                        let _ = ready.send(Err(e));
                        return;
                    }
                };
                let _ = ready.send(socket.local_addr());
                let shutdown = async {
                    let _ = stopped.await;
                };
                if let Err(e) = server.serve_until(socket, shutdown).await {
                    log::error!("Emulator stopped: {}", e);
                }
            });
        });

        let addr = bound
            .recv()
            .map_err(|_| io::Error::other("emulator thread exited early"))??;
        Ok(Emulator {
            addr,
            registers,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Handle to the memory of the emulated board
    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A board that acknowledges the first `answer` commands and then goes silent.
///
/// Read-class commands are answered with the word addresses as values. The thread
/// returns every command it received once no command arrived for `idle`.
pub struct FakeBoard {
    addr: SocketAddr,
    thread: JoinHandle<Vec<Command>>,
}

impl FakeBoard {
    pub fn spawn(answer: usize, idle: Duration) -> io::Result<FakeBoard> {
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        socket.set_read_timeout(Some(idle))?;
        let addr = socket.local_addr()?;
        let thread = thread::spawn(move || {
            let mut commands = Vec::new();
            let mut buf = [0u8; 65_536];
            while let Ok((len, from)) = socket.recv_from(&mut buf) {
                let Ok(command) = Command::decode(&buf[..len], 16_384) else {
                    continue;
                };
                if commands.len() < answer {
                    let reply = if command.opcode.returns_payload() {
                        let payload: Vec<u32> = (0..command.value_count)
                            .map(|i| {
                                if command.opcode.increments_address() {
                                    command.address.wrapping_add(i)
                                } else {
                                    command.address
                                }
                            })
                            .collect();
                        Reply::with_payload(command.psn, command.address, payload)
                    } else {
                        Reply::ack(command.psn, command.address)
                    };
                    let _ = socket.send_to(&reply.encode(), from);
                }
                commands.push(command);
            }
            commands
        });
        Ok(FakeBoard { addr, thread })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Waits until the board went idle and returns the commands it received.
    pub fn commands(self) -> Vec<Command> {
        self.thread.join().unwrap_or_default()
    }
}
