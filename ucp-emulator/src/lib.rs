//! # UCP Emulator
//!
//! This crate answers UCP commands the way the control processor of an FPGA digital
//! board does, so that clients can be developed and tested without hardware.
//!
//! ## Architecture
//!
//! - **[`Backend`] Trait**: Defines the memory operations a board executes for each opcode
//! - **[`RegisterFile`]**: An in-memory backend with separate memory, flash and FIFO spaces
//! - **[`server::Server`]**: Receives datagrams, decodes the commands, dispatches them to
//!   the backend and sends the replies
//!
//! ## Basic Usage
//!
//! ```no_run
//! use ucp_emulator::{RegisterFile, server::Builder};
//!
//! # async fn run() -> std::io::Result<()> {
//! let registers = RegisterFile::new();
//! registers.load(0x10, &[0xA5]);
//!
//! let server = Builder::new().build(registers.clone());
//! server.listen("127.0.0.1:10000").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Fault Injection
//!
//! [`server::Config`] can drop the first datagrams and send stale replies ahead of every
//! real one. Both exercise the retry and sequence number handling of clients.
//!
//! ## Error Handling
//!
//! UCP has no error replies. Commands that cannot be executed, for example a bitwise
//! update without a mask, are logged and left unanswered so that the client times out.
mod register_file;
pub mod server;

pub use register_file::RegisterFile;

/// Operations a board executes on behalf of UCP commands.
///
/// Addresses count 32 bit words. Methods take `&self`, implementations that keep state
/// use interior mutability.
pub trait Backend {
    /// Read `count` words starting at `address`.
    fn read(&self, address: u32, count: u32) -> Box<[u32]>;

    /// Write `values` to consecutive words starting at `address`.
    fn write(&self, address: u32, values: &[u32]);

    /// AND the word at `address` with `mask`.
    fn and(&self, address: u32, mask: u32);

    /// OR the word at `address` with `mask`.
    fn or(&self, address: u32, mask: u32);

    /// Set or clear bit `bit` of the word at `address`.
    fn write_bit(&self, address: u32, bit: u32, value: bool) {
        let mask = 1u32 << (bit % 32);
        if value {
            self.or(address, mask);
        } else {
            self.and(address, !mask);
        }
    }

    fn flash_read(&self, address: u32, count: u32) -> Box<[u32]>;

    fn flash_write(&self, address: u32, values: &[u32]);

    /// Erase `count` words of flash starting at `address`.
    fn flash_erase(&self, address: u32, count: u32);

    /// Pop exactly `count` words from the FIFO at `address`.
    fn fifo_read(&self, address: u32, count: u32) -> Box<[u32]>;

    fn fifo_write(&self, address: u32, values: &[u32]);

    /// Return the board to its power-on state.
    fn reset(&self);

    /// Subscribe to updates of `count` words at `address`.
    fn subscribe(&self, address: u32, count: u32, periodic: bool) {
        log::debug!(
            "Ignoring {} subscription of {} words at 0x{:08x}",
            if periodic { "periodic" } else { "one-shot" },
            count,
            address
        );
    }

    fn cancel_update(&self, address: u32) {
        log::debug!("Ignoring cancellation at 0x{:08x}", address);
    }
}
