//! The capabilities a [Board](crate::Board) needs from its transport.
use ucp_client::{BitwiseOp, Connection, WriteError};

/// The address space a transfer targets, which selects the opcodes used for it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Space {
    Memory,
    Flash,
    /// Every word of a transfer goes to the same address
    Fifo,
}

/// Word level access to a board.
///
/// Implemented by [ucp_client::Connection]. Errors are transport errors, the register
/// checks happen before any of these methods is called.
pub trait Protocol: Send {
    fn read_words(&mut self, space: Space, address: u32, count: usize)
    -> ucp_client::Result<Vec<u32>>;

    /// Writes `values` starting at `address`.
    /// On failure, [WriteError::written] words reached the board.
    fn write_words(&mut self, space: Space, address: u32, values: &[u32])
    -> Result<(), WriteError>;

    fn bitwise_update(&mut self, address: u32, mask: u32, op: BitwiseOp)
    -> ucp_client::Result<()>;

    fn flash_erase(&mut self, address: u32, count: u32) -> ucp_client::Result<()>;

    fn reset_board(&mut self) -> ucp_client::Result<()>;

    fn wait_for_pps(&mut self) -> ucp_client::Result<()>;

    fn subscribe_periodic(&mut self, address: u32, count: u32) -> ucp_client::Result<()>;

    fn request_async_update(&mut self, address: u32, count: u32) -> ucp_client::Result<()>;

    fn cancel_update(&mut self, address: u32) -> ucp_client::Result<()>;

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}

impl Protocol for Connection {
    fn read_words(
        &mut self,
        space: Space,
        address: u32,
        count: usize,
    ) -> ucp_client::Result<Vec<u32>> {
        match space {
            Space::Memory => Connection::read_words(self, address, count),
            Space::Flash => self.flash_read(address, count),
            Space::Fifo => self.fifo_read(address, count),
        }
    }

    fn write_words(
        &mut self,
        space: Space,
        address: u32,
        values: &[u32],
    ) -> Result<(), WriteError> {
        match space {
            Space::Memory => Connection::write_words(self, address, values),
            Space::Flash => self.flash_write(address, values),
            Space::Fifo => self.fifo_write(address, values),
        }
    }

    fn bitwise_update(&mut self, address: u32, mask: u32, op: BitwiseOp) -> ucp_client::Result<()> {
        Connection::bitwise_update(self, address, mask, op)
    }

    fn flash_erase(&mut self, address: u32, count: u32) -> ucp_client::Result<()> {
        Connection::flash_erase(self, address, count)
    }

    fn reset_board(&mut self) -> ucp_client::Result<()> {
        Connection::reset_board(self)
    }

    fn wait_for_pps(&mut self) -> ucp_client::Result<()> {
        Connection::wait_for_pps(self)
    }

    fn subscribe_periodic(&mut self, address: u32, count: u32) -> ucp_client::Result<()> {
        Connection::subscribe_periodic(self, address, count)
    }

    fn request_async_update(&mut self, address: u32, count: u32) -> ucp_client::Result<()> {
        Connection::request_async_update(self, address, count)
    }

    fn cancel_update(&mut self, address: u32) -> ucp_client::Result<()> {
        Connection::cancel_update(self, address)
    }

    fn disconnect(&mut self) {
        Connection::disconnect(self)
    }

    fn is_connected(&self) -> bool {
        Connection::is_connected(self)
    }
}
