//! # UCP Protocol Library
//!
//! This crate provides a Rust implementation of UCP, the UDP based register access
//! protocol spoken by the firmware of FPGA digital boards such as the Tile Processing Module (TPM).
//!
//! ## Overview
//!
//! A client sends a [`Command`] datagram to the board and the board answers every command
//! with exactly one [`Reply`]. Replies are matched to commands through the packet
//! sequence number (PSN). This library implements the packet format, allowing you to:
//!
//! - Encode and decode commands and replies bit-exact
//! - Classify opcodes (payload carrying, payload returning, address incrementing)
//! - Derive the maximum payload per packet from the link MTU
//!
//! ## Basic Usage
//!
//! ### Encoding a Read Command
//!
//! ```
//! use ucp_protocol::{Command, Opcode};
//!
//! // Read 4 words starting at address 0x100
//! let cmd = Command::new(1, Opcode::Read, 0x100, 4);
//! let datagram = cmd.encode();
//! assert_eq!(
//!     datagram,
//!     b"\x00\x00\x00\x01\x00\x00\x00\x01\x00\x00\x00\x04\x00\x00\x01\x00"
//! );
//! ```
//!
//! ### Decoding a Reply
//!
//! ```
//! use ucp_protocol::Reply;
//!
//! let datagram = b"\x00\x00\x00\x01\x00\x00\x01\x00\x00\x00\x00\xA5";
//! let reply = Reply::decode(datagram).expect("Reply should parse");
//! assert_eq!(reply.psn, 1);
//! assert_eq!(reply.address, 0x100);
//! assert_eq!(&*reply.payload, &[0xA5]);
//! ```
//!
//! ## Packet Format
//!
//! All fields are 32 bit words in network byte order, without padding:
//!
//! - **Command**: `<psn><opcode><value_count><address>[payload; value_count]`
//!   The payload is only present for write-class opcodes.
//! - **Reply**: `<psn><address>[payload; value_count]`
//!   The payload is only present for read-class opcodes.
//!
//! ## Features
//!
//! - `tokio`: [`tokio_util::codec`] implementations for use with async UDP sockets.
//!
//! ## Error Handling
//!
//! This library uses the [`error::DecodeError`] type for packet parsing errors.
pub mod protocol;
pub use protocol::*;
pub mod codec;
pub mod error;
#[cfg(feature = "tokio")]
pub mod framed;
