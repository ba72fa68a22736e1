//! # TPM Access
//!
//! Symbolic register access for FPGA digital boards.
//!
//! A [Board] combines a [register_map::RegisterMap], which names the registers of the
//! board level management and both FPGAs, with a UCP connection from the [ucp_client]
//! crate. Callers address registers by device and name; the board resolves the name,
//! checks the access against the register size and permission and only then talks to
//! the hardware.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use tpm_access::{Board, Device, register_map::RegisterMap};
//!
//! let map = RegisterMap::from_file("map.toml")?;
//! let mut board = Board::new(map);
//! board.connect("10.0.10.2:10000", ucp_client::Config::default())?;
//!
//! board.write_register(Device::Fpga1, "regfile.ctrl", &[0xA5], 0)?;
//! let coeffs = board.read_register(Device::Fpga1, "regfile.coeffs", 8, 0)?;
//! # Ok::<(), tpm_access::Error>(())
//! ```
//!
//! ## Firmware
//!
//! [Board::load_firmware_blocking] programs a firmware image into the flash of one device
//! and installs the register description shipped with it. [Board::load_firmware] does the
//! same on a background thread and reports progress through [Board::status].
mod types;

pub mod board;
pub mod error;
pub mod firmware;
pub mod protocol;
pub mod register_map;

pub use board::{Board, Update};
pub use error::{Error, Result};
pub use types::*;
