//! Error types for register access

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::types::{Access, Device, Permission, ResultCode};

/// Result type alias for register access
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving or accessing a register
#[derive(Debug, Error)]
pub enum Error {
    /// No register with this name on the device
    #[error("Unknown register {device}.{name}")]
    UnknownRegister { device: Device, name: String },

    /// The access does not fit into the register
    #[error(
        "Access of {count} words at offset {offset} exceeds register {register} of {size} words"
    )]
    OutOfBounds {
        register: String,
        offset: usize,
        count: usize,
        size: u32,
    },

    /// Reading a write-only or writing a read-only register
    #[error("Cannot {access} register {register}, it is {permission}")]
    PermissionDenied {
        register: String,
        permission: Permission,
        access: Access,
    },

    /// The register description is inconsistent
    #[error("Malformed register map: {0}")]
    MalformedMap(String),

    /// The register description could not be read
    #[error("Failed to read register map {path}: {source}")]
    MapFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The register description is not valid TOML or misses fields
    #[error("Failed to parse register map: {0}")]
    MapSyntax(#[from] toml::de::Error),

    /// The firmware image could not be read
    #[error("Failed to read firmware image {path}: {source}")]
    FirmwareFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid firmware image: {0}")]
    InvalidFirmware(String),

    /// The flash did not report the programmed image
    #[error("Firmware for {device} did not verify at flash address 0x{address:08x}")]
    FirmwareVerify { device: Device, address: u32 },

    /// The background firmware load ended without a result
    #[error("Loading firmware for {0} was aborted")]
    LoadAborted(Device),

    /// A fatal transport error closed the connection
    #[error("Connection to the board was lost: {0}")]
    ConnectionLost(String),

    #[error("Board is not connected")]
    NotConnected,

    /// Opening the socket failed
    #[error("Failed to connect: {0}")]
    Connect(#[source] io::Error),

    /// An exchange with the board failed
    #[error(transparent)]
    Communication(#[from] ucp_client::Error),

    /// A multi-word write was aborted. Words before `index` were written.
    #[error("Write to {register} failed at word {index}: {source}")]
    WriteFailed {
        register: String,
        index: usize,
        #[source]
        source: ucp_client::Error,
    },
}

impl Error {
    /// Maps the error onto the result code vocabulary.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Error::UnknownRegister { .. } => ResultCode::UnknownRegister,
            Error::OutOfBounds { .. } => ResultCode::OutOfBounds,
            Error::PermissionDenied { .. } => ResultCode::PermissionDenied,
            Error::NotConnected => ResultCode::NotConnected,
            Error::Connect(_) | Error::ConnectionLost(_) => ResultCode::SocketError,
            Error::Communication(source) | Error::WriteFailed { source, .. } => {
                transport_code(source)
            }
            Error::MalformedMap(_)
            | Error::MapFile { .. }
            | Error::MapSyntax(_)
            | Error::FirmwareFile { .. }
            | Error::InvalidFirmware(_)
            | Error::FirmwareVerify { .. }
            | Error::LoadAborted(_) => ResultCode::Failure,
        }
    }

    /// The transport error behind this error, if any.
    pub fn transport(&self) -> Option<&ucp_client::Error> {
        match self {
            Error::Communication(source) | Error::WriteFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn transport_code(error: &ucp_client::Error) -> ResultCode {
    match error {
        ucp_client::Error::Timeout { .. } => ResultCode::Timeout,
        ucp_client::Error::Socket(_) => ResultCode::SocketError,
        ucp_client::Error::Disconnected => ResultCode::NotConnected,
        ucp_client::Error::UnexpectedPayload { .. }
        | ucp_client::Error::AddressOverflow { .. }
        | ucp_client::Error::InvalidBit(_) => ResultCode::Failure,
    }
}
