use std::{fmt::Display, str::FromStr};

use serde::Deserialize;

/// A device on the board that owns registers.
///
/// The numeric values match the device identifiers used by the control software.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum Device {
    /// Board level registers (CPLD, sensors, management)
    Board = 1,
    Fpga1 = 2,
    Fpga2 = 4,
}

impl Device {
    pub const ALL: [Device; 3] = [Device::Board, Device::Fpga1, Device::Fpga2];

    pub fn name(&self) -> &'static str {
        match self {
            Device::Board => "board",
            Device::Fpga1 => "fpga1",
            Device::Fpga2 => "fpga2",
        }
    }

    /// Splits a qualified name like `fpga1.regfile.ctrl` into device and register name.
    pub fn split_qualified(name: &str) -> Option<(Device, &str)> {
        let (device, register) = name.split_once('.')?;
        Some((device.parse().ok()?, register))
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "board" => Ok(Device::Board),
            "fpga1" => Ok(Device::Fpga1),
            "fpga2" => Ok(Device::Fpga2),
            other => Err(format!("Unknown device '{}'", other)),
        }
    }
}

impl From<Device> for u32 {
    fn from(value: Device) -> Self {
        value as u32
    }
}

/// Access rights of a register.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Deserialize)]
#[repr(u32)]
pub enum Permission {
    #[serde(rename = "r")]
    Read = 1,
    #[serde(rename = "w")]
    Write = 2,
    #[default]
    #[serde(rename = "rw")]
    ReadWrite = 3,
}

impl Permission {
    pub fn readable(&self) -> bool {
        matches!(self, Permission::Read | Permission::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, Permission::Write | Permission::ReadWrite)
    }
}

impl Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Permission::Read => "read-only",
            Permission::Write => "write-only",
            Permission::ReadWrite => "read-write",
        })
    }
}

/// Direction of a register access, checked against the register [Permission].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Access {
    Read,
    Write,
}

impl Access {
    pub fn permitted_by(self, permission: Permission) -> bool {
        match self {
            Access::Read => permission.readable(),
            Access::Write => permission.writable(),
        }
    }
}

impl Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Access::Read => "read",
            Access::Write => "write",
        })
    }
}

/// How a register is backed on the board, which decides the opcodes used to access it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Memory mapped words
    #[default]
    Plain,
    /// Persistent storage, accessed through the flash opcodes
    Flash,
    /// A streaming queue. Every word of a transfer targets the same address.
    Fifo,
    /// A field within a word, selected by the register bitmask
    #[serde(rename = "bitfield")]
    BitField,
}

impl Display for RegisterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RegisterKind::Plain => "plain",
            RegisterKind::Flash => "flash",
            RegisterKind::Fifo => "fifo",
            RegisterKind::BitField => "bitfield",
        })
    }
}

/// Connection state of a board as seen by the caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Status {
    NotConnected,
    Connected,
    /// A firmware is being programmed in the background
    LoadingFirmware,
    /// The connection broke, or loading firmware failed. The cause is available from
    /// [crate::Board::take_error].
    Error,
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Status::NotConnected => "not connected",
            Status::Connected => "connected",
            Status::LoadingFirmware => "loading firmware",
            Status::Error => "error",
        })
    }
}

/// Outcome of an operation in the vocabulary shared with remote services.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ResultCode {
    Success,
    OutOfBounds,
    Timeout,
    PermissionDenied,
    UnknownRegister,
    SocketError,
    NotConnected,
    Failure,
}

impl<T> From<&crate::Result<T>> for ResultCode {
    fn from(value: &crate::Result<T>) -> Self {
        match value {
            Ok(_) => ResultCode::Success,
            Err(err) => err.result_code(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn qualified_names() {
        assert_eq!(
            Device::split_qualified("fpga1.regfile.ctrl"),
            Some((Device::Fpga1, "regfile.ctrl"))
        );
        assert_eq!(
            Device::split_qualified("BOARD.temp"),
            Some((Device::Board, "temp"))
        );
        assert_eq!(Device::split_qualified("regfile.ctrl"), None);
        assert_eq!(Device::split_qualified("fpga1"), None);
    }

    #[test]
    fn device_numbering() {
        assert_eq!(u32::from(Device::Board), 1);
        assert_eq!(u32::from(Device::Fpga1), 2);
        assert_eq!(u32::from(Device::Fpga2), 4);
    }

    #[test]
    fn permissions() {
        assert!(Permission::Read.readable());
        assert!(!Permission::Read.writable());
        assert!(!Permission::Write.readable());
        assert!(Permission::ReadWrite.writable());
        assert_eq!(Permission::default(), Permission::ReadWrite);
    }

    #[test]
    fn access_against_permission() {
        assert!(Access::Read.permitted_by(Permission::Read));
        assert!(!Access::Write.permitted_by(Permission::Read));
        assert!(!Access::Read.permitted_by(Permission::Write));
        assert!(Access::Write.permitted_by(Permission::ReadWrite));
        assert_eq!(Access::Write.to_string(), "write");
    }
}
