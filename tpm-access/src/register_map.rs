//! Static description of the registers of a board.
//!
//! A [RegisterMap] resolves symbolic `(device, name)` pairs to addresses and rejects
//! accesses outside a register before anything is sent to the board.
//!
//! ## File Format
//!
//! Register maps are described in TOML, grouped by device:
//!
//! ```toml
//! [[device]]
//! name = "fpga1"
//!
//! [[device.register]]
//! name = "regfile.ctrl"
//! address = 0x10
//! permission = "rw"
//!
//! [[device.register]]
//! name = "regfile.coeffs"
//! address = 0x100
//! count = 8
//! description = "Equaliser coefficients"
//! ```
//!
//! `count` defaults to 1, `permission` to `"rw"` and `kind` to `"plain"`.
//! Bit-field registers (`kind = "bitfield"`) require a `bitmask`.
use std::{collections::HashMap, path::Path};

use serde::Deserialize;

use crate::{
    error::{Error, Result},
    types::{Device, Permission, RegisterKind},
};

/// Metadata of one named register.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegisterDescriptor {
    device: Device,
    name: String,
    address: u32,
    element_count: u32,
    permission: Permission,
    kind: RegisterKind,
    bitmask: u32,
    description: String,
}

impl RegisterDescriptor {
    pub fn new(
        device: Device,
        name: impl Into<String>,
        address: u32,
        element_count: u32,
        permission: Permission,
        kind: RegisterKind,
    ) -> RegisterDescriptor {
        RegisterDescriptor {
            device,
            name: name.into(),
            address,
            element_count,
            permission,
            kind,
            bitmask: u32::MAX,
            description: String::new(),
        }
    }

    pub fn with_bitmask(mut self, bitmask: u32) -> Self {
        self.bitmask = bitmask;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name including the device, e.g. `fpga1.regfile.ctrl`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.device, self.name)
    }

    /// Address of the first word
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Number of 32 bit words in the register
    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn kind(&self) -> RegisterKind {
        self.kind
    }

    /// Bits of each word that belong to the register. All ones unless it is a bit-field.
    pub fn bitmask(&self) -> u32 {
        self.bitmask
    }

    /// Position of the lowest bit of the bitmask
    pub fn shift(&self) -> u32 {
        self.bitmask.trailing_zeros() % 32
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// One past the last address of the register
    fn end(&self) -> u64 {
        u64::from(self.address) + u64::from(self.element_count)
    }

    /// Checks that `count` words starting `offset` words into the register lie within it.
    pub fn validate(&self, offset: usize, count: usize) -> Result<()> {
        match offset.checked_add(count) {
            Some(end) if end <= self.element_count as usize => Ok(()),
            _ => Err(Error::OutOfBounds {
                register: self.qualified_name(),
                offset,
                count,
                size: self.element_count,
            }),
        }
    }

    fn check_consistency(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::MalformedMap(format!(
                "register at 0x{:08x} on {} has no name",
                self.address, self.device
            )));
        }
        if self.element_count == 0 {
            return Err(Error::MalformedMap(format!(
                "{} has no words",
                self.qualified_name()
            )));
        }
        if self.end() > u64::from(u32::MAX) + 1 {
            return Err(Error::MalformedMap(format!(
                "{} extends past the end of the address space",
                self.qualified_name()
            )));
        }
        if self.kind == RegisterKind::BitField && self.bitmask == 0 {
            return Err(Error::MalformedMap(format!(
                "bit-field {} has an empty bitmask",
                self.qualified_name()
            )));
        }
        Ok(())
    }

    /// Whether two registers of the same device may occupy overlapping addresses.
    /// Only bit-fields of the same words with disjoint masks can share space.
    fn may_share_with(&self, other: &RegisterDescriptor) -> bool {
        self.kind == RegisterKind::BitField
            && other.kind == RegisterKind::BitField
            && self.address == other.address
            && self.element_count == other.element_count
            && self.bitmask & other.bitmask == 0
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MapFile {
    #[serde(default, rename = "device")]
    devices: Vec<DeviceSection>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceSection {
    name: Device,
    #[serde(default, rename = "register")]
    registers: Vec<RegisterEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterEntry {
    name: String,
    address: u32,
    #[serde(default = "default_count")]
    count: u32,
    #[serde(default)]
    permission: Permission,
    #[serde(default)]
    kind: RegisterKind,
    bitmask: Option<u32>,
    #[serde(default)]
    description: String,
}

fn default_count() -> u32 {
    1
}

/// The registers of a board, ordered by device and address.
#[derive(Clone, Debug, Default)]
pub struct RegisterMap {
    registers: Vec<RegisterDescriptor>,
    index: HashMap<Device, HashMap<String, usize>>,
}

impl RegisterMap {
    /// Parses a register map from its TOML description.
    pub fn load(source: &str) -> Result<RegisterMap> {
        let file: MapFile = toml::from_str(source)?;
        let mut registers = Vec::new();
        for section in file.devices {
            for entry in section.registers {
                let mut descriptor = RegisterDescriptor::new(
                    section.name,
                    entry.name,
                    entry.address,
                    entry.count,
                    entry.permission,
                    entry.kind,
                )
                .with_description(entry.description);
                if let Some(bitmask) = entry.bitmask {
                    descriptor = descriptor.with_bitmask(bitmask);
                } else if entry.kind == RegisterKind::BitField {
                    return Err(Error::MalformedMap(format!(
                        "bit-field {} needs a bitmask",
                        descriptor.qualified_name()
                    )));
                }
                registers.push(descriptor);
            }
        }
        RegisterMap::from_descriptors(registers)
    }

    /// Reads and parses a register map file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<RegisterMap> {
        let path = path.as_ref();
        log::debug!("Loading register map from {}", path.display());
        let source = std::fs::read_to_string(path).map_err(|source| Error::MapFile {
            path: path.to_owned(),
            source,
        })?;
        let map = RegisterMap::load(&source)?;
        log::info!(
            "Loaded {} registers from {}",
            map.len(),
            path.display()
        );
        Ok(map)
    }

    /// Builds a map from descriptors, rejecting duplicates and overlapping address ranges.
    pub fn from_descriptors(mut registers: Vec<RegisterDescriptor>) -> Result<RegisterMap> {
        registers.sort_by(|a, b| {
            (a.device, a.address, &a.name).cmp(&(b.device, b.address, &b.name))
        });

        let mut index: HashMap<Device, HashMap<String, usize>> = HashMap::new();
        for (i, register) in registers.iter().enumerate() {
            register.check_consistency()?;
            let names = index.entry(register.device).or_default();
            if names.insert(register.name.clone(), i).is_some() {
                return Err(Error::MalformedMap(format!(
                    "{} is defined more than once",
                    register.qualified_name()
                )));
            }
        }

        for (i, register) in registers.iter().enumerate() {
            let end = register.end();
            let overlapping = registers[i + 1..]
                .iter()
                .take_while(|other| {
                    other.device == register.device && u64::from(other.address) < end
                });
            for other in overlapping {
                if !register.may_share_with(other) {
                    return Err(Error::MalformedMap(format!(
                        "{} overlaps {}",
                        register.qualified_name(),
                        other.qualified_name()
                    )));
                }
            }
        }

        Ok(RegisterMap { registers, index })
    }

    /// Looks up a register by device and name.
    pub fn resolve(&self, device: Device, name: &str) -> Result<&RegisterDescriptor> {
        self.index
            .get(&device)
            .and_then(|names| names.get(name))
            .map(|&i| &self.registers[i])
            .ok_or_else(|| Error::UnknownRegister {
                device,
                name: name.to_owned(),
            })
    }

    /// Checks that an access of `count` words at `offset` fits into `descriptor`.
    pub fn validate(descriptor: &RegisterDescriptor, offset: usize, count: usize) -> Result<()> {
        descriptor.validate(offset, count)
    }

    /// The registers of `device`, ordered by address.
    pub fn list(&self, device: Device) -> impl Iterator<Item = &RegisterDescriptor> {
        self.registers
            .iter()
            .filter(move |register| register.device == device)
    }

    /// All registers, ordered by device and address.
    pub fn iter(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.registers.iter()
    }

    /// Registers whose qualified name contains `pattern`, ignoring case.
    pub fn find(&self, pattern: &str) -> Vec<&RegisterDescriptor> {
        let pattern = pattern.to_ascii_lowercase();
        self.registers
            .iter()
            .filter(|register| {
                register
                    .qualified_name()
                    .to_ascii_lowercase()
                    .contains(&pattern)
            })
            .collect()
    }

    /// Replaces all registers of `device` with `descriptors`.
    /// The map is left untouched if the result would be inconsistent.
    pub fn replace_device(
        &mut self,
        device: Device,
        descriptors: Vec<RegisterDescriptor>,
    ) -> Result<()> {
        if let Some(foreign) = descriptors.iter().find(|d| d.device != device) {
            return Err(Error::MalformedMap(format!(
                "{} does not belong to {}",
                foreign.qualified_name(),
                device
            )));
        }
        let registers = self
            .registers
            .iter()
            .filter(|register| register.device != device)
            .cloned()
            .chain(descriptors)
            .collect();
        *self = RegisterMap::from_descriptors(registers)?;
        Ok(())
    }

    /// Removes and returns the registers of `device`.
    pub fn take_device(&mut self, device: Device) -> Vec<RegisterDescriptor> {
        let (taken, kept) = std::mem::take(&mut self.registers)
            .into_iter()
            .partition(|register| register.device == device);
        self.registers = kept;
        self.index.clear();
        for (i, register) in self.registers.iter().enumerate() {
            self.index
                .entry(register.device)
                .or_default()
                .insert(register.name.clone(), i);
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}
