use std::{
    net::ToSocketAddrs,
    path::PathBuf,
    thread::{self, JoinHandle},
};

use ucp_client::{BitwiseOp, Config, Connection, WriteError};

use crate::{
    error::{Error, Result},
    firmware,
    protocol::{Protocol, Space},
    register_map::{RegisterDescriptor, RegisterMap},
    types::{Access, Device, RegisterKind, Status},
};

/// How a subscribed register is published by the board.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Update {
    Periodic,
    Once,
}

/// A firmware load running in the background. The thread owns the connection until it
/// hands it back with the result.
struct Loading {
    device: Device,
    handle: JoinHandle<(Box<dyn Protocol>, Result<RegisterMap>)>,
}

/// Register level access to one board.
///
/// Every register access is checked against the [RegisterMap] before anything is sent:
/// unknown names, out of range accesses and permission violations never reach the board.
pub struct Board {
    protocol: Option<Box<dyn Protocol>>,
    map: RegisterMap,
    broken: bool,
    error: Option<Error>,
    loading: Option<Loading>,
}

impl Board {
    pub fn new(map: RegisterMap) -> Board {
        Board {
            protocol: None,
            map,
            broken: false,
            error: None,
            loading: None,
        }
    }

    /// Opens a UCP connection to the board at `addr`.
    /// An existing connection is closed first.
    pub fn connect(&mut self, addr: impl ToSocketAddrs, config: Config) -> Result<()> {
        let connection = Connection::connect(addr, config).map_err(Error::Connect)?;
        self.attach(Box::new(connection));
        Ok(())
    }

    /// Uses `protocol` for all further accesses.
    pub fn attach(&mut self, protocol: Box<dyn Protocol>) {
        self.disconnect();
        self.protocol = Some(protocol);
    }

    /// Closes the connection, after waiting for a running firmware load.
    pub fn disconnect(&mut self) {
        self.wait_for_loading();
        if let Some(mut protocol) = self.protocol.take() {
            protocol.disconnect();
        }
        self.broken = false;
    }

    pub fn status(&mut self) -> Status {
        self.poll_loading();
        if self.loading.is_some() {
            Status::LoadingFirmware
        } else if self.broken {
            Status::Error
        } else if self.protocol.as_ref().is_some_and(|p| p.is_connected()) {
            Status::Connected
        } else {
            Status::NotConnected
        }
    }

    /// Takes the error that moved the board to [Status::Error]: a failed background
    /// firmware load or a fatal transport error.
    ///
    /// Afterwards the board reports [Status::Connected] if it still has its connection
    /// and [Status::NotConnected] otherwise.
    pub fn take_error(&mut self) -> Option<Error> {
        self.poll_loading();
        let error = self.error.take();
        if error.is_some() {
            self.broken = false;
        }
        error
    }

    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    /// Registers of `device`, ordered by address.
    pub fn list_registers(&self, device: Device) -> Vec<&RegisterDescriptor> {
        self.map.list(device).collect()
    }

    /// Registers whose qualified name contains `pattern`.
    pub fn find_registers(&self, pattern: &str) -> Vec<&RegisterDescriptor> {
        self.map.find(pattern)
    }

    /// Reads `count` words starting `offset` words into a register.
    ///
    /// Bit-field registers return the field value of each word, shifted down to bit 0.
    pub fn read_register(
        &mut self,
        device: Device,
        name: &str,
        count: usize,
        offset: usize,
    ) -> Result<Vec<u32>> {
        let register = self.checked(device, name, offset, count, Access::Read)?;
        let (space, address) = Self::target(&register, offset);
        log::debug!(
            "Reading {} words from {} at offset {}",
            count,
            register.qualified_name(),
            offset
        );
        let result = self
            .protocol()?
            .read_words(space, address, count)
            .map_err(Error::from);
        let values = self.settle(result)?;
        if register.kind() == RegisterKind::BitField {
            let shift = register.shift();
            return Ok(values
                .into_iter()
                .map(|word| (word & register.bitmask()) >> shift)
                .collect());
        }
        Ok(values)
    }

    /// Writes `values` starting `offset` words into a register.
    ///
    /// Transfers larger than a packet are not atomic. If a packet fails, the words before
    /// [Error::WriteFailed::index] stay written. Bit-field registers only change the bits of
    /// their mask, using one AND and one OR update per word.
    pub fn write_register(
        &mut self,
        device: Device,
        name: &str,
        values: &[u32],
        offset: usize,
    ) -> Result<()> {
        let register = self.checked(device, name, offset, values.len(), Access::Write)?;
        let (space, address) = Self::target(&register, offset);
        log::debug!(
            "Writing {} words to {} at offset {}",
            values.len(),
            register.qualified_name(),
            offset
        );
        let result = if register.kind() == RegisterKind::BitField {
            Self::write_field(self.protocol()?, &register, address, values)
        } else {
            self.protocol()?.write_words(space, address, values)
        }
        .map_err(|WriteError { written, source }| Error::WriteFailed {
            register: register.qualified_name(),
            index: written,
            source,
        });
        self.settle(result)
    }

    /// Reads `count` words starting at a raw address, bypassing the register map.
    pub fn read_address(&mut self, address: u32, count: usize) -> Result<Vec<u32>> {
        let result = self
            .protocol()?
            .read_words(Space::Memory, address, count)
            .map_err(Error::from);
        self.settle(result)
    }

    /// Writes `values` starting at a raw address, bypassing the register map.
    pub fn write_address(&mut self, address: u32, values: &[u32]) -> Result<()> {
        let result = self
            .protocol()?
            .write_words(Space::Memory, address, values)
            .map_err(|WriteError { written, source }| Error::WriteFailed {
                register: format!("0x{:08x}", address),
                index: written,
                source,
            });
        self.settle(result)
    }

    pub fn reset(&mut self) -> Result<()> {
        log::info!("Resetting board");
        let result = self.protocol()?.reset_board().map_err(Error::from);
        self.settle(result)
    }

    /// Blocks until the board saw the next pulse-per-second edge.
    pub fn wait_for_pps(&mut self) -> Result<()> {
        let result = self.protocol()?.wait_for_pps().map_err(Error::from);
        self.settle(result)
    }

    /// Asks the board to publish the contents of a register.
    pub fn subscribe(&mut self, device: Device, name: &str, update: Update) -> Result<()> {
        let register = self.checked(device, name, 0, 0, Access::Read)?;
        let protocol = self.protocol()?;
        let result = match update {
            Update::Periodic => {
                protocol.subscribe_periodic(register.address(), register.element_count())
            }
            Update::Once => {
                protocol.request_async_update(register.address(), register.element_count())
            }
        }
        .map_err(Error::from);
        self.settle(result)
    }

    pub fn cancel_update(&mut self, device: Device, name: &str) -> Result<()> {
        let address = self.map.resolve(device, name)?.address();
        let result = self.protocol()?.cancel_update(address).map_err(Error::from);
        self.settle(result)
    }

    /// Programs the firmware image at `path` into the flash of `device`, waits until the
    /// flash reports the whole image and installs the register description published
    /// with it (`path` with a `.toml` extension).
    ///
    /// Only the registers of `device` are taken from the description, the other devices
    /// keep their registers. On error, the previous registers stay in place.
    pub fn load_firmware_blocking(
        &mut self,
        device: Device,
        path: impl Into<PathBuf>,
    ) -> Result<()> {
        let path = path.into();
        log::info!("Loading firmware for {} from {}", device, path.display());
        let result = firmware::load(self.protocol()?, device, &path);
        let loaded = self.settle(result)?;
        self.install(device, loaded)
    }

    /// Starts [Self::load_firmware_blocking] on a background thread.
    ///
    /// [Self::status] reports [Status::LoadingFirmware] until the load finished, other
    /// operations wait for it. A failed load moves the board to [Status::Error] and the
    /// cause is available from [Self::take_error].
    pub fn load_firmware(&mut self, device: Device, path: impl Into<PathBuf>) -> Result<()> {
        self.wait_for_loading();
        let path = path.into();
        let mut protocol = self.protocol.take().ok_or(Error::NotConnected)?;
        log::info!(
            "Loading firmware for {} from {} in the background",
            device,
            path.display()
        );
        let handle = thread::spawn(move || {
            let result = firmware::load(&mut *protocol, device, &path);
            (protocol, result)
        });
        self.loading = Some(Loading { device, handle });
        Ok(())
    }

    /// Blocks until a running background load finished and installs its result.
    pub fn wait_for_loading(&mut self) {
        if let Some(loading) = self.loading.take() {
            self.finish_loading(loading);
        }
    }

    fn poll_loading(&mut self) {
        if self
            .loading
            .as_ref()
            .is_some_and(|loading| loading.handle.is_finished())
        {
            self.wait_for_loading();
        }
    }

    fn finish_loading(&mut self, loading: Loading) {
        let result = match loading.handle.join() {
            Ok((protocol, result)) => {
                self.protocol = Some(protocol);
                self.settle(result).and_then(|map| self.install(loading.device, map))
            }
            Err(_) => Err(Error::LoadAborted(loading.device)),
        };
        if let Err(err) = result {
            log::error!("Loading firmware for {} failed: {}", loading.device, err);
            self.broken = true;
            self.error = Some(err);
        }
    }

    fn install(&mut self, device: Device, mut loaded: RegisterMap) -> Result<()> {
        let registers = loaded.take_device(device);
        if !loaded.is_empty() {
            log::warn!(
                "Ignoring {} registers of other devices in the firmware of {}",
                loaded.len(),
                device
            );
        }
        if registers.is_empty() {
            log::warn!("Firmware for {} defines no registers", device);
        }
        let count = registers.len();
        self.map.replace_device(device, registers)?;
        log::info!("Installed {} registers for {}", count, device);
        Ok(())
    }

    /// Resolves a register and checks the access against its permission and size.
    fn checked(
        &mut self,
        device: Device,
        name: &str,
        offset: usize,
        count: usize,
        access: Access,
    ) -> Result<RegisterDescriptor> {
        self.poll_loading();
        let register = self.map.resolve(device, name)?;
        if !access.permitted_by(register.permission()) {
            return Err(Error::PermissionDenied {
                register: register.qualified_name(),
                permission: register.permission(),
                access,
            });
        }
        register.validate(offset, count)?;
        Ok(register.clone())
    }

    fn target(register: &RegisterDescriptor, offset: usize) -> (Space, u32) {
        match register.kind() {
            RegisterKind::Fifo => (Space::Fifo, register.address()),
            // offsets were validated against the element count, which fits the address space
            RegisterKind::Flash => (Space::Flash, register.address().wrapping_add(offset as u32)),
            RegisterKind::Plain | RegisterKind::BitField => {
                (Space::Memory, register.address().wrapping_add(offset as u32))
            }
        }
    }

    fn write_field(
        protocol: &mut dyn Protocol,
        register: &RegisterDescriptor,
        address: u32,
        values: &[u32],
    ) -> std::result::Result<(), WriteError> {
        let mask = register.bitmask();
        for (i, value) in values.iter().enumerate() {
            let field = (value << register.shift()) & mask;
            let word = address.wrapping_add(i as u32);
            protocol
                .bitwise_update(word, !mask | field, BitwiseOp::And)
                .and_then(|_| protocol.bitwise_update(word, field, BitwiseOp::Or))
                .map_err(|source| WriteError { written: i, source })?;
        }
        Ok(())
    }

    /// The connection, once a running firmware load handed it back.
    fn protocol(&mut self) -> Result<&mut (dyn Protocol + 'static)> {
        self.wait_for_loading();
        self.protocol.as_deref_mut().ok_or(Error::NotConnected)
    }

    /// Drops the connection when `result` failed on the socket itself, keeping the
    /// cause for [Self::take_error].
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result
            && err.transport().is_some_and(|e| e.is_fatal())
        {
            log::error!("Connection to board lost: {}", err);
            if let Some(mut protocol) = self.protocol.take() {
                protocol.disconnect();
            }
            self.broken = true;
            self.error = Some(Error::ConnectionLost(err.to_string()));
        }
        result
    }
}

impl Drop for Board {
    fn drop(&mut self) {
        self.disconnect();
    }
}
