//! Programming firmware images into the configuration flash of a device.
//!
//! Every device owns a region of [FIRMWARE_REGION_WORDS] flash words starting at
//! [firmware_address]. Loading a firmware erases the words the image needs, programs the
//! image and reads it back until the flash reports every word. The register description
//! published next to the image (same path, `.toml` extension) is parsed up front and only
//! handed out once the image verified.
use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use ucp_client::WriteError;

use crate::{
    error::{Error, Result},
    protocol::{Protocol, Space},
    register_map::RegisterMap,
    types::Device,
};

/// Flash words reserved for the firmware of one device
pub const FIRMWARE_REGION_WORDS: u32 = 0x0010_0000;

/// How often the flash is read back before a load is given up
const VERIFY_POLLS: u32 = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// First flash word of the firmware region of `device`.
pub fn firmware_address(device: Device) -> u32 {
    u32::from(device) * FIRMWARE_REGION_WORDS
}

/// Register description published with the image at `image`.
pub fn register_description(image: &Path) -> PathBuf {
    image.with_extension("toml")
}

/// A firmware image as flash words.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Image {
    words: Vec<u32>,
}

impl Image {
    /// Packs the bytes of an image into big-endian words. A trailing partial word is
    /// filled up with erased bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Image> {
        if bytes.is_empty() {
            return Err(Error::InvalidFirmware("the image is empty".to_string()));
        }
        let words: Vec<u32> = bytes
            .chunks(size_of::<u32>())
            .map(|chunk| {
                let mut word = [0xFF; size_of::<u32>()];
                word[..chunk.len()].copy_from_slice(chunk);
                u32::from_be_bytes(word)
            })
            .collect();
        if words.len() > FIRMWARE_REGION_WORDS as usize {
            return Err(Error::InvalidFirmware(format!(
                "{} words exceed the firmware region of {} words",
                words.len(),
                FIRMWARE_REGION_WORDS
            )));
        }
        Ok(Image { words })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Image> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| Error::FirmwareFile {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Read {} bytes of firmware from {}", bytes.len(), path.display());
        Image::from_bytes(&bytes)
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Programs the image at `path` for `device` and returns its register description.
///
/// Both files are read before the flash is touched, so a broken description leaves the
/// running firmware alone.
pub(crate) fn load(
    protocol: &mut dyn Protocol,
    device: Device,
    path: &Path,
) -> Result<RegisterMap> {
    let registers = RegisterMap::from_file(register_description(path))?;
    let image = Image::from_file(path)?;
    program(protocol, device, &image)?;
    Ok(registers)
}

/// Erases the firmware region, writes `image` and polls until it reads back unchanged.
pub(crate) fn program(protocol: &mut dyn Protocol, device: Device, image: &Image) -> Result<()> {
    let address = firmware_address(device);
    log::info!(
        "Programming {} words of firmware for {} at flash address 0x{:08x}",
        image.len(),
        device,
        address
    );
    protocol.flash_erase(address, image.len() as u32)?;
    protocol
        .write_words(Space::Flash, address, image.words())
        .map_err(|WriteError { written, source }| Error::WriteFailed {
            register: format!("{} firmware", device),
            index: written,
            source,
        })?;

    let mut poll = 1;
    loop {
        let flashed = protocol.read_words(Space::Flash, address, image.len())?;
        let Some(index) = flashed
            .iter()
            .zip(image.words())
            .position(|(flashed, expected)| flashed != expected)
        else {
            log::debug!("Firmware for {} verified after {} polls", device, poll);
            return Ok(());
        };
        if poll == VERIFY_POLLS {
            return Err(Error::FirmwareVerify {
                device,
                address: address.wrapping_add(index as u32),
            });
        }
        log::trace!("Flash of {} differs at word {}, polling again", device, index);
        poll += 1;
        thread::sleep(POLL_INTERVAL);
    }
}
