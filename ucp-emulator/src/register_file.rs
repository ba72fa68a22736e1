use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::Backend;

/// Value of erased flash words
const ERASED: u32 = u32::MAX;

#[derive(Debug, Default)]
struct Inner {
    power_on: HashMap<u32, u32>,
    memory: HashMap<u32, u32>,
    flash: HashMap<u32, u32>,
    fifos: HashMap<u32, VecDeque<u32>>,
}

/// In-memory [Backend].
///
/// Memory words read as zero until written, flash words as `0xFFFF_FFFF` until
/// programmed. Reading more words than a FIFO holds returns zeros for the missing ones.
/// Clones share the same storage, so a test can keep a handle to inspect the state
/// while the server owns another.
#[derive(Debug, Clone, Default)]
pub struct RegisterFile {
    inner: Arc<Mutex<Inner>>,
}

impl RegisterFile {
    pub fn new() -> RegisterFile {
        RegisterFile::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets power-on values, which are restored by a board reset.
    pub fn load(&self, address: u32, values: &[u32]) {
        let mut inner = self.lock();
        for (i, &value) in values.iter().enumerate() {
            let address = address.wrapping_add(i as u32);
            inner.power_on.insert(address, value);
            inner.memory.insert(address, value);
        }
    }

    /// Current value of a memory word
    pub fn word(&self, address: u32) -> u32 {
        self.lock().memory.get(&address).copied().unwrap_or(0)
    }

    /// Current value of a flash word
    pub fn flash_word(&self, address: u32) -> u32 {
        self.lock().flash.get(&address).copied().unwrap_or(ERASED)
    }

    /// Number of words queued in the FIFO at `address`
    pub fn fifo_len(&self, address: u32) -> usize {
        self.lock().fifos.get(&address).map_or(0, VecDeque::len)
    }

    fn update(&self, address: u32, f: impl FnOnce(u32) -> u32) {
        let mut inner = self.lock();
        let word = inner.memory.entry(address).or_default();
        *word = f(*word);
    }
}

impl Backend for RegisterFile {
    fn read(&self, address: u32, count: u32) -> Box<[u32]> {
        let inner = self.lock();
        (0..count)
            .map(|i| {
                inner
                    .memory
                    .get(&address.wrapping_add(i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    fn write(&self, address: u32, values: &[u32]) {
        let mut inner = self.lock();
        for (i, &value) in values.iter().enumerate() {
            inner.memory.insert(address.wrapping_add(i as u32), value);
        }
    }

    fn and(&self, address: u32, mask: u32) {
        self.update(address, |word| word & mask);
    }

    fn or(&self, address: u32, mask: u32) {
        self.update(address, |word| word | mask);
    }

    fn flash_read(&self, address: u32, count: u32) -> Box<[u32]> {
        let inner = self.lock();
        (0..count)
            .map(|i| {
                inner
                    .flash
                    .get(&address.wrapping_add(i))
                    .copied()
                    .unwrap_or(ERASED)
            })
            .collect()
    }

    fn flash_write(&self, address: u32, values: &[u32]) {
        let mut inner = self.lock();
        for (i, &value) in values.iter().enumerate() {
            // programming can only clear bits
            let word = inner
                .flash
                .entry(address.wrapping_add(i as u32))
                .or_insert(ERASED);
            *word &= value;
        }
    }

    fn flash_erase(&self, address: u32, count: u32) {
        let mut inner = self.lock();
        for i in 0..count {
            inner.flash.remove(&address.wrapping_add(i));
        }
    }

    fn fifo_read(&self, address: u32, count: u32) -> Box<[u32]> {
        let mut inner = self.lock();
        let fifo = inner.fifos.entry(address).or_default();
        (0..count)
            .map(|_| fifo.pop_front().unwrap_or(0))
            .collect()
    }

    fn fifo_write(&self, address: u32, values: &[u32]) {
        self.lock()
            .fifos
            .entry(address)
            .or_default()
            .extend(values.iter().copied());
    }

    fn reset(&self) {
        let mut inner = self.lock();
        inner.memory = inner.power_on.clone();
        inner.fifos.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory() {
        let file = RegisterFile::new();
        file.write(0x100, &[1, 2, 3]);
        assert_eq!(&*file.read(0xFF, 5), &[0, 1, 2, 3, 0]);
        file.and(0x101, 0x0);
        file.or(0x102, 0xF0);
        assert_eq!(&*file.read(0x100, 3), &[1, 0, 0xF3]);
    }

    #[test]
    fn bits() {
        let file = RegisterFile::new();
        file.write_bit(0x10, 4, true);
        file.write_bit(0x10, 0, true);
        assert_eq!(file.word(0x10), 0x11);
        file.write_bit(0x10, 4, false);
        assert_eq!(file.word(0x10), 0x01);
    }

    #[test]
    fn flash() {
        let file = RegisterFile::new();
        assert_eq!(&*file.flash_read(0x0, 2), &[ERASED, ERASED]);
        file.flash_write(0x0, &[0x0F0F_0F0F]);
        file.flash_write(0x0, &[0xFFFF_0000]);
        assert_eq!(file.flash_word(0x0), 0x0F0F_0000);
        file.flash_erase(0x0, 1);
        assert_eq!(file.flash_word(0x0), ERASED);
        // flash is separate from memory
        assert_eq!(file.word(0x0), 0);
    }

    #[test]
    fn fifo() {
        let file = RegisterFile::new();
        file.fifo_write(0x20, &[1, 2]);
        file.fifo_write(0x20, &[3]);
        assert_eq!(file.fifo_len(0x20), 3);
        assert_eq!(&*file.fifo_read(0x20, 2), &[1, 2]);
        assert_eq!(&*file.fifo_read(0x20, 2), &[3, 0]);
        assert_eq!(file.fifo_len(0x20), 0);
    }

    #[test]
    fn reset_restores_power_on_values() {
        let file = RegisterFile::new();
        file.load(0x10, &[0xA5]);
        file.write(0x10, &[0x5A]);
        file.write(0x11, &[7]);
        file.fifo_write(0x20, &[1]);
        file.flash_write(0x0, &[0]);
        file.reset();
        assert_eq!(file.word(0x10), 0xA5);
        assert_eq!(file.word(0x11), 0);
        assert_eq!(file.fifo_len(0x20), 0);
        assert_eq!(file.flash_word(0x0), 0);
    }

    #[test]
    fn clones_share_storage() {
        let file = RegisterFile::new();
        let handle = file.clone();
        file.write(0x1, &[9]);
        assert_eq!(handle.word(0x1), 9);
    }
}
