//! Peripheral register handlers mapped into the I/O window.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Register-level access to a memory-mapped peripheral.
///
/// Offsets are relative to the base of the registration the access came
/// through. Returning `None` from a read (or `false` from a write) marks the
/// access as unhandled, which the bus controller turns into a bus fault.
pub trait IoDevice {
    fn read_u8(&mut self, offset: u32) -> Option<u8>;

    fn write_u8(&mut self, offset: u32, value: u8) -> bool;

    /// Big-endian word read. Devices with native 16-bit registers override
    /// this; the default composes two byte accesses.
    fn read_u16(&mut self, offset: u32) -> Option<u16> {
        let hi = self.read_u8(offset)?;
        let lo = self.read_u8(offset.wrapping_add(1))?;
        Some(u16::from_be_bytes([hi, lo]))
    }

    /// Big-endian word write, composed from byte writes unless overridden.
    fn write_u16(&mut self, offset: u32, value: u16) -> bool {
        let [hi, lo] = value.to_be_bytes();
        self.write_u8(offset, hi) & self.write_u8(offset.wrapping_add(1), lo)
    }
}

/// Device state shared between the bus and the module that owns it.
pub type SharedDevice = Rc<RefCell<dyn IoDevice>>;

/// One registered address range (inclusive) inside the I/O window.
pub struct IoHandler {
    name: String,
    base: u32,
    end: u32,
    device: SharedDevice,
}

impl IoHandler {
    pub fn new(name: impl Into<String>, base: u32, end: u32, device: SharedDevice) -> Self {
        Self {
            name: name.into(),
            base,
            end,
            device,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub(crate) fn device(&self) -> &SharedDevice {
        &self.device
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr <= self.end
    }

    pub(crate) fn overlaps(&self, other: &IoHandler) -> bool {
        self.base <= other.end && other.base <= self.end
    }
}

impl fmt::Debug for IoHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoHandler")
            .field("name", &self.name)
            .field("base", &format_args!("{:#08X}", self.base))
            .field("end", &format_args!("{:#08X}", self.end))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Latch([u8; 4]);

    impl IoDevice for Latch {
        fn read_u8(&mut self, offset: u32) -> Option<u8> {
            self.0.get(offset as usize).copied()
        }

        fn write_u8(&mut self, offset: u32, value: u8) -> bool {
            match self.0.get_mut(offset as usize) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            }
        }
    }

    #[test]
    fn default_word_access_is_big_endian() {
        let mut latch = Latch([0; 4]);
        assert!(latch.write_u16(0, 0xBEEF));
        assert_eq!(latch.0, [0xBE, 0xEF, 0, 0]);
        assert_eq!(latch.read_u16(0), Some(0xBEEF));
    }

    #[test]
    fn word_access_past_device_end_is_unhandled() {
        let mut latch = Latch([0; 4]);
        assert_eq!(latch.read_u16(3), None);
        assert!(!latch.write_u16(3, 0x1234));
        // the in-range half still lands
        assert_eq!(latch.0[3], 0x12);
    }

    #[test]
    fn overlap_detection_is_inclusive() {
        let dev: SharedDevice = Rc::new(RefCell::new(Latch([0; 4])));
        let a = IoHandler::new("a", 0xFF8000, 0xFF800F, dev.clone());
        let b = IoHandler::new("b", 0xFF800F, 0xFF801F, dev.clone());
        let c = IoHandler::new("c", 0xFF8010, 0xFF801F, dev);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}
