//! Unified 24-bit bus / memory controller.
//!
//! Every access is masked to 24 bits and resolved, in order, against the RAM
//! window, the ROM window, the registered I/O handlers, the cartridge window
//! and finally "unmapped". Exactly one diagnostic counter moves per access.

use log::{debug, trace, warn};

use super::io::IoHandler;
use crate::error::{Error, Result};

/// Memory interface every module uses to reach the machine.
///
/// The controller is the usual implementor; tests and the CPU module may
/// substitute their own.
pub trait BusAccess {
    fn read_u8(&mut self, addr: u32) -> u8;
    fn read_u16(&mut self, addr: u32) -> u16;
    fn read_u32(&mut self, addr: u32) -> u32;
    fn write_u8(&mut self, addr: u32, value: u8);
    fn write_u16(&mut self, addr: u32, value: u16);
    fn write_u32(&mut self, addr: u32, value: u32);
    /// Signal a bus error (no device acknowledged the cycle).
    fn bus_error(&mut self, addr: u32, write: bool);
    /// Signal an address error (misaligned multi-byte access).
    fn address_error(&mut self, addr: u32, write: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusFaultKind {
    Bus,
    Address,
}

/// A latched hardware fault, waiting for the CPU module to collect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFault {
    pub address: u32,
    pub kind: BusFaultKind,
    pub write: bool,
}

/// Access counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub reads: u64,
    pub writes: u64,
    pub faults: u64,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Ram(usize),
    Rom(usize),
    Io(usize, u32),
    Cartridge(usize),
    Unmapped,
}

/// Owner of RAM, ROM, cartridge and the I/O handler table.
pub struct BusController {
    ram: Vec<u8>,
    rom: Vec<u8>,
    rom_base: u32,
    cartridge: Option<Vec<u8>>,
    io: Vec<IoHandler>,
    stats: BusStats,
    fault: Option<BusFault>,
}

impl BusController {
    pub const ADDRESS_MASK: u32 = 0x00FF_FFFF;
    /// RAM sizes are rounded up to this many bytes.
    pub const RAM_GRANULARITY: usize = 0x2_0000; // 128KB
    pub const RAM_MAX: usize = 0x40_0000; // 4MB
    pub const ROM_MAX: usize = 0x10_0000; // 1MB
    /// Images up to this size live at [`Self::ROM_BASE_SMALL`].
    pub const ROM_SMALL_LIMIT: usize = 0x3_0000; // 192KB
    pub const ROM_BASE_SMALL: u32 = 0xFC_0000;
    pub const ROM_BASE_LARGE: u32 = 0xE0_0000;
    pub const CART_BASE: u32 = 0xFA_0000;
    pub const CART_SIZE: usize = 0x2_0000; // 128KB
    pub const IO_BASE: u32 = 0xFF_8000;
    pub const IO_END: u32 = 0xFF_FFFF;
    pub const MAX_IO_HANDLERS: usize = 32;

    /// Create a controller with `ram_size` bytes of zeroed RAM.
    pub fn new(ram_size: usize) -> Result<Self> {
        if ram_size == 0 {
            return Err(Error::invalid_argument("RAM size must be non-zero"));
        }
        let rounded = ram_size.div_ceil(Self::RAM_GRANULARITY) * Self::RAM_GRANULARITY;
        if rounded > Self::RAM_MAX {
            return Err(Error::InvalidSize {
                what: "RAM",
                actual: rounded,
                limit: Self::RAM_MAX,
            });
        }
        debug!("bus: {} KiB RAM (requested {} bytes)", rounded / 1024, ram_size);
        Ok(Self {
            ram: vec![0; rounded],
            rom: Vec::new(),
            rom_base: Self::ROM_BASE_SMALL,
            cartridge: None,
            io: Vec::with_capacity(Self::MAX_IO_HANDLERS),
            stats: BusStats::default(),
            fault: None,
        })
    }

    /// Install a ROM image. The base address follows from its size.
    pub fn load_rom(&mut self, image: &[u8]) -> Result<()> {
        if image.len() > Self::ROM_MAX {
            return Err(Error::InvalidSize {
                what: "ROM image",
                actual: image.len(),
                limit: Self::ROM_MAX,
            });
        }
        self.rom_base = if image.len() <= Self::ROM_SMALL_LIMIT {
            Self::ROM_BASE_SMALL
        } else {
            Self::ROM_BASE_LARGE
        };
        self.rom = image.to_vec();
        debug!(
            "bus: ROM {} KiB at {:#08X}",
            self.rom.len() / 1024,
            self.rom_base
        );
        Ok(())
    }

    /// Insert a cartridge image into the cartridge window.
    pub fn load_cartridge(&mut self, image: &[u8]) -> Result<()> {
        if image.len() > Self::CART_SIZE {
            return Err(Error::InvalidSize {
                what: "cartridge image",
                actual: image.len(),
                limit: Self::CART_SIZE,
            });
        }
        self.cartridge = Some(image.to_vec());
        Ok(())
    }

    pub fn eject_cartridge(&mut self) {
        self.cartridge = None;
    }

    /// Add a peripheral handler to the end of the I/O table.
    pub fn register_io(&mut self, handler: IoHandler) -> Result<()> {
        if handler.base() < Self::IO_BASE {
            return Err(Error::invalid_argument(format!(
                "handler '{}' starts at {:#08X}, below the I/O window",
                handler.name(),
                handler.base()
            )));
        }
        if handler.end() < handler.base() {
            return Err(Error::invalid_argument(format!(
                "handler '{}' has an inverted range",
                handler.name()
            )));
        }
        if handler.end() > Self::IO_END {
            return Err(Error::invalid_argument(format!(
                "handler '{}' ends past the 24-bit address space",
                handler.name()
            )));
        }
        if let Some(existing) = self.io.iter().find(|h| h.overlaps(&handler)) {
            return Err(Error::invalid_argument(format!(
                "handler '{}' overlaps '{}'",
                handler.name(),
                existing.name()
            )));
        }
        if self.io.len() >= Self::MAX_IO_HANDLERS {
            return Err(Error::out_of_resources("I/O handler table is full"));
        }
        debug!("bus: registered {:?}", handler);
        self.io.push(handler);
        Ok(())
    }

    /// Remove the handler whose range starts at `base`.
    pub fn unregister_io(&mut self, base: u32) -> Result<IoHandler> {
        let idx = self
            .io
            .iter()
            .position(|h| h.base() == base)
            .ok_or_else(|| Error::not_found(format!("no I/O handler at {base:#08X}")))?;
        let handler = self.io.remove(idx);
        debug!("bus: removed {:?}", handler);
        Ok(handler)
    }

    pub fn io_handlers(&self) -> &[IoHandler] {
        &self.io
    }

    /// Clear RAM and counters. ROM and cartridge survive.
    pub fn reset(&mut self) {
        self.ram.fill(0);
        self.stats = BusStats::default();
        self.fault = None;
    }

    pub fn stats(&self) -> BusStats {
        self.stats
    }

    /// Collect the oldest uncollected fault.
    pub fn take_fault(&mut self) -> Option<BusFault> {
        self.fault.take()
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    pub fn ram_size(&self) -> usize {
        self.ram.len()
    }

    pub fn rom(&self) -> &[u8] {
        &self.rom
    }

    pub fn rom_base(&self) -> u32 {
        self.rom_base
    }

    fn decode(&self, addr: u32) -> Target {
        let a = addr as usize;
        if a < self.ram.len() {
            return Target::Ram(a);
        }
        if addr >= self.rom_base && ((addr - self.rom_base) as usize) < self.rom.len() {
            return Target::Rom((addr - self.rom_base) as usize);
        }
        if addr >= Self::IO_BASE {
            return match self.io.iter().position(|h| h.contains(addr)) {
                Some(idx) => Target::Io(idx, addr - self.io[idx].base()),
                None => Target::Unmapped,
            };
        }
        if let Some(cart) = &self.cartridge {
            if addr >= Self::CART_BASE && ((addr - Self::CART_BASE) as usize) < cart.len() {
                return Target::Cartridge((addr - Self::CART_BASE) as usize);
            }
        }
        Target::Unmapped
    }

    fn peek_u8(&mut self, addr: u32) -> Option<u8> {
        match self.decode(addr) {
            Target::Ram(i) => Some(self.ram[i]),
            Target::Rom(i) => Some(self.rom[i]),
            Target::Io(idx, offset) => self.io[idx]
                .device()
                .try_borrow_mut()
                .ok()
                .and_then(|mut dev| dev.read_u8(offset)),
            Target::Cartridge(i) => self.cartridge.as_ref().map(|c| c[i]),
            Target::Unmapped => None,
        }
    }

    fn peek_u16(&mut self, addr: u32) -> Option<u16> {
        let next = addr.wrapping_add(1) & Self::ADDRESS_MASK;
        match self.decode(addr) {
            Target::Ram(i) if i + 1 < self.ram.len() => {
                Some(u16::from_be_bytes([self.ram[i], self.ram[i + 1]]))
            }
            Target::Rom(i) if i + 1 < self.rom.len() => {
                Some(u16::from_be_bytes([self.rom[i], self.rom[i + 1]]))
            }
            Target::Io(idx, offset) if self.io[idx].contains(next) => self.io[idx]
                .device()
                .try_borrow_mut()
                .ok()
                .and_then(|mut dev| dev.read_u16(offset)),
            _ => {
                let hi = self.peek_u8(addr)?;
                let lo = self.peek_u8(next)?;
                Some(u16::from_be_bytes([hi, lo]))
            }
        }
    }

    fn poke_u8(&mut self, addr: u32, value: u8) -> bool {
        match self.decode(addr) {
            Target::Ram(i) => {
                self.ram[i] = value;
                true
            }
            Target::Io(idx, offset) => self.io[idx]
                .device()
                .try_borrow_mut()
                .map(|mut dev| dev.write_u8(offset, value))
                .unwrap_or(false),
            Target::Rom(_) | Target::Cartridge(_) => {
                warn!("bus: write of {:#04X} to read-only {:#08X}", value, addr);
                false
            }
            Target::Unmapped => false,
        }
    }

    fn poke_u16(&mut self, addr: u32, value: u16) -> bool {
        let next = addr.wrapping_add(1) & Self::ADDRESS_MASK;
        match self.decode(addr) {
            Target::Ram(i) if i + 1 < self.ram.len() => {
                self.ram[i..i + 2].copy_from_slice(&value.to_be_bytes());
                true
            }
            Target::Io(idx, offset) if self.io[idx].contains(next) => self.io[idx]
                .device()
                .try_borrow_mut()
                .map(|mut dev| dev.write_u16(offset, value))
                .unwrap_or(false),
            _ => {
                let [hi, lo] = value.to_be_bytes();
                self.poke_u8(addr, hi) & self.poke_u8(next, lo)
            }
        }
    }

    fn raise(&mut self, addr: u32, kind: BusFaultKind, write: bool) {
        self.stats.faults += 1;
        trace!(
            "bus: {:?} fault on {} at {:#08X}",
            kind,
            if write { "write" } else { "read" },
            addr
        );
        self.fault.get_or_insert(BusFault {
            address: addr,
            kind,
            write,
        });
    }

    fn finish_read<T>(&mut self, addr: u32, value: Option<T>, all_ones: T) -> T {
        match value {
            Some(v) => {
                self.stats.reads += 1;
                v
            }
            None => {
                self.raise(addr, BusFaultKind::Bus, false);
                all_ones
            }
        }
    }

    fn finish_write(&mut self, addr: u32, handled: bool) {
        if handled {
            self.stats.writes += 1;
        } else {
            self.raise(addr, BusFaultKind::Bus, true);
        }
    }
}

impl BusAccess for BusController {
    fn read_u8(&mut self, addr: u32) -> u8 {
        let addr = addr & Self::ADDRESS_MASK;
        let value = self.peek_u8(addr);
        self.finish_read(addr, value, 0xFF)
    }

    fn read_u16(&mut self, addr: u32) -> u16 {
        let addr = addr & Self::ADDRESS_MASK;
        let value = self.peek_u16(addr);
        self.finish_read(addr, value, 0xFFFF)
    }

    fn read_u32(&mut self, addr: u32) -> u32 {
        let addr = addr & Self::ADDRESS_MASK;
        let hi = self.peek_u16(addr);
        let lo = self.peek_u16(addr.wrapping_add(2) & Self::ADDRESS_MASK);
        let value = hi.zip(lo).map(|(hi, lo)| (u32::from(hi) << 16) | u32::from(lo));
        self.finish_read(addr, value, 0xFFFF_FFFF)
    }

    fn write_u8(&mut self, addr: u32, value: u8) {
        let addr = addr & Self::ADDRESS_MASK;
        let handled = self.poke_u8(addr, value);
        self.finish_write(addr, handled);
    }

    fn write_u16(&mut self, addr: u32, value: u16) {
        let addr = addr & Self::ADDRESS_MASK;
        let handled = self.poke_u16(addr, value);
        self.finish_write(addr, handled);
    }

    fn write_u32(&mut self, addr: u32, value: u32) {
        let addr = addr & Self::ADDRESS_MASK;
        let hi = self.poke_u16(addr, (value >> 16) as u16);
        let lo = self.poke_u16(addr.wrapping_add(2) & Self::ADDRESS_MASK, value as u16);
        self.finish_write(addr, hi & lo);
    }

    fn bus_error(&mut self, addr: u32, write: bool) {
        self.raise(addr & Self::ADDRESS_MASK, BusFaultKind::Bus, write);
    }

    fn address_error(&mut self, addr: u32, write: bool) {
        self.raise(addr & Self::ADDRESS_MASK, BusFaultKind::Address, write);
    }
}
