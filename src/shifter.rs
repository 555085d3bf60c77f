//! Shifter raster video: palette, resolution and bitplane decoding

use std::cell::RefCell;
use std::rc::Rc;

use bitvec::prelude::*;

use crate::core::{BusAccess, IoDevice, IoHandler, SharedDevice};
use crate::error::Result;
use crate::module::{AttachContext, INTERFACE_VERSION, Module, VideoModule};

pub const VIDEO_BASE_START: u32 = 0xFF_8200;
pub const VIDEO_BASE_END: u32 = 0xFF_8209;
pub const PALETTE_BASE: u32 = 0xFF_8240;
pub const PALETTE_END: u32 = 0xFF_8261;

pub const PALETTE_SIZE: usize = 16;
const RESOLUTION_OFFSET: u32 = 0x20;
const COLOR_MASK: u16 = 0x0777;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Low,
    Medium,
    High,
}

impl Resolution {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Resolution::Low,
            1 => Resolution::Medium,
            _ => Resolution::High,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Resolution::Low => 0,
            Resolution::Medium => 1,
            Resolution::High => 2,
        }
    }

    pub fn dimensions(self) -> (usize, usize) {
        match self {
            Resolution::Low => (320, 200),
            Resolution::Medium => (640, 200),
            Resolution::High => (640, 400),
        }
    }

    pub fn planes(self) -> usize {
        match self {
            Resolution::Low => 4,
            Resolution::Medium => 2,
            Resolution::High => 1,
        }
    }
}

/// 0x0RGB with 3 bits per component to 0x00RRGGBB.
fn st_color_to_rgb(color: u16) -> u32 {
    let expand = |c: u16| {
        let c = u32::from(c & 0x07);
        (c << 5) | (c << 2) | (c >> 1)
    };
    (expand(color >> 8) << 16) | (expand(color >> 4) << 8) | expand(color)
}

pub struct Shifter {
    palette: [u16; PALETTE_SIZE],
    resolution: Resolution,
    base: u32,
    counter: u32,
}

impl Shifter {
    pub fn new() -> Self {
        Self {
            palette: [0; PALETTE_SIZE],
            resolution: Resolution::Low,
            base: 0,
            counter: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Screen start address in RAM.
    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn palette(&self) -> &[u16; PALETTE_SIZE] {
        &self.palette
    }

    fn read_palette(&self, offset: u32) -> u8 {
        match offset {
            0..RESOLUTION_OFFSET => {
                let word = self.palette[(offset / 2) as usize];
                if offset & 1 == 0 {
                    (word >> 8) as u8
                } else {
                    word as u8
                }
            }
            RESOLUTION_OFFSET => self.resolution.bits(),
            _ => 0xFF,
        }
    }

    fn write_palette(&mut self, offset: u32, value: u8) {
        match offset {
            0..RESOLUTION_OFFSET => {
                let slot = &mut self.palette[(offset / 2) as usize];
                let word = if offset & 1 == 0 {
                    (*slot & 0x00FF) | (u16::from(value) << 8)
                } else {
                    (*slot & 0xFF00) | u16::from(value)
                };
                *slot = word & COLOR_MASK;
            }
            RESOLUTION_OFFSET => self.resolution = Resolution::from_bits(value),
            _ => {}
        }
    }

    fn read_base(&self, offset: u32) -> u8 {
        match offset {
            1 => (self.base >> 16) as u8,
            3 => (self.base >> 8) as u8,
            5 => (self.counter >> 16) as u8,
            7 => (self.counter >> 8) as u8,
            9 => self.counter as u8,
            _ => 0xFF,
        }
    }

    fn write_base(&mut self, offset: u32, value: u8) {
        match offset {
            1 => self.base = (self.base & 0x00_FF00) | (u32::from(value) << 16),
            3 => self.base = (self.base & 0xFF_0000) | (u32::from(value) << 8),
            _ => {}
        }
    }

    /// Decode one frame from video RAM. Returns the pixels written, never more
    /// than `frame.len()`.
    pub fn render(&mut self, bus: &mut dyn BusAccess, frame: &mut [u32]) -> usize {
        let (width, height) = self.resolution.dimensions();
        let planes = self.resolution.planes();
        let pixels = (width * height).min(frame.len());

        let colors: [u32; PALETTE_SIZE] = if self.resolution == Resolution::High {
            // mono: palette 0 bit 0 picks polarity
            let (on, off) = if self.palette[0] & 1 != 0 {
                (0x0000_0000, 0x00FF_FFFF)
            } else {
                (0x00FF_FFFF, 0x0000_0000)
            };
            let mut mono = [off; PALETTE_SIZE];
            mono[1] = on;
            mono
        } else {
            self.palette.map(st_color_to_rgb)
        };

        let mut addr = self.base;
        let mut words = [0u16; 4];
        for out in frame[..pixels].chunks_mut(16) {
            for (plane, word) in words.iter_mut().take(planes).enumerate() {
                *word = bus.read_u16(addr + 2 * plane as u32);
            }
            addr += 2 * planes as u32;
            for (bit, pixel) in out.iter_mut().enumerate() {
                let index = words[..planes]
                    .iter()
                    .enumerate()
                    .fold(0usize, |acc, (plane, word)| {
                        acc | (usize::from(word.view_bits::<Msb0>()[bit]) << plane)
                    });
                *pixel = colors[index];
            }
        }
        self.counter = addr;
        pixels
    }
}

impl Default for Shifter {
    fn default() -> Self {
        Self::new()
    }
}

impl IoDevice for Shifter {
    fn read_u8(&mut self, offset: u32) -> Option<u8> {
        Some(self.read_palette(offset))
    }

    fn write_u8(&mut self, offset: u32, value: u8) -> bool {
        self.write_palette(offset, value);
        true
    }

    fn read_u16(&mut self, offset: u32) -> Option<u16> {
        if offset < RESOLUTION_OFFSET && offset & 1 == 0 {
            return Some(self.palette[(offset / 2) as usize]);
        }
        let hi = self.read_palette(offset);
        let lo = self.read_palette(offset + 1);
        Some(u16::from_be_bytes([hi, lo]))
    }

    fn write_u16(&mut self, offset: u32, value: u16) -> bool {
        if offset < RESOLUTION_OFFSET && offset & 1 == 0 {
            self.palette[(offset / 2) as usize] = value & COLOR_MASK;
        } else {
            let [hi, lo] = value.to_be_bytes();
            self.write_palette(offset, hi);
            self.write_palette(offset + 1, lo);
        }
        true
    }
}

/// Video base and counter registers, a second window onto the same Shifter.
struct VideoBaseRegisters(Rc<RefCell<Shifter>>);

impl IoDevice for VideoBaseRegisters {
    // The Shifter is already borrowed while it renders a screen that overlaps
    // these registers; such accesses become bus faults.
    fn read_u8(&mut self, offset: u32) -> Option<u8> {
        self.0.try_borrow().ok().map(|s| s.read_base(offset))
    }

    fn write_u8(&mut self, offset: u32, value: u8) -> bool {
        match self.0.try_borrow_mut() {
            Ok(mut shifter) => {
                shifter.write_base(offset, value);
                true
            }
            Err(_) => false,
        }
    }
}

pub struct ShifterModule {
    shifter: Rc<RefCell<Shifter>>,
}

impl ShifterModule {
    pub const ENTRY: &'static str = "shifter_entry";
    pub const NAME: &'static str = "ST Shifter";

    pub fn new() -> Self {
        Self {
            shifter: Rc::new(RefCell::new(Shifter::new())),
        }
    }

    pub fn shared(&self) -> Rc<RefCell<Shifter>> {
        self.shifter.clone()
    }
}

impl Default for ShifterModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for ShifterModule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn interface_version(&self) -> u32 {
        INTERFACE_VERSION
    }

    fn reset(&mut self) {
        self.shifter.borrow_mut().reset();
    }

    fn attach(&mut self, ctx: &mut AttachContext<'_>) -> Result<()> {
        let base: SharedDevice = Rc::new(RefCell::new(VideoBaseRegisters(self.shifter.clone())));
        ctx.bus.register_io(IoHandler::new(
            "shifter-base",
            VIDEO_BASE_START,
            VIDEO_BASE_END,
            base,
        ))?;
        let palette: SharedDevice = self.shifter.clone();
        ctx.bus
            .register_io(IoHandler::new("shifter", PALETTE_BASE, PALETTE_END, palette))
    }
}

impl VideoModule for ShifterModule {
    fn dimensions(&self) -> (usize, usize) {
        self.shifter.borrow().resolution().dimensions()
    }

    fn render(&mut self, bus: &mut dyn BusAccess, frame: &mut [u32]) -> usize {
        self.shifter.borrow_mut().render(bus, frame)
    }
}
