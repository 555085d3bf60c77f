//! GLUE video timing and interrupt priority unit.
//!
//! Counts CPU cycles into scanlines and frames, sub-clocks the MFP at
//! 2.4576 MHz and folds MFP, VBL and HBL requests into the single priority
//! level presented to the CPU.

use std::cell::{Cell, RefCell};
use std::ops::Range;
use std::rc::Rc;

use log::{debug, trace};

use crate::core::{IoDevice, IoHandler, SharedDevice};
use crate::error::{Error, Result};
use crate::module::{
    AttachContext, INTERFACE_VERSION, IoModule, Module, SharedInterruptController,
};

pub const GLUE_BASE: u32 = 0xFF_820A;
pub const GLUE_END: u32 = 0xFF_820B;

pub const IPL_MFP: u8 = 6;
pub const IPL_VBL: u8 = 4;
pub const IPL_HBL: u8 = 2;

/// MFP clock / CPU clock = 2.4576 MHz / 8 MHz.
const MFP_RATIO_NUM: u64 = 192;
const MFP_RATIO_DEN: u64 = 625;

const SYNC_50HZ: u8 = 0x02;
const TIMER_B: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Hz50,
    Hz60,
}

impl SyncMode {
    pub fn from_refresh(hz: u32) -> Option<Self> {
        match hz {
            50 => Some(Self::Hz50),
            60 => Some(Self::Hz60),
            _ => None,
        }
    }

    pub fn refresh_hz(self) -> u32 {
        match self {
            Self::Hz50 => 50,
            Self::Hz60 => 60,
        }
    }

    pub fn cycles_per_line(self) -> u32 {
        match self {
            Self::Hz50 => 512,
            Self::Hz60 => 508,
        }
    }

    pub fn lines_per_frame(self) -> u32 {
        match self {
            Self::Hz50 => 313,
            Self::Hz60 => 263,
        }
    }

    pub fn cycles_per_frame(self) -> u32 {
        self.cycles_per_line() * self.lines_per_frame()
    }

    fn visible_lines(self) -> Range<u32> {
        match self {
            Self::Hz50 => 63..263,
            Self::Hz60 => 34..234,
        }
    }

    /// Value of the sync register selecting this mode.
    pub fn register_value(self) -> u8 {
        match self {
            Self::Hz50 => SYNC_50HZ,
            Self::Hz60 => 0,
        }
    }
}

pub type LevelCallback = Box<dyn FnMut(u8)>;

pub struct Glue {
    mode: SyncMode,
    sync: u8,
    scanline: u32,
    line_cycles: u64,
    frame: u64,
    hbl_pending: bool,
    vbl_pending: bool,
    level: u8,
    mfp_accumulator: u64,
    mfp: Option<SharedInterruptController>,
    on_level: Option<LevelCallback>,
    mode_out: Option<Rc<Cell<SyncMode>>>,
}

impl Glue {
    pub fn new() -> Self {
        Self {
            mode: SyncMode::Hz50,
            sync: SYNC_50HZ,
            scanline: 0,
            line_cycles: 0,
            frame: 0,
            hbl_pending: false,
            vbl_pending: false,
            level: 0,
            mfp_accumulator: 0,
            mfp: None,
            on_level: None,
            mode_out: None,
        }
    }

    pub fn connect_mfp(&mut self, mfp: SharedInterruptController) {
        self.mfp = Some(mfp);
    }

    /// Install the callback that receives every change of output level.
    pub fn on_level_change(&mut self, callback: LevelCallback) {
        self.on_level = Some(callback);
    }

    /// Adopt the mode held in `cell` and publish every later change into it.
    pub fn share_mode(&mut self, cell: Rc<Cell<SyncMode>>) {
        let mode = cell.get();
        self.mode_out = Some(cell);
        self.set_mode(mode);
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: SyncMode) {
        self.sync = (self.sync & !SYNC_50HZ) | mode.register_value();
        self.apply_mode(mode);
    }

    fn apply_mode(&mut self, mode: SyncMode) {
        if mode != self.mode {
            debug!("glue: sync mode {:?}", mode);
        }
        self.mode = mode;
        if let Some(cell) = self.mode_out.as_ref() {
            cell.set(mode);
        }
    }

    pub fn scanline(&self) -> u32 {
        self.scanline
    }

    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn reset(&mut self) {
        self.scanline = 0;
        self.line_cycles = 0;
        self.frame = 0;
        self.hbl_pending = false;
        self.vbl_pending = false;
        self.mfp_accumulator = 0;
        self.set_level(0);
    }

    fn set_level(&mut self, level: u8) {
        if level == self.level {
            return;
        }
        trace!("glue: ipl {} -> {}", self.level, level);
        self.level = level;
        if let Some(callback) = self.on_level.as_mut() {
            callback(level);
        }
    }

    /// Advance by `cycles` CPU cycles.
    pub fn clock(&mut self, cycles: u32) {
        let mfp_irq = match self.mfp.as_ref() {
            Some(mfp) => {
                self.mfp_accumulator += u64::from(cycles) * MFP_RATIO_NUM;
                let sub = self.mfp_accumulator / MFP_RATIO_DEN;
                self.mfp_accumulator %= MFP_RATIO_DEN;
                let mut mfp = mfp.borrow_mut();
                if sub > 0 {
                    mfp.clock(sub as u32);
                }
                mfp.irq()
            }
            None => false,
        };

        let timer_b_events = self.advance_lines(cycles);
        if timer_b_events > 0 {
            if let Some(mfp) = self.mfp.as_ref() {
                let mut mfp = mfp.borrow_mut();
                for _ in 0..timer_b_events {
                    mfp.timer_event(TIMER_B);
                }
            }
        }

        let level = if mfp_irq {
            IPL_MFP
        } else if self.vbl_pending {
            IPL_VBL
        } else if self.hbl_pending {
            IPL_HBL
        } else {
            0
        };
        self.set_level(level);

        self.hbl_pending = false;
        self.vbl_pending = false;
    }

    /// Returns the number of visible lines completed.
    fn advance_lines(&mut self, cycles: u32) -> u32 {
        let per_line = u64::from(self.mode.cycles_per_line());
        let visible = self.mode.visible_lines();
        let mut completed = 0;
        self.line_cycles += u64::from(cycles);
        while self.line_cycles >= per_line {
            self.line_cycles -= per_line;
            if visible.contains(&self.scanline) {
                self.hbl_pending = true;
                completed += 1;
            }
            self.scanline += 1;
            if self.scanline >= self.mode.lines_per_frame() {
                self.scanline = 0;
                self.frame += 1;
                self.vbl_pending = true;
            }
        }
        completed
    }

    pub fn read_register(&self, offset: u32) -> u8 {
        match offset {
            0 => self.sync,
            _ => 0xFF,
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u8) {
        if offset == 0 {
            self.sync = value;
            let mode = if value & SYNC_50HZ != 0 {
                SyncMode::Hz50
            } else {
                SyncMode::Hz60
            };
            self.apply_mode(mode);
        }
    }
}

impl Default for Glue {
    fn default() -> Self {
        Self::new()
    }
}

impl IoDevice for Glue {
    fn read_u8(&mut self, offset: u32) -> Option<u8> {
        Some(self.read_register(offset))
    }

    fn write_u8(&mut self, offset: u32, value: u8) -> bool {
        self.write_register(offset, value);
        true
    }
}

pub struct GlueModule {
    glue: Rc<RefCell<Glue>>,
}

impl GlueModule {
    pub const ENTRY: &'static str = "glue_entry";
    pub const NAME: &'static str = "GLUE";

    pub fn new() -> Self {
        Self {
            glue: Rc::new(RefCell::new(Glue::new())),
        }
    }

    pub fn shared(&self) -> Rc<RefCell<Glue>> {
        self.glue.clone()
    }
}

impl Default for GlueModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for GlueModule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn interface_version(&self) -> u32 {
        INTERFACE_VERSION
    }

    fn reset(&mut self) {
        self.glue.borrow_mut().reset();
    }

    /// Requires an interrupt controller to have been attached already.
    fn attach(&mut self, ctx: &mut AttachContext<'_>) -> Result<()> {
        let mfp = ctx.interrupt_controller.clone().ok_or_else(|| {
            Error::invalid_state("GLUE attached before an interrupt controller")
        })?;
        let device: SharedDevice = self.glue.clone();
        ctx.bus
            .register_io(IoHandler::new("glue", GLUE_BASE, GLUE_END, device))?;

        let ipl = ctx.ipl.clone();
        let mut glue = self.glue.borrow_mut();
        glue.connect_mfp(mfp);
        glue.share_mode(ctx.sync_mode.clone());
        glue.on_level_change(Box::new(move |level| ipl.set(level)));
        Ok(())
    }
}

impl IoModule for GlueModule {
    fn clock(&mut self, cycles: u32) {
        self.glue.borrow_mut().clock(cycles);
    }

    fn read_register(&mut self, offset: u32) -> u8 {
        self.glue.borrow().read_register(offset)
    }

    fn write_register(&mut self, offset: u32, value: u8) {
        self.glue.borrow_mut().write_register(offset, value);
    }
}
