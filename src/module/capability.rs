//! Capability interfaces a loaded module can expose.
//!
//! Every module implements [`Module`] plus exactly one capability trait; the
//! loader hands the result back wrapped in a [`Capability`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::format::ModuleType;
use crate::core::{BusAccess, BusController};
use crate::error::Result;
use crate::glue::SyncMode;

/// Interrupt controller sub-clocked by the video timing unit.
pub trait InterruptController {
    /// Advance by `cycles` controller clocks.
    fn clock(&mut self, cycles: u32);

    /// Level of the controller's interrupt request output.
    fn irq(&self) -> bool;

    /// CPU interrupt acknowledge cycle. Returns the vector number.
    fn acknowledge(&mut self) -> u8;

    /// Pulse the event input of timer `timer` (0 = A .. 3 = D).
    fn timer_event(&mut self, _timer: usize) {}

    /// Drive general purpose input `line` high or low.
    fn set_input(&mut self, _line: u8, _high: bool) {}
}

pub type SharedInterruptController = Rc<RefCell<dyn InterruptController>>;

/// Everything a module may wire itself to during machine assembly.
pub struct AttachContext<'a> {
    pub bus: &'a mut BusController,
    /// Interrupt priority level presented to the CPU.
    pub ipl: Rc<Cell<u8>>,
    /// Published by the first module that provides one.
    pub interrupt_controller: Option<SharedInterruptController>,
    /// Video timing currently programmed into the sync register.
    pub sync_mode: Rc<Cell<SyncMode>>,
}

impl<'a> AttachContext<'a> {
    pub fn new(bus: &'a mut BusController) -> Self {
        Self {
            bus,
            ipl: Rc::new(Cell::new(0)),
            interrupt_controller: None,
            sync_mode: Rc::new(Cell::new(SyncMode::Hz50)),
        }
    }
}

/// Lifecycle shared by every capability.
pub trait Module {
    fn name(&self) -> &str;

    fn interface_version(&self) -> u32;

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self);

    fn shutdown(&mut self) {}

    /// Register I/O handlers and connect interrupt lines.
    fn attach(&mut self, ctx: &mut AttachContext<'_>) -> Result<()>;
}

pub trait CpuModule: Module {
    /// Run for up to `cycles` cycles and return how many were consumed.
    fn execute(&mut self, bus: &mut dyn BusAccess, cycles: u32) -> u32;

    fn set_ipl(&mut self, level: u8);
}

pub trait VideoModule: Module {
    /// Width and height of the current display mode.
    fn dimensions(&self) -> (usize, usize);

    /// Draw one frame into `frame` (0x00RRGGBB). Returns pixels written.
    fn render(&mut self, bus: &mut dyn BusAccess, frame: &mut [u32]) -> usize;
}

pub trait AudioModule: Module {
    fn sample_rate(&self) -> u32;

    fn set_sample_rate(&mut self, _rate: u32) {}

    /// Fill interleaved stereo `out`. Returns frames written.
    fn generate(&mut self, out: &mut [i16]) -> usize;
}

pub trait IoModule: Module {
    fn clock(&mut self, cycles: u32);

    fn read_register(&mut self, offset: u32) -> u8;

    fn write_register(&mut self, offset: u32, value: u8);
}

/// Aggregate of the other capabilities, for modules that bundle a chipset.
pub trait SystemModule: Module {
    fn cpu(&mut self) -> Option<&mut dyn CpuModule>;

    fn video(&mut self) -> Option<&mut dyn VideoModule>;

    fn audio(&mut self) -> Option<&mut dyn AudioModule>;

    fn io(&mut self, index: usize) -> Option<&mut dyn IoModule>;
}

/// A resolved module interface.
pub enum Capability {
    Cpu(Box<dyn CpuModule>),
    Video(Box<dyn VideoModule>),
    Audio(Box<dyn AudioModule>),
    Io(Box<dyn IoModule>),
    System(Box<dyn SystemModule>),
}

macro_rules! dispatch {
    ($cap:expr, $m:ident => $body:expr) => {
        match $cap {
            Capability::Cpu($m) => $body,
            Capability::Video($m) => $body,
            Capability::Audio($m) => $body,
            Capability::Io($m) => $body,
            Capability::System($m) => $body,
        }
    };
}

impl Capability {
    pub fn module_type(&self) -> ModuleType {
        match self {
            Capability::Cpu(_) => ModuleType::Cpu,
            Capability::Video(_) => ModuleType::Video,
            Capability::Audio(_) => ModuleType::Audio,
            Capability::Io(_) => ModuleType::Io,
            Capability::System(_) => ModuleType::System,
        }
    }

    pub fn name(&self) -> &str {
        dispatch!(self, m => m.name())
    }

    pub fn interface_version(&self) -> u32 {
        dispatch!(self, m => m.interface_version())
    }

    pub fn init(&mut self) -> Result<()> {
        dispatch!(self, m => m.init())
    }

    pub fn reset(&mut self) {
        dispatch!(self, m => m.reset())
    }

    pub fn shutdown(&mut self) {
        dispatch!(self, m => m.shutdown())
    }

    pub fn attach(&mut self, ctx: &mut AttachContext<'_>) -> Result<()> {
        dispatch!(self, m => m.attach(ctx))
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self.module_type(), self.name())
    }
}
