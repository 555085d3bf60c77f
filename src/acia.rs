//! MC6850 ACIA (keyboard port)

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bitflags::bitflags;
use log::warn;

use crate::core::{IoDevice, IoHandler, SharedDevice};
use crate::error::Result;
use crate::module::{AttachContext, INTERFACE_VERSION, IoModule, Module, SharedInterruptController};

pub const ACIA_BASE: u32 = 0xFF_FC00;
pub const ACIA_END: u32 = 0xFF_FC03;

/// MFP general purpose input wired to the ACIA interrupt output.
pub const ACIA_GPIP_LINE: u8 = 4;

pub const RX_QUEUE_CAPACITY: usize = 64;
pub const TX_BUFFER_CAPACITY: usize = 256;

const MASTER_RESET: u8 = 0x03;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        const RDRF = 0x01;
        const TDRE = 0x02;
        const IRQ = 0x80;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Control: u8 {
        const COUNTER_DIVIDE = 0x03;
        const TX_CONTROL = 0x60;
        const RX_IRQ_ENABLE = 0x80;
    }
}

const TX_IRQ_ENABLE: u8 = 0x20;

pub struct Acia {
    control: u8,
    rx_data: u8,
    rx_full: bool,
    rx_queue: VecDeque<u8>,
    tx: Vec<u8>,
}

impl Acia {
    pub fn new() -> Self {
        Self {
            control: 0,
            rx_data: 0,
            rx_full: false,
            rx_queue: VecDeque::with_capacity(RX_QUEUE_CAPACITY),
            tx: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.control = 0;
        self.rx_data = 0;
        self.rx_full = false;
        self.rx_queue.clear();
        self.tx.clear();
    }

    fn control(&self) -> Control {
        Control::from_bits_truncate(self.control)
    }

    pub fn status(&self) -> Status {
        let mut status = Status::TDRE;
        status.set(Status::RDRF, self.rx_full);
        if self.irq() {
            status.insert(Status::IRQ);
        }
        status
    }

    pub fn irq(&self) -> bool {
        let control = self.control();
        let rx = self.rx_full && control.contains(Control::RX_IRQ_ENABLE);
        let tx = (control & Control::TX_CONTROL).bits() == TX_IRQ_ENABLE;
        rx || tx
    }

    /// Queue a byte from the host side. Returns false if the queue is full.
    pub fn receive(&mut self, byte: u8) -> bool {
        if self.rx_queue.len() >= RX_QUEUE_CAPACITY {
            warn!("acia: receive queue full, dropping {byte:#04x}");
            return false;
        }
        self.rx_queue.push_back(byte);
        true
    }

    /// Drain bytes the CPU has written to the data register.
    pub fn take_transmitted(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }

    /// Move the next queued byte into the data register once it is free.
    pub fn clock(&mut self) {
        if !self.rx_full {
            if let Some(byte) = self.rx_queue.pop_front() {
                self.rx_data = byte;
                self.rx_full = true;
            }
        }
    }

    pub fn read_register(&mut self, offset: u32) -> u8 {
        match offset {
            0 => self.status().bits(),
            2 => {
                self.rx_full = false;
                self.rx_data
            }
            _ => 0xFF,
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u8) {
        match offset {
            0 => {
                if value & Control::COUNTER_DIVIDE.bits() == MASTER_RESET {
                    self.rx_full = false;
                    self.rx_queue.clear();
                }
                self.control = value;
            }
            2 => {
                if self.tx.len() >= TX_BUFFER_CAPACITY {
                    warn!("acia: transmit buffer full, dropping {value:#04x}");
                } else {
                    self.tx.push(value);
                }
            }
            _ => {}
        }
    }
}

impl Default for Acia {
    fn default() -> Self {
        Self::new()
    }
}

impl IoDevice for Acia {
    fn read_u8(&mut self, offset: u32) -> Option<u8> {
        Some(self.read_register(offset))
    }

    fn write_u8(&mut self, offset: u32, value: u8) -> bool {
        self.write_register(offset, value);
        true
    }
}

pub struct AciaModule {
    acia: Rc<RefCell<Acia>>,
    mfp: Option<SharedInterruptController>,
}

impl AciaModule {
    pub const ENTRY: &'static str = "acia_entry";
    pub const NAME: &'static str = "MC6850 ACIA";

    pub fn new() -> Self {
        Self {
            acia: Rc::new(RefCell::new(Acia::new())),
            mfp: None,
        }
    }

    pub fn shared(&self) -> Rc<RefCell<Acia>> {
        self.acia.clone()
    }
}

impl Default for AciaModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for AciaModule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn interface_version(&self) -> u32 {
        INTERFACE_VERSION
    }

    fn reset(&mut self) {
        self.acia.borrow_mut().reset();
    }

    fn attach(&mut self, ctx: &mut AttachContext<'_>) -> Result<()> {
        let device: SharedDevice = self.acia.clone();
        ctx.bus
            .register_io(IoHandler::new("acia", ACIA_BASE, ACIA_END, device))?;
        self.mfp = ctx.interrupt_controller.clone();
        Ok(())
    }
}

impl IoModule for AciaModule {
    fn clock(&mut self, _cycles: u32) {
        let irq = {
            let mut acia = self.acia.borrow_mut();
            acia.clock();
            acia.irq()
        };
        if let Some(mfp) = self.mfp.as_ref() {
            // active low
            mfp.borrow_mut().set_input(ACIA_GPIP_LINE, !irq);
        }
    }

    fn read_register(&mut self, offset: u32) -> u8 {
        self.acia.borrow_mut().read_register(offset)
    }

    fn write_register(&mut self, offset: u32, value: u8) {
        self.acia.borrow_mut().write_register(offset, value);
    }
}
