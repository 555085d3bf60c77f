//! MC68901 multi-function peripheral: timers, GPIP and interrupt controller

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;
use log::trace;

use crate::core::{IoDevice, IoHandler, SharedDevice};
use crate::error::Result;
use crate::module::{
    AttachContext, INTERFACE_VERSION, InterruptController, IoModule, Module,
    SharedInterruptController,
};

pub const MFP_BASE: u32 = 0xFF_FA00;
pub const MFP_END: u32 = 0xFF_FA3F;

/// Vector returned when no source is eligible.
pub const SPURIOUS_VECTOR: u8 = 0x18;

/// Prescale divisors selected by the low three control bits.
const PRESCALE: [u32; 8] = [0, 4, 10, 16, 50, 64, 100, 200];
const EVENT_COUNT_MODE: u8 = 0x08;

const GPIP: u32 = 0x01;
const AER: u32 = 0x03;
const DDR: u32 = 0x05;
const IERA: u32 = 0x07;
const IERB: u32 = 0x09;
const IPRA: u32 = 0x0B;
const IPRB: u32 = 0x0D;
const ISRA: u32 = 0x0F;
const ISRB: u32 = 0x11;
const IMRA: u32 = 0x13;
const IMRB: u32 = 0x15;
const VR: u32 = 0x17;
const TACR: u32 = 0x19;
const TBCR: u32 = 0x1B;
const TCDCR: u32 = 0x1D;
const TADR: u32 = 0x1F;
const TBDR: u32 = 0x21;
const TCDR: u32 = 0x23;
const TDDR: u32 = 0x25;
const SCR: u32 = 0x27;
const UCR: u32 = 0x29;
const RSR: u32 = 0x2B;
const TSR: u32 = 0x2D;
const UDR: u32 = 0x2F;

/// Interrupt source numbers, 15 = highest priority.
pub mod source {
    pub const GPIP0: u8 = 0;
    pub const GPIP1: u8 = 1;
    pub const GPIP2: u8 = 2;
    pub const GPIP3: u8 = 3;
    pub const TIMER_D: u8 = 4;
    pub const TIMER_C: u8 = 5;
    pub const GPIP4: u8 = 6;
    pub const GPIP5: u8 = 7;
    pub const TIMER_B: u8 = 8;
    pub const TX_ERROR: u8 = 9;
    pub const TX_EMPTY: u8 = 10;
    pub const RX_ERROR: u8 = 11;
    pub const RX_FULL: u8 = 12;
    pub const TIMER_A: u8 = 13;
    pub const GPIP6: u8 = 14;
    pub const GPIP7: u8 = 15;
}

const TIMER_SOURCE: [u8; 4] = [
    source::TIMER_A,
    source::TIMER_B,
    source::TIMER_C,
    source::TIMER_D,
];

const GPIP_SOURCE: [u8; 8] = [
    source::GPIP0,
    source::GPIP1,
    source::GPIP2,
    source::GPIP3,
    source::GPIP4,
    source::GPIP5,
    source::GPIP6,
    source::GPIP7,
];

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct VectorFlags: u8 {
        /// Software end-of-interrupt: acknowledged sources enter service.
        const SOFTWARE_EOI = 0x08;
    }
}

/// One of the four 8-bit down-counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
    control: u8,
    reload: u8,
    counter: u8,
    accumulator: u64,
}

impl Timer {
    fn divisor(&self) -> u32 {
        PRESCALE[(self.control & 0x07) as usize]
    }

    pub fn is_event_count(&self) -> bool {
        self.control == EVENT_COUNT_MODE
    }

    pub fn is_stopped(&self) -> bool {
        self.control == 0
    }

    pub fn control(&self) -> u8 {
        self.control
    }

    pub fn counter(&self) -> u8 {
        self.counter
    }

    fn set_control(&mut self, value: u8) {
        self.control = value & 0x0F;
        if self.is_stopped() {
            self.accumulator = 0;
        }
    }

    fn write_data(&mut self, value: u8) {
        self.reload = value;
        if self.is_stopped() {
            self.counter = value;
        }
    }

    /// A reload of 0 counts a full 256.
    fn tick(&mut self) -> bool {
        self.counter = self.counter.wrapping_sub(1);
        if self.counter == 0 {
            self.counter = self.reload;
            true
        } else {
            false
        }
    }

    /// Advance by `cycles` MFP clocks; returns how many times the counter expired.
    pub fn clock(&mut self, cycles: u32) -> u32 {
        let divisor = u64::from(self.divisor());
        if divisor == 0 || self.is_event_count() {
            return 0;
        }
        self.accumulator += u64::from(cycles);
        let mut expired = 0;
        while self.accumulator >= divisor {
            self.accumulator -= divisor;
            if self.tick() {
                expired += 1;
            }
        }
        expired
    }

    fn event(&mut self) -> bool {
        self.is_event_count() && self.tick()
    }
}

pub struct Mfp {
    gpip: u8,
    gpip_in: u8,
    aer: u8,
    ddr: u8,
    ier: u16,
    ipr: u16,
    isr: u16,
    imr: u16,
    vr: u8,
    timers: [Timer; 4],
    scr: u8,
    ucr: u8,
    rsr: u8,
    tsr: u8,
    udr: u8,
}

impl Mfp {
    pub fn new() -> Self {
        Self {
            gpip: 0,
            // inputs idle high
            gpip_in: 0xFF,
            aer: 0,
            ddr: 0,
            ier: 0,
            ipr: 0,
            isr: 0,
            imr: 0,
            vr: 0,
            timers: [Timer::default(); 4],
            scr: 0,
            ucr: 0,
            rsr: 0,
            tsr: 0,
            udr: 0,
        }
    }

    pub fn reset(&mut self) {
        let gpip_in = self.gpip_in;
        *self = Self::new();
        self.gpip_in = gpip_in;
    }

    pub fn timer(&self, index: usize) -> &Timer {
        &self.timers[index]
    }

    pub fn pending(&self) -> u16 {
        self.ipr
    }

    pub fn in_service(&self) -> u16 {
        self.isr
    }

    /// Latch `source` as pending if it is enabled.
    pub fn trigger(&mut self, source: u8) {
        let bit = 1u16 << (source & 0x0F);
        if self.ier & bit != 0 {
            self.ipr |= bit;
            trace!("mfp: source {source} pending");
        }
    }

    /// Highest pending and unmasked source that outranks everything in service.
    fn eligible(&self) -> Option<u8> {
        for src in (0..16u8).rev() {
            let bit = 1u16 << src;
            if self.isr & bit != 0 {
                return None;
            }
            if self.ipr & self.imr & bit != 0 {
                return Some(src);
            }
        }
        None
    }

    fn read_gpip(&self) -> u8 {
        (self.gpip_in & !self.ddr) | (self.gpip & self.ddr)
    }

    pub fn read_register(&self, offset: u32) -> u8 {
        let hi = |r: u16| (r >> 8) as u8;
        let lo = |r: u16| r as u8;
        match offset {
            GPIP => self.read_gpip(),
            AER => self.aer,
            DDR => self.ddr,
            IERA => hi(self.ier),
            IERB => lo(self.ier),
            IPRA => hi(self.ipr),
            IPRB => lo(self.ipr),
            ISRA => hi(self.isr),
            ISRB => lo(self.isr),
            IMRA => hi(self.imr),
            IMRB => lo(self.imr),
            VR => self.vr,
            TACR => self.timers[0].control,
            TBCR => self.timers[1].control,
            TCDCR => (self.timers[2].control << 4) | self.timers[3].control,
            TADR => self.timers[0].counter,
            TBDR => self.timers[1].counter,
            TCDR => self.timers[2].counter,
            TDDR => self.timers[3].counter,
            SCR => self.scr,
            UCR => self.ucr,
            RSR => self.rsr,
            TSR => self.tsr,
            UDR => self.udr,
            _ => 0xFF,
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u8) {
        let hi = |r: u16, v: u8| (r & 0x00FF) | (u16::from(v) << 8);
        let lo = |r: u16, v: u8| (r & 0xFF00) | u16::from(v);
        match offset {
            GPIP => self.gpip = value,
            AER => self.aer = value,
            DDR => self.ddr = value,
            IERA | IERB => {
                self.ier = if offset == IERA {
                    hi(self.ier, value)
                } else {
                    lo(self.ier, value)
                };
                self.ipr &= self.ier;
            }
            IPRA => self.ipr &= (u16::from(value) << 8) | 0x00FF,
            IPRB => self.ipr &= u16::from(value) | 0xFF00,
            ISRA => self.isr &= (u16::from(value) << 8) | 0x00FF,
            ISRB => self.isr &= u16::from(value) | 0xFF00,
            IMRA => self.imr = hi(self.imr, value),
            IMRB => self.imr = lo(self.imr, value),
            VR => self.vr = value,
            TACR => self.timers[0].set_control(value),
            TBCR => self.timers[1].set_control(value),
            TCDCR => {
                self.timers[2].set_control((value >> 4) & 0x07);
                self.timers[3].set_control(value & 0x07);
            }
            TADR => self.timers[0].write_data(value),
            TBDR => self.timers[1].write_data(value),
            TCDR => self.timers[2].write_data(value),
            TDDR => self.timers[3].write_data(value),
            SCR => self.scr = value,
            UCR => self.ucr = value,
            RSR => self.rsr = value,
            TSR => self.tsr = value,
            UDR => self.udr = value,
            _ => {}
        }
    }
}

impl Default for Mfp {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptController for Mfp {
    fn clock(&mut self, cycles: u32) {
        for (idx, src) in TIMER_SOURCE.iter().enumerate() {
            if self.timers[idx].clock(cycles) > 0 {
                self.trigger(*src);
            }
        }
    }

    fn irq(&self) -> bool {
        self.eligible().is_some()
    }

    fn acknowledge(&mut self) -> u8 {
        match self.eligible() {
            Some(src) => {
                let bit = 1u16 << src;
                self.ipr &= !bit;
                if VectorFlags::from_bits_truncate(self.vr).contains(VectorFlags::SOFTWARE_EOI) {
                    self.isr |= bit;
                }
                (self.vr & 0xF0) | src
            }
            None => SPURIOUS_VECTOR,
        }
    }

    fn timer_event(&mut self, timer: usize) {
        // only A and B have event inputs
        if timer < 2 && self.timers[timer].event() {
            self.trigger(TIMER_SOURCE[timer]);
        }
    }

    fn set_input(&mut self, line: u8, high: bool) {
        let line = line & 0x07;
        let mask = 1u8 << line;
        let was_high = self.gpip_in & mask != 0;
        if was_high == high {
            return;
        }
        if high {
            self.gpip_in |= mask;
        } else {
            self.gpip_in &= !mask;
        }
        // AER bit set = rising edge active
        let rising_active = self.aer & mask != 0;
        if high == rising_active {
            self.trigger(GPIP_SOURCE[line as usize]);
        }
    }
}

impl IoDevice for Mfp {
    fn read_u8(&mut self, offset: u32) -> Option<u8> {
        (offset <= MFP_END - MFP_BASE).then(|| self.read_register(offset))
    }

    fn write_u8(&mut self, offset: u32, value: u8) -> bool {
        if offset > MFP_END - MFP_BASE {
            return false;
        }
        self.write_register(offset, value);
        true
    }
}

/// Loadable wrapper publishing the MFP as the machine's interrupt controller.
pub struct MfpModule {
    mfp: Rc<RefCell<Mfp>>,
}

impl MfpModule {
    pub const ENTRY: &'static str = "mfp_entry";
    pub const NAME: &'static str = "MC68901 MFP";

    pub fn new() -> Self {
        Self {
            mfp: Rc::new(RefCell::new(Mfp::new())),
        }
    }

    pub fn shared(&self) -> Rc<RefCell<Mfp>> {
        self.mfp.clone()
    }
}

impl Default for MfpModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for MfpModule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn interface_version(&self) -> u32 {
        INTERFACE_VERSION
    }

    fn reset(&mut self) {
        self.mfp.borrow_mut().reset();
    }

    fn attach(&mut self, ctx: &mut AttachContext<'_>) -> Result<()> {
        let device: SharedDevice = self.mfp.clone();
        ctx.bus
            .register_io(IoHandler::new("mfp", MFP_BASE, MFP_END, device))?;
        if ctx.interrupt_controller.is_none() {
            let controller: SharedInterruptController = self.mfp.clone();
            ctx.interrupt_controller = Some(controller);
        }
        Ok(())
    }
}

impl IoModule for MfpModule {
    /// Timers run off the GLUE sub-clock, not CPU cycles.
    fn clock(&mut self, _cycles: u32) {}

    fn read_register(&mut self, offset: u32) -> u8 {
        self.mfp.borrow().read_register(offset)
    }

    fn write_register(&mut self, offset: u32, value: u8) {
        self.mfp.borrow_mut().write_register(offset, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(sources: &[u8]) -> Mfp {
        let mut mfp = Mfp::new();
        let mask = sources.iter().fold(0u16, |acc, s| acc | (1 << s));
        mfp.write_register(IERA, (mask >> 8) as u8);
        mfp.write_register(IERB, mask as u8);
        mfp.write_register(IMRA, (mask >> 8) as u8);
        mfp.write_register(IMRB, mask as u8);
        mfp
    }

    #[test]
    fn even_offsets_are_dead() {
        let mut mfp = Mfp::new();
        mfp.write_register(0x16, 0x40);
        assert_eq!(mfp.read_register(0x16), 0xFF);
        assert_eq!(mfp.read_register(VR), 0x00);
        assert_eq!(mfp.read_u8(0x40), None);
    }

    #[test]
    fn trigger_requires_enable() {
        let mut mfp = Mfp::new();
        mfp.trigger(source::TIMER_C);
        assert_eq!(mfp.pending(), 0);
        let mut mfp = enabled(&[source::TIMER_C]);
        mfp.trigger(source::TIMER_C);
        assert_eq!(mfp.read_register(IPRB), 1 << 5);
    }

    #[test]
    fn pending_writes_only_clear_zero_bits() {
        let mut mfp = enabled(&[source::TIMER_A, source::GPIP7, source::TIMER_D, source::GPIP0]);
        for s in [source::TIMER_A, source::GPIP7, source::TIMER_D, source::GPIP0] {
            mfp.trigger(s);
        }
        // clear timer A only
        mfp.write_register(IPRA, !(1 << (source::TIMER_A - 8)));
        assert_eq!(mfp.read_register(IPRA), 1 << 7);
        assert_eq!(mfp.read_register(IPRB), 0x11);
        // writing all ones changes nothing
        mfp.write_register(IPRB, 0xFF);
        assert_eq!(mfp.read_register(IPRB), 0x11);
    }

    #[test]
    fn in_service_writes_only_clear_zero_bits() {
        let mut mfp = enabled(&[source::TIMER_C, source::TIMER_D]);
        mfp.write_register(VR, 0x48);
        mfp.trigger(source::TIMER_C);
        mfp.trigger(source::TIMER_D);
        mfp.isr = 0x0030;
        mfp.write_register(ISRB, !(1 << source::TIMER_C));
        assert_eq!(mfp.in_service(), 0x0010);
    }

    #[test]
    fn disabling_a_source_drops_its_pending_bit() {
        let mut mfp = enabled(&[source::TIMER_B]);
        mfp.trigger(source::TIMER_B);
        assert_eq!(mfp.read_register(IPRA), 0x01);
        mfp.write_register(IERA, 0x00);
        assert_eq!(mfp.pending(), 0);
    }

    #[test]
    fn acknowledge_serves_highest_priority_first() {
        let mut mfp = enabled(&[source::TIMER_A, source::TIMER_C]);
        mfp.write_register(VR, 0x40);
        mfp.trigger(source::TIMER_C);
        mfp.trigger(source::TIMER_A);

        assert_eq!(mfp.acknowledge(), 0x40 | source::TIMER_A);
        assert_eq!(mfp.pending(), 1 << source::TIMER_C);
        assert_eq!(mfp.acknowledge(), 0x40 | source::TIMER_C);
        assert_eq!(mfp.acknowledge(), SPURIOUS_VECTOR);
    }

    #[test]
    fn in_service_source_blocks_lower_priorities() {
        let mut mfp = enabled(&[source::TIMER_B, source::TIMER_D]);
        mfp.write_register(VR, 0x48); // software EOI
        mfp.trigger(source::TIMER_B);
        assert_eq!(mfp.acknowledge(), 0x40 | source::TIMER_B);
        assert_eq!(mfp.in_service(), 1 << source::TIMER_B);

        mfp.trigger(source::TIMER_D);
        assert!(!mfp.irq());
        assert_eq!(mfp.acknowledge(), SPURIOUS_VECTOR);

        mfp.write_register(ISRA, 0x00);
        assert!(mfp.irq());
        assert_eq!(mfp.acknowledge(), 0x40 | source::TIMER_D);
    }

    #[test]
    fn masked_sources_stay_pending_without_irq() {
        let mut mfp = enabled(&[source::TIMER_A]);
        mfp.write_register(IMRA, 0x00);
        mfp.trigger(source::TIMER_A);
        assert!(!mfp.irq());
        assert_eq!(mfp.pending(), 1 << source::TIMER_A);
    }

    #[test]
    fn timer_expires_after_reload_times_prescale() {
        let mut mfp = enabled(&[source::TIMER_C]);
        mfp.write_register(TCDR, 3);
        mfp.write_register(TCDCR, 0x10); // C: divide by 4
        mfp.clock(11);
        assert_eq!(mfp.timer(2).counter(), 1);
        assert!(!mfp.irq());
        mfp.clock(1);
        assert!(mfp.irq());
        assert_eq!(mfp.timer(2).counter(), 3);
    }

    #[test]
    fn zero_reload_free_runs_for_256_ticks() {
        let mut timer = Timer::default();
        timer.write_data(0);
        timer.set_control(0x01);
        assert_eq!(timer.clock(4 * 255), 0);
        assert_eq!(timer.clock(4), 1);
        assert_eq!(timer.clock(4 * 256), 1);
    }

    #[test]
    fn prescaler_carry_survives_a_full_range_clock() {
        let mut timer = Timer::default();
        timer.write_data(0);
        timer.set_control(0x07); // divide by 200
        assert_eq!(timer.clock(199), 0);
        // 21474837 ticks of a 256 counter
        assert_eq!(timer.clock(u32::MAX), 83_886);
    }

    #[test]
    fn stopped_timer_ignores_clock() {
        let mut mfp = enabled(&[source::TIMER_A]);
        mfp.write_register(TADR, 1);
        mfp.clock(10_000);
        assert_eq!(mfp.pending(), 0);
    }

    #[test]
    fn event_count_mode_counts_pulses() {
        let mut mfp = enabled(&[source::TIMER_B]);
        mfp.write_register(TBDR, 2);
        mfp.write_register(TBCR, EVENT_COUNT_MODE);
        mfp.clock(1000);
        assert_eq!(mfp.pending(), 0);
        mfp.timer_event(1);
        mfp.timer_event(1);
        assert_eq!(mfp.pending(), 1 << source::TIMER_B);
    }

    #[test]
    fn gpip_edges_follow_active_edge_register() {
        let mut mfp = enabled(&[source::GPIP4]);
        // falling edge (AER clear) triggers
        mfp.set_input(4, false);
        assert_eq!(mfp.pending(), 1 << source::GPIP4);
        assert_eq!(mfp.read_register(GPIP) & 0x10, 0);
        mfp.write_register(IPRB, 0);
        mfp.set_input(4, true);
        assert_eq!(mfp.pending(), 0);
    }
}
