// Copyright (C) 2025 Dayton Fishell
// STBox Machine Emulator Core
// This file is part of STBox.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! YM2149 programmable sound generator registers and synthesis

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;
use log::debug;

use crate::core::{IoDevice, IoHandler, SharedDevice};
use crate::error::Result;
use crate::module::{AttachContext, AudioModule, INTERFACE_VERSION, Module};

pub const PSG_BASE: u32 = 0xFF_8800;
pub const PSG_END: u32 = 0xFF_88FF;

/// Input clock of the ST's sound chip
pub const PSG_CLOCK: u32 = 2_000_000;
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

pub const CHANNEL_COUNT: usize = 3;
const REGISTER_COUNT: usize = 16;

const REG_NOISE_PERIOD: usize = 6;
const REG_MIXER: usize = 7;
const REG_AMPLITUDE_A: usize = 8;
const REG_ENV_FINE: usize = 11;
const REG_ENV_COARSE: usize = 12;
const REG_ENV_SHAPE: usize = 13;
const REG_PORT_A: usize = 14;
const REG_PORT_B: usize = 15;

/// Bits that exist in each register; the rest read back as zero.
const READ_MASK: [u8; REGISTER_COUNT] = [
    0xFF, 0x0F, 0xFF, 0x0F, 0xFF, 0x0F, 0x1F, 0xFF, 0x1F, 0x1F, 0x1F, 0xFF, 0xFF, 0x0F, 0xFF, 0xFF,
];

/// Logarithmic amplitude curve, roughly 3dB per step.
pub const VOLUME_TABLE: [i16; 16] = [
    0, 256, 362, 512, 724, 1024, 1448, 2048, 2896, 4096, 5793, 8192, 11585, 16384, 23170, 32767,
];

const ENVELOPE_STEPS: u8 = 32;
const LFSR_SEED: u32 = 1;

bitflags! {
    /// Mixer register; a set bit disables the source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Mixer: u8 {
        const TONE_A = 0x01;
        const TONE_B = 0x02;
        const TONE_C = 0x04;
        const NOISE_A = 0x08;
        const NOISE_B = 0x10;
        const NOISE_C = 0x20;
        const PORT_A_OUT = 0x40;
        const PORT_B_OUT = 0x80;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct EnvelopeShape: u8 {
        const HOLD = 0x01;
        const ALTERNATE = 0x02;
        const ATTACK = 0x04;
        const CONTINUE = 0x08;
    }
}

const AMPLITUDE_USES_ENVELOPE: u8 = 0x10;

pub type PortWrite = Box<dyn FnMut(u8)>;
pub type PortRead = Box<dyn FnMut() -> u8>;

#[derive(Debug, Clone, Copy, Default)]
struct ToneState {
    counter: u16,
    output: bool,
}

#[derive(Debug, Clone, Copy)]
struct EnvelopeState {
    counter: u32,
    step: u8,
    first_cycle: bool,
    odd_cycle: bool,
}

impl Default for EnvelopeState {
    fn default() -> Self {
        Self {
            counter: 0,
            step: 0,
            first_cycle: true,
            odd_cycle: false,
        }
    }
}

#[derive(Default)]
struct Port {
    read: Option<PortRead>,
    write: Option<PortWrite>,
}

/// Software representation of the YM2149
pub struct Psg {
    regs: [u8; REGISTER_COUNT],
    selected: u8,
    tones: [ToneState; CHANNEL_COUNT],
    noise_counter: u8,
    noise_half: bool,
    lfsr: u32,
    envelope: EnvelopeState,
    clock: u32,
    sample_rate: u32,
    sample_acc: u64,
    ports: [Port; 2],
}

impl Psg {
    pub fn new() -> Self {
        Self {
            regs: [0; REGISTER_COUNT],
            selected: 0,
            tones: [ToneState::default(); CHANNEL_COUNT],
            noise_counter: 0,
            noise_half: false,
            lfsr: LFSR_SEED,
            envelope: EnvelopeState::default(),
            clock: PSG_CLOCK,
            sample_rate: DEFAULT_SAMPLE_RATE,
            sample_acc: 0,
            ports: [Port::default(), Port::default()],
        }
    }

    /// Clear registers and generator state. Port hooks stay connected.
    pub fn reset(&mut self) {
        self.regs = [0; REGISTER_COUNT];
        self.selected = 0;
        self.tones = [ToneState::default(); CHANNEL_COUNT];
        self.noise_counter = 0;
        self.noise_half = false;
        self.lfsr = LFSR_SEED;
        self.envelope = EnvelopeState::default();
        self.sample_acc = 0;
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, rate: u32) {
        self.sample_rate = rate.max(1);
        self.sample_acc = 0;
    }

    /// Connect host hooks for I/O port `port` (0 = A, 1 = B).
    pub fn set_port_hooks(&mut self, port: usize, read: Option<PortRead>, write: Option<PortWrite>) {
        if let Some(slot) = self.ports.get_mut(port) {
            slot.read = read;
            slot.write = write;
        }
    }

    pub fn select(&mut self, register: u8) {
        self.selected = register;
    }

    pub fn read_data(&mut self) -> u8 {
        match self.selected as usize {
            reg @ (REG_PORT_A | REG_PORT_B) => {
                let port = &mut self.ports[reg - REG_PORT_A];
                match port.read.as_mut() {
                    Some(read) => read(),
                    None => self.regs[reg],
                }
            }
            reg if reg < REGISTER_COUNT => self.regs[reg] & READ_MASK[reg],
            _ => 0xFF,
        }
    }

    pub fn write_data(&mut self, value: u8) {
        if (self.selected as usize) < REGISTER_COUNT {
            self.write_register(self.selected as usize, value);
        }
    }

    pub fn read_register(&self, reg: usize) -> u8 {
        self.regs
            .get(reg)
            .map(|v| v & READ_MASK[reg])
            .unwrap_or(0xFF)
    }

    pub fn write_register(&mut self, reg: usize, value: u8) {
        if reg >= REGISTER_COUNT {
            return;
        }
        self.regs[reg] = value;
        match reg {
            REG_ENV_SHAPE => self.envelope = EnvelopeState::default(),
            REG_PORT_A | REG_PORT_B => {
                if let Some(write) = self.ports[reg - REG_PORT_A].write.as_mut() {
                    write(value);
                }
            }
            _ => {}
        }
    }

    fn mixer(&self) -> Mixer {
        Mixer::from_bits_truncate(self.regs[REG_MIXER])
    }

    fn tone_period(&self, ch: usize) -> u16 {
        let fine = u16::from(self.regs[ch * 2]);
        let coarse = u16::from(self.regs[ch * 2 + 1] & 0x0F);
        ((coarse << 8) | fine).max(1)
    }

    fn envelope_period(&self) -> u32 {
        let period =
            u32::from(self.regs[REG_ENV_FINE]) | (u32::from(self.regs[REG_ENV_COARSE]) << 8);
        period.max(1)
    }

    fn noise_output(&self) -> bool {
        self.lfsr & 1 != 0
    }

    /// Run the generators for one clock/8 tick.
    pub fn step(&mut self) {
        for ch in 0..CHANNEL_COUNT {
            let period = self.tone_period(ch);
            let tone = &mut self.tones[ch];
            tone.counter += 1;
            if tone.counter >= period {
                tone.counter = 0;
                tone.output = !tone.output;
            }
        }

        // noise runs at half the tone rate
        self.noise_half = !self.noise_half;
        if self.noise_half {
            let period = (self.regs[REG_NOISE_PERIOD] & 0x1F).max(1);
            self.noise_counter += 1;
            if self.noise_counter >= period {
                self.noise_counter = 0;
                let feedback = (self.lfsr ^ (self.lfsr >> 3)) & 1;
                self.lfsr = (self.lfsr >> 1) | (feedback << 16);
                if self.lfsr == 0 {
                    self.lfsr = LFSR_SEED;
                }
            }
        }

        let period = self.envelope_period();
        let env = &mut self.envelope;
        env.counter += 1;
        if env.counter >= period {
            env.counter = 0;
            env.step += 1;
            if env.step >= ENVELOPE_STEPS {
                env.step = 0;
                env.first_cycle = false;
                env.odd_cycle = !env.odd_cycle;
            }
        }
    }

    /// Current envelope output, 0-15.
    pub fn envelope_level(&self) -> u8 {
        let shape = EnvelopeShape::from_bits_truncate(self.regs[REG_ENV_SHAPE]);
        let attack = shape.contains(EnvelopeShape::ATTACK);
        let env = &self.envelope;
        let ramp = |up: bool| if up { env.step } else { ENVELOPE_STEPS - 1 - env.step };
        let value = if env.first_cycle {
            ramp(attack)
        } else if !shape.contains(EnvelopeShape::CONTINUE) {
            0
        } else if shape.contains(EnvelopeShape::HOLD) {
            if attack ^ shape.contains(EnvelopeShape::ALTERNATE) {
                ENVELOPE_STEPS - 1
            } else {
                0
            }
        } else if shape.contains(EnvelopeShape::ALTERNATE) {
            ramp(attack ^ env.odd_cycle)
        } else {
            ramp(attack)
        };
        value >> 1
    }

    /// Logical output of channel `ch` after the mixer.
    pub fn channel_output(&self, ch: usize) -> bool {
        let mixer = self.mixer();
        let tone_off = mixer.bits() & (1 << ch) != 0;
        let noise_off = mixer.bits() & (1 << (ch + 3)) != 0;
        (tone_off || self.tones[ch].output) && (noise_off || self.noise_output())
    }

    /// Amplitude level of channel `ch`, 0-15.
    pub fn channel_level(&self, ch: usize) -> u8 {
        let amplitude = self.regs[REG_AMPLITUDE_A + ch];
        if amplitude & AMPLITUDE_USES_ENVELOPE != 0 {
            self.envelope_level()
        } else {
            amplitude & 0x0F
        }
    }

    fn mix(&self) -> i16 {
        let sum: i32 = (0..CHANNEL_COUNT)
            .filter(|&ch| self.channel_output(ch))
            .map(|ch| i32::from(VOLUME_TABLE[self.channel_level(ch) as usize]))
            .sum();
        (sum / CHANNEL_COUNT as i32).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
    }

    /// Fill `out` with interleaved stereo frames. Returns frames written.
    pub fn generate(&mut self, out: &mut [i16]) -> usize {
        let threshold = u64::from(self.sample_rate) * 8;
        let mut frames = 0;
        for frame in out.chunks_exact_mut(2) {
            self.sample_acc += u64::from(self.clock);
            while self.sample_acc >= threshold {
                self.sample_acc -= threshold;
                self.step();
            }
            let sample = self.mix();
            frame[0] = sample;
            frame[1] = sample;
            frames += 1;
        }
        frames
    }
}

impl Default for Psg {
    fn default() -> Self {
        Self::new()
    }
}

/// Bus surface: select/read at +0, data write at +2, mirrored every 4 bytes.
impl IoDevice for Psg {
    fn read_u8(&mut self, offset: u32) -> Option<u8> {
        Some(match offset & 3 {
            0 => self.read_data(),
            _ => 0xFF,
        })
    }

    fn write_u8(&mut self, offset: u32, value: u8) -> bool {
        match offset & 3 {
            0 => self.select(value),
            2 => self.write_data(value),
            _ => {}
        }
        true
    }
}

pub struct PsgModule {
    psg: Rc<RefCell<Psg>>,
}

impl PsgModule {
    pub const ENTRY: &'static str = "psg_entry";
    pub const NAME: &'static str = "YM2149 PSG";

    pub fn new() -> Self {
        Self {
            psg: Rc::new(RefCell::new(Psg::new())),
        }
    }

    pub fn shared(&self) -> Rc<RefCell<Psg>> {
        self.psg.clone()
    }
}

impl Default for PsgModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for PsgModule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn interface_version(&self) -> u32 {
        INTERFACE_VERSION
    }

    fn reset(&mut self) {
        self.psg.borrow_mut().reset();
    }

    fn attach(&mut self, ctx: &mut AttachContext<'_>) -> Result<()> {
        let device: SharedDevice = self.psg.clone();
        ctx.bus
            .register_io(IoHandler::new("psg", PSG_BASE, PSG_END, device))
    }
}

impl AudioModule for PsgModule {
    fn sample_rate(&self) -> u32 {
        self.psg.borrow().sample_rate()
    }

    fn set_sample_rate(&mut self, rate: u32) {
        debug!("psg: sample rate {rate} Hz");
        self.psg.borrow_mut().set_sample_rate(rate);
    }

    fn generate(&mut self, out: &mut [i16]) -> usize {
        self.psg.borrow_mut().generate(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn program(psg: &mut Psg, writes: &[(usize, u8)]) {
        for &(reg, value) in writes {
            psg.write_register(reg, value);
        }
    }

    #[test]
    fn unused_register_bits_read_as_zero() {
        let mut psg = Psg::new();
        for reg in 0..REGISTER_COUNT {
            psg.write_register(reg, 0xFF);
        }
        assert_eq!(psg.read_register(1), 0x0F);
        assert_eq!(psg.read_register(REG_NOISE_PERIOD), 0x1F);
        assert_eq!(psg.read_register(REG_AMPLITUDE_A), 0x1F);
        assert_eq!(psg.read_register(REG_ENV_SHAPE), 0x0F);
        assert_eq!(psg.read_register(REG_ENV_COARSE), 0xFF);
    }

    #[test]
    fn select_and_data_through_bus_offsets() {
        let mut psg = Psg::new();
        assert!(psg.write_u8(0, 8));
        assert!(psg.write_u8(2, 0x0C));
        assert_eq!(psg.read_u8(0), Some(0x0C));
        assert_eq!(psg.read_u8(2), Some(0xFF));
        // mirrored every four bytes
        assert!(psg.write_u8(0x84, 9));
        assert!(psg.write_u8(0x86, 0x03));
        assert_eq!(psg.read_register(9), 0x03);
    }

    #[test]
    fn noise_is_deterministic_across_fresh_instances() {
        let setup = [(REG_NOISE_PERIOD, 0x03), (REG_MIXER, 0x37), (REG_AMPLITUDE_A, 0x0F)];
        let mut a = Psg::new();
        let mut b = Psg::new();
        program(&mut a, &setup);
        program(&mut b, &setup);
        let mut out_a = vec![0i16; 2048];
        let mut out_b = vec![0i16; 2048];
        a.generate(&mut out_a);
        b.generate(&mut out_b);
        assert_eq!(out_a, out_b);
        // the noise actually moved
        assert!(out_a.iter().any(|&s| s == 0));
        assert!(out_a.iter().any(|&s| s != 0));
    }

    #[test]
    fn lfsr_never_reaches_zero() {
        let mut psg = Psg::new();
        psg.write_register(REG_NOISE_PERIOD, 1);
        for _ in 0..200_000 {
            psg.step();
            assert_ne!(psg.lfsr, 0);
        }
    }

    #[test]
    fn tone_and_noise_disabled_is_constant_on() {
        let mut psg = Psg::new();
        program(&mut psg, &[(0, 1), (REG_MIXER, 0x3F), (REG_AMPLITUDE_A, 0x0F)]);
        for _ in 0..100 {
            psg.step();
            assert!(psg.channel_output(0));
        }
        let mut out = vec![0i16; 64];
        assert_eq!(psg.generate(&mut out), 32);
        let expected = VOLUME_TABLE[15] / 3;
        assert!(out.iter().all(|&s| s == expected));
    }

    #[test]
    fn tone_toggles_at_its_period() {
        let mut psg = Psg::new();
        program(&mut psg, &[(0, 2), (REG_MIXER, 0x3E)]);
        assert!(!psg.channel_output(0));
        psg.step();
        assert!(!psg.channel_output(0));
        psg.step();
        assert!(psg.channel_output(0));
        psg.step();
        psg.step();
        assert!(!psg.channel_output(0));
    }

    #[test]
    fn attack_then_hold_high() {
        let mut psg = Psg::new();
        // continue | attack | hold
        program(&mut psg, &[(REG_ENV_FINE, 1), (REG_ENV_SHAPE, 0x0D)]);
        assert_eq!(psg.envelope_level(), 0);
        for _ in 0..31 {
            psg.step();
        }
        assert_eq!(psg.envelope_level(), 15);
        for _ in 0..100 {
            psg.step();
            assert_eq!(psg.envelope_level(), 15);
        }
    }

    #[test]
    fn decay_without_continue_drops_to_zero() {
        let mut psg = Psg::new();
        program(&mut psg, &[(REG_ENV_FINE, 1), (REG_ENV_SHAPE, 0x00)]);
        assert_eq!(psg.envelope_level(), 15);
        for _ in 0..40 {
            psg.step();
        }
        assert_eq!(psg.envelope_level(), 0);
    }

    #[test]
    fn alternate_reverses_direction_each_cycle() {
        let mut psg = Psg::new();
        // continue | alternate: down, up, down
        program(&mut psg, &[(REG_ENV_FINE, 1), (REG_ENV_SHAPE, 0x0A)]);
        for _ in 0..32 {
            psg.step();
        }
        assert_eq!(psg.envelope_level(), 0);
        for _ in 0..31 {
            psg.step();
        }
        assert_eq!(psg.envelope_level(), 15);
    }

    #[test]
    fn shape_write_restarts_envelope() {
        let mut psg = Psg::new();
        program(&mut psg, &[(REG_ENV_FINE, 1), (REG_ENV_SHAPE, 0x0C)]);
        for _ in 0..20 {
            psg.step();
        }
        assert_ne!(psg.envelope_level(), 0);
        psg.write_register(REG_ENV_SHAPE, 0x0C);
        assert_eq!(psg.envelope_level(), 0);
    }

    #[test]
    fn envelope_amplitude_selects_envelope_level() {
        let mut psg = Psg::new();
        program(&mut psg, &[(REG_AMPLITUDE_A + 1, 0x10), (REG_ENV_SHAPE, 0x00)]);
        assert_eq!(psg.channel_level(1), 15);
        psg.write_register(REG_AMPLITUDE_A + 1, 0x07);
        assert_eq!(psg.channel_level(1), 7);
    }

    #[test]
    fn port_hooks_see_port_traffic() {
        let written = Rc::new(Cell::new(0u8));
        let sink = written.clone();
        let mut psg = Psg::new();
        psg.set_port_hooks(0, Some(Box::new(|| 0x5A)), Some(Box::new(move |v| sink.set(v))));
        psg.select(REG_PORT_A as u8);
        psg.write_data(0x27);
        assert_eq!(written.get(), 0x27);
        assert_eq!(psg.read_data(), 0x5A);
        // port B has no hooks and reads back its latch
        psg.select(REG_PORT_B as u8);
        psg.write_data(0x81);
        assert_eq!(psg.read_data(), 0x81);
    }
}
