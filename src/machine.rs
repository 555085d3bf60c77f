//! Machine assembly and the per-frame clock loop
//!
//! A [`Machine`] owns the bus, the module loader and the registry. It loads
//! every module named by a [`MachineConfig`], wires each one to the bus and
//! then drives them all from a single loop: the CPU runs a slice, the I/O
//! modules are clocked by the cycles it consumed, and at the end of the frame
//! the video module renders and the audio module fills its buffer.

use std::cell::Cell;
use std::rc::Rc;

use log::{debug, info, warn};

use crate::config::{MachineConfig, ModuleSpec};
use crate::core::{BusAccess, BusController, BusStats};
use crate::error::{Error, Result};
use crate::glue::{GLUE_BASE, IPL_MFP, SyncMode};
use crate::module::{
    AttachContext, AudioModule, Capability, CpuModule, ExternalMemory, Loader, ModuleCatalog,
    ModuleHandle, Registry, SharedInterruptController, Storage, VideoModule,
};

/// CPU cycles run between two rounds of peripheral clocking.
pub const SLICE_CYCLES: u32 = 512;

/// CPU clock: 8 MHz
pub const CPU_CLOCK_HZ: u32 = 8_000_000;

/// First 68000 autovector; level n uses `AUTOVECTOR_BASE + n`.
pub const AUTOVECTOR_BASE: u8 = 24;

/// Bus handlers a module registered while attaching.
struct Attachment {
    handle: ModuleHandle,
    bases: Vec<u32>,
    /// Kept a reference to another module's interrupt controller.
    holds_controller: bool,
}

pub struct Machine {
    bus: BusController,
    loader: Loader,
    registry: Registry,
    attachments: Vec<Attachment>,
    ipl: Rc<Cell<u8>>,
    interrupt_controller: Option<SharedInterruptController>,
    controller_owner: Option<ModuleHandle>,
    mode: Rc<Cell<SyncMode>>,
    sample_rate: u32,
    framebuffer: Vec<u32>,
    audio: Vec<i16>,
    frame_count: u64,
    total_cycles: u64,
}

impl Machine {
    /// Build a machine from `config`, reading ROM, cartridge and module
    /// images from `storage`.
    pub fn assemble(
        config: &MachineConfig,
        storage: &dyn Storage,
        catalog: ModuleCatalog,
    ) -> Result<Self> {
        config.validate()?;
        let mode = config.sync_mode()?;

        let mut bus = BusController::new(config.ram_size)?;
        if let Some(path) = config.rom.as_deref() {
            bus.load_rom(&storage.read_file(path)?)?;
        }
        if let Some(path) = config.cartridge.as_deref() {
            bus.load_cartridge(&storage.read_file(path)?)?;
        }

        let pool = ExternalMemory::new(config.pool_base, config.pool_size);
        let mut machine = Self {
            bus,
            loader: Loader::new(pool, catalog),
            registry: Registry::new(),
            attachments: Vec::new(),
            ipl: Rc::new(Cell::new(0)),
            interrupt_controller: None,
            controller_owner: None,
            mode: Rc::new(Cell::new(mode)),
            sample_rate: config.sample_rate,
            framebuffer: Vec::new(),
            audio: Vec::new(),
            frame_count: 0,
            total_cycles: 0,
        };

        for spec in &config.modules {
            if let Err(err) = machine.load_module(storage, spec) {
                warn!("machine: '{}' failed: {err}", spec.path);
                machine.shutdown();
                return Err(err);
            }
        }

        if machine
            .bus
            .io_handlers()
            .iter()
            .any(|h| h.contains(GLUE_BASE))
        {
            machine.bus.write_u8(GLUE_BASE, mode.register_value());
        }

        machine.reset();
        info!(
            "machine: {} modules, {} KiB RAM, {} Hz, {} I/O handlers",
            machine.registry.len(),
            machine.bus.ram_size() / 1024,
            mode.refresh_hz(),
            machine.bus.io_handlers().len()
        );
        Ok(machine)
    }

    /// Load, attach and register one module.
    ///
    /// On failure every handler the module registered is removed and its
    /// memory is returned to the pool.
    pub fn load_module(
        &mut self,
        storage: &dyn Storage,
        spec: &ModuleSpec,
    ) -> Result<ModuleHandle> {
        if self.registry.in_frame() {
            return Err(Error::invalid_state("cannot load a module during a frame"));
        }
        let mut instance = self.loader.load(storage, &spec.path, spec.kind)?;
        if let Err(err) = self.registry.admits(&instance) {
            self.loader.unload(instance);
            return Err(err);
        }

        let first_handler = self.bus.io_handlers().len();
        let had_controller = self.interrupt_controller.is_some();
        let controller_refs = self.controller_refs();
        let attached = {
            let mut ctx = AttachContext {
                bus: &mut self.bus,
                ipl: Rc::clone(&self.ipl),
                interrupt_controller: self.interrupt_controller.clone(),
                sync_mode: Rc::clone(&self.mode),
            };
            let result = instance.capability_mut().attach(&mut ctx);
            self.interrupt_controller = ctx.interrupt_controller;
            result
        };
        let holds_controller = had_controller && self.controller_refs() > controller_refs;
        let bases: Vec<u32> = self.bus.io_handlers()[first_handler..]
            .iter()
            .map(|h| h.base())
            .collect();

        if let Err(err) = attached {
            self.detach(&bases);
            if !had_controller {
                self.interrupt_controller = None;
            }
            self.loader.unload(instance);
            return Err(err);
        }

        if let Some(audio) = audio_of(instance.capability_mut()) {
            audio.set_sample_rate(self.sample_rate);
        }

        let handle = match self.registry.register(instance) {
            Ok(handle) => handle,
            Err(rejected) => {
                self.detach(&bases);
                if !had_controller {
                    self.interrupt_controller = None;
                }
                self.loader.unload(rejected.instance);
                return Err(rejected.error);
            }
        };
        if !had_controller && self.interrupt_controller.is_some() {
            self.controller_owner = Some(handle);
        }
        debug!("machine: {:?} owns {} handler(s)", handle, bases.len());
        self.attachments.push(Attachment {
            handle,
            bases,
            holds_controller,
        });
        Ok(handle)
    }

    fn controller_refs(&self) -> usize {
        self.interrupt_controller.as_ref().map_or(0, Rc::strong_count)
    }

    /// Detach and unload a module. Illegal while a frame is running, and
    /// for the interrupt controller's owner while other modules are wired
    /// to it.
    pub fn unload_module(&mut self, handle: ModuleHandle) -> Result<()> {
        if self.controller_owner == Some(handle) {
            if let Some(dependent) = self
                .attachments
                .iter()
                .find(|a| a.handle != handle && a.holds_controller)
            {
                return Err(Error::invalid_state(format!(
                    "interrupt controller still wired to {:?}",
                    dependent.handle
                )));
            }
        }
        let instance = self.registry.unregister(handle)?;
        if let Some(idx) = self.attachments.iter().position(|a| a.handle == handle) {
            let attachment = self.attachments.remove(idx);
            self.detach(&attachment.bases);
        }
        if self.controller_owner == Some(handle) {
            self.controller_owner = None;
            self.interrupt_controller = None;
        }
        info!("machine: unloading '{}'", instance.name());
        self.loader.unload(instance);
        Ok(())
    }

    /// Unload every module, most recent first.
    pub fn shutdown(&mut self) {
        for handle in self.registry.handles().into_iter().rev() {
            if let Err(err) = self.unload_module(handle) {
                warn!("machine: {:?} stayed loaded: {err}", handle);
            }
        }
    }

    fn detach(&mut self, bases: &[u32]) {
        for &base in bases {
            if let Err(err) = self.bus.unregister_io(base) {
                warn!("machine: {err}");
            }
        }
    }

    pub fn reset(&mut self) {
        self.bus.reset();
        for instance in self.registry.iter_mut() {
            instance.capability_mut().reset();
        }
        self.ipl.set(0);
        self.frame_count = 0;
    }

    /// Run one video frame worth of cycles, then render and mix.
    ///
    /// Frame timing follows the sync mode in force when the frame starts.
    pub fn run_frame(&mut self) -> FrameReport {
        let mode = self.mode.get();
        self.registry.begin_frame();
        let budget = mode.cycles_per_frame();
        let mut done = 0u32;
        while done < budget {
            let slice = SLICE_CYCLES.min(budget - done);
            let used = self.execute_cpu(slice).max(1);
            self.clock_io(used);
            done += used;
        }
        self.total_cycles += u64::from(done);

        let pixels = self.render_video();
        let samples = self.generate_audio(mode);
        self.registry.end_frame();
        self.frame_count += 1;

        FrameReport {
            cycles: done,
            pixels,
            samples,
        }
    }

    pub fn run_frames(&mut self, frames: u64) {
        for _ in 0..frames {
            self.run_frame();
        }
    }

    fn execute_cpu(&mut self, slice: u32) -> u32 {
        let level = self.ipl.get();
        for instance in self.registry.iter_mut() {
            if let Some(cpu) = cpu_of(instance.capability_mut()) {
                cpu.set_ipl(level);
                return cpu.execute(&mut self.bus, slice);
            }
        }
        slice
    }

    fn clock_io(&mut self, cycles: u32) {
        for instance in self.registry.iter_mut() {
            match instance.capability_mut() {
                Capability::Io(io) => io.clock(cycles),
                Capability::System(system) => {
                    let mut index = 0;
                    while let Some(io) = system.io(index) {
                        io.clock(cycles);
                        index += 1;
                    }
                }
                _ => {}
            }
        }
    }

    fn render_video(&mut self) -> usize {
        for instance in self.registry.iter_mut() {
            if let Some(video) = video_of(instance.capability_mut()) {
                let (width, height) = video.dimensions();
                self.framebuffer.resize(width * height, 0);
                return video.render(&mut self.bus, &mut self.framebuffer);
            }
        }
        0
    }

    fn generate_audio(&mut self, mode: SyncMode) -> usize {
        let frames = (self.sample_rate / mode.refresh_hz()) as usize;
        for instance in self.registry.iter_mut() {
            if let Some(audio) = audio_of(instance.capability_mut()) {
                self.audio.resize(frames * 2, 0);
                return audio.generate(&mut self.audio);
            }
        }
        0
    }

    /// Vector number for an interrupt acknowledge at `level`.
    ///
    /// The MFP supplies its own vector; every other level is autovectored.
    pub fn acknowledge_interrupt(&mut self, level: u8) -> u8 {
        match self.interrupt_controller.as_ref() {
            Some(controller) if level == IPL_MFP => controller.borrow_mut().acknowledge(),
            _ => AUTOVECTOR_BASE + (level & 0x07),
        }
    }

    pub fn bus(&self) -> &BusController {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut BusController {
        &mut self.bus
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    /// Current interrupt priority level presented to the CPU.
    pub fn ipl(&self) -> u8 {
        self.ipl.get()
    }

    pub fn interrupt_controller(&self) -> Option<SharedInterruptController> {
        self.interrupt_controller.clone()
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.mode.get()
    }

    /// Last rendered frame, 0x00RRGGBB.
    pub fn framebuffer(&self) -> &[u32] {
        &self.framebuffer
    }

    /// Last generated audio, interleaved stereo.
    pub fn audio(&self) -> &[i16] {
        &self.audio
    }

    pub fn stats(&self) -> MachineStats {
        MachineStats {
            frame_count: self.frame_count,
            total_cycles: self.total_cycles,
            bus: self.bus.stats(),
            ipl: self.ipl.get(),
            modules: self.registry.len(),
            pool_available: self.loader.pool().available(),
        }
    }
}

fn cpu_of(capability: &mut Capability) -> Option<&mut dyn CpuModule> {
    match capability {
        Capability::Cpu(cpu) => Some(cpu.as_mut()),
        Capability::System(system) => system.cpu(),
        _ => None,
    }
}

fn video_of(capability: &mut Capability) -> Option<&mut dyn VideoModule> {
    match capability {
        Capability::Video(video) => Some(video.as_mut()),
        Capability::System(system) => system.video(),
        _ => None,
    }
}

fn audio_of(capability: &mut Capability) -> Option<&mut dyn AudioModule> {
    match capability {
        Capability::Audio(audio) => Some(audio.as_mut()),
        Capability::System(system) => system.audio(),
        _ => None,
    }
}

/// What one call to [`Machine::run_frame`] produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub cycles: u32,
    pub pixels: usize,
    /// Stereo frames written to the audio buffer.
    pub samples: usize,
}

/// Machine execution statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineStats {
    pub frame_count: u64,
    pub total_cycles: u64,
    pub bus: BusStats,
    pub ipl: u8,
    pub modules: usize,
    pub pool_available: usize,
}
