//! Complete ST custom chip set packaged as a single system module.

use std::cell::RefCell;
use std::rc::Rc;

use crate::acia::{Acia, AciaModule};
use crate::error::Result;
use crate::glue::{Glue, GlueModule};
use crate::mfp::{Mfp, MfpModule};
use crate::module::{
    AttachContext, AudioModule, CpuModule, INTERFACE_VERSION, IoModule, Module, SystemModule,
    VideoModule,
};
use crate::psg::{Psg, PsgModule};
use crate::shifter::{Shifter, ShifterModule};

pub struct ChipsetModule {
    mfp: MfpModule,
    glue: GlueModule,
    acia: AciaModule,
    psg: PsgModule,
    shifter: ShifterModule,
}

impl ChipsetModule {
    pub const ENTRY: &'static str = "st_chipset_entry";
    pub const NAME: &'static str = "ST chipset";

    pub fn new() -> Self {
        Self {
            mfp: MfpModule::new(),
            glue: GlueModule::new(),
            acia: AciaModule::new(),
            psg: PsgModule::new(),
            shifter: ShifterModule::new(),
        }
    }

    pub fn glue(&self) -> Rc<RefCell<Glue>> {
        self.glue.shared()
    }

    pub fn mfp(&self) -> Rc<RefCell<Mfp>> {
        self.mfp.shared()
    }

    pub fn acia(&self) -> Rc<RefCell<Acia>> {
        self.acia.shared()
    }

    pub fn psg(&self) -> Rc<RefCell<Psg>> {
        self.psg.shared()
    }

    pub fn shifter(&self) -> Rc<RefCell<Shifter>> {
        self.shifter.shared()
    }

    fn parts(&mut self) -> [&mut dyn Module; 5] {
        [
            &mut self.mfp,
            &mut self.glue,
            &mut self.acia,
            &mut self.psg,
            &mut self.shifter,
        ]
    }
}

impl Default for ChipsetModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for ChipsetModule {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn interface_version(&self) -> u32 {
        INTERFACE_VERSION
    }

    fn init(&mut self) -> Result<()> {
        self.parts().into_iter().try_for_each(|m| m.init())
    }

    fn reset(&mut self) {
        self.parts().into_iter().for_each(|m| m.reset());
    }

    fn shutdown(&mut self) {
        self.parts().into_iter().for_each(|m| m.shutdown());
    }

    /// The MFP goes first so the GLUE and ACIA find it as the interrupt controller.
    fn attach(&mut self, ctx: &mut AttachContext<'_>) -> Result<()> {
        self.parts().into_iter().try_for_each(|m| m.attach(ctx))
    }
}

impl SystemModule for ChipsetModule {
    fn cpu(&mut self) -> Option<&mut dyn CpuModule> {
        None
    }

    fn video(&mut self) -> Option<&mut dyn VideoModule> {
        Some(&mut self.shifter)
    }

    fn audio(&mut self) -> Option<&mut dyn AudioModule> {
        Some(&mut self.psg)
    }

    /// GLUE, then MFP, then ACIA: the order they are clocked in.
    fn io(&mut self, index: usize) -> Option<&mut dyn IoModule> {
        match index {
            0 => Some(&mut self.glue),
            1 => Some(&mut self.mfp),
            2 => Some(&mut self.acia),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BusAccess, BusController};
    use crate::glue::IPL_VBL;

    #[test]
    fn attach_wires_every_chip() {
        let mut bus = BusController::new(0x8_0000).unwrap();
        let mut chipset = ChipsetModule::new();
        let ipl = {
            let mut ctx = AttachContext::new(&mut bus);
            chipset.attach(&mut ctx).unwrap();
            assert!(ctx.interrupt_controller.is_some());
            ctx.ipl.clone()
        };
        assert_eq!(bus.io_handlers().len(), 6);

        // palette is reachable through the bus
        bus.write_u16(0xFF_8240, 0x0777);
        assert_eq!(chipset.shifter().borrow().palette()[0], 0x0777);

        let frame = chipset.glue().borrow().mode().cycles_per_frame();
        chipset.io(0).unwrap().clock(frame);
        assert_eq!(ipl.get(), IPL_VBL);
    }

    #[test]
    fn exposes_video_and_audio_but_no_cpu() {
        let mut chipset = ChipsetModule::new();
        assert!(chipset.cpu().is_none());
        assert!(chipset.video().is_some());
        assert_eq!(chipset.audio().map(|a| a.sample_rate()), Some(44_100));
        assert!(chipset.io(3).is_none());
    }
}
