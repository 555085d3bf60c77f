//! Entry-point catalog.
//!
//! Module images name their entry through the symbol table; the catalog maps
//! that name onto a constructor linked into this build.

use super::capability::Capability;
use super::format::{ModuleImageBuilder, ModuleType, RelocationKind, Section};
use crate::acia::AciaModule;
use crate::chipset::ChipsetModule;
use crate::error::{Error, Result};
use crate::glue::GlueModule;
use crate::mfp::MfpModule;
use crate::psg::PsgModule;
use crate::shifter::ShifterModule;

pub type ModuleFactory = fn() -> Capability;

#[derive(Clone, Copy)]
pub struct CatalogEntry {
    pub symbol: &'static str,
    pub module_type: ModuleType,
    factory: ModuleFactory,
}

impl CatalogEntry {
    pub fn instantiate(&self) -> Capability {
        (self.factory)()
    }
}

impl std::fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("symbol", &self.symbol)
            .field("module_type", &self.module_type)
            .finish()
    }
}

#[derive(Debug, Default, Clone)]
pub struct ModuleCatalog {
    entries: Vec<CatalogEntry>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every peripheral shipped in this crate.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        let builtin: [(&'static str, ModuleType, ModuleFactory); 6] = [
            (GlueModule::ENTRY, ModuleType::Io, || {
                Capability::Io(Box::new(GlueModule::new()))
            }),
            (MfpModule::ENTRY, ModuleType::Io, || {
                Capability::Io(Box::new(MfpModule::new()))
            }),
            (AciaModule::ENTRY, ModuleType::Io, || {
                Capability::Io(Box::new(AciaModule::new()))
            }),
            (PsgModule::ENTRY, ModuleType::Audio, || {
                Capability::Audio(Box::new(PsgModule::new()))
            }),
            (ShifterModule::ENTRY, ModuleType::Video, || {
                Capability::Video(Box::new(ShifterModule::new()))
            }),
            (ChipsetModule::ENTRY, ModuleType::System, || {
                Capability::System(Box::new(ChipsetModule::new()))
            }),
        ];
        for (symbol, module_type, factory) in builtin {
            catalog.entries.push(CatalogEntry {
                symbol,
                module_type,
                factory,
            });
        }
        catalog
    }

    pub fn register(
        &mut self,
        symbol: &'static str,
        module_type: ModuleType,
        factory: ModuleFactory,
    ) -> Result<()> {
        if symbol.is_empty() {
            return Err(Error::invalid_argument("empty entry symbol"));
        }
        if self.resolve(symbol).is_some() {
            return Err(Error::invalid_argument(format!(
                "entry '{symbol}' is already in the catalog"
            )));
        }
        self.entries.push(CatalogEntry {
            symbol,
            module_type,
            factory,
        });
        Ok(())
    }

    pub fn resolve(&self, symbol: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.symbol == symbol)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }
}

/// Package a catalog entry as a loadable module image.
///
/// The code section is a small descriptor stub: a pointer to the module's
/// name string in the data section, fixed up at load time.
pub fn package(entry: &CatalogEntry) -> Result<Vec<u8>> {
    let mut code = vec![0u8; 16];
    // descriptor word at +4 points at data+0, authored against base 0
    code[4..8].copy_from_slice(&16u32.to_le_bytes());
    code[8..12].copy_from_slice(&(entry.symbol.len() as u32).to_le_bytes());
    ModuleImageBuilder::new(entry.module_type)
        .code(&code)
        .data(entry.symbol.as_bytes())
        .bss(64)
        .min_ram(256)
        .relocation(Section::Code, 4, RelocationKind::Absolute)
        .entry(entry.symbol, 0)
        .build()
}
