//! Module loader: validate, place, relocate, resolve.

use log::{debug, info, warn};

use super::capability::Capability;
use super::catalog::ModuleCatalog;
use super::format::{INTERFACE_VERSION, ModuleImage, ModuleType};
use super::pool::ExternalMemory;
use super::relocate::relocate;
use super::storage::Storage;
use crate::error::{Error, Result};

/// A module placed in external memory with its interface resolved.
#[derive(Debug)]
pub struct ModuleInstance {
    name: String,
    source: String,
    module_type: ModuleType,
    load_address: u32,
    memory: Vec<u8>,
    code_size: usize,
    data_size: usize,
    capability: Capability,
}

impl ModuleInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path or label the image was loaded from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn module_type(&self) -> ModuleType {
        self.module_type
    }

    pub fn load_address(&self) -> u32 {
        self.load_address
    }

    pub fn footprint(&self) -> usize {
        self.memory.len()
    }

    pub fn code(&self) -> &[u8] {
        &self.memory[..self.code_size]
    }

    pub fn data(&self) -> &[u8] {
        &self.memory[self.code_size..self.code_size + self.data_size]
    }

    pub fn bss(&self) -> &[u8] {
        &self.memory[self.code_size + self.data_size..]
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn capability_mut(&mut self) -> &mut Capability {
        &mut self.capability
    }
}

pub struct Loader {
    pool: ExternalMemory,
    catalog: ModuleCatalog,
}

impl Loader {
    pub fn new(pool: ExternalMemory, catalog: ModuleCatalog) -> Self {
        Self { pool, catalog }
    }

    pub fn pool(&self) -> &ExternalMemory {
        &self.pool
    }

    pub fn catalog(&self) -> &ModuleCatalog {
        &self.catalog
    }

    /// Read `path` from `storage` and load it as a module of type `expected`.
    pub fn load(
        &mut self,
        storage: &dyn Storage,
        path: &str,
        expected: ModuleType,
    ) -> Result<ModuleInstance> {
        let bytes = storage.read_file(path)?;
        self.load_bytes(&bytes, expected, path)
    }

    /// Load a module from an in-memory image.
    ///
    /// Any failure releases everything acquired so far; a module is only
    /// returned fully relocated and initialised.
    pub fn load_bytes(
        &mut self,
        bytes: &[u8],
        expected: ModuleType,
        source: &str,
    ) -> Result<ModuleInstance> {
        let image = ModuleImage::parse(bytes)?;
        let header = image.header;

        let module_type = ModuleType::from_raw(header.module_type).ok_or_else(|| {
            Error::invalid_argument(format!("{source}: unknown module type {}", header.module_type))
        })?;
        if module_type != expected {
            return Err(Error::invalid_argument(format!(
                "{source}: expected a {expected:?} module, image is {module_type:?}"
            )));
        }
        if header.interface_version != INTERFACE_VERSION {
            return Err(Error::InvalidVersion {
                what: "module interface",
                found: header.interface_version,
                expected: INTERFACE_VERSION,
            });
        }
        if header.min_ram as usize > self.pool.available() {
            return Err(Error::out_of_resources(format!(
                "{source}: needs {} bytes of working memory, {} available",
                header.min_ram,
                self.pool.available()
            )));
        }
        if header.entry_offset >= header.code_size {
            return Err(Error::invalid_argument(format!(
                "{source}: entry offset {:#x} outside {} byte code section",
                header.entry_offset, header.code_size
            )));
        }
        let entry_name = image
            .entry_symbol()
            .map(|s| s.name.clone())
            .ok_or_else(|| Error::not_found(format!("{source}: no symbol at entry offset")))?;
        let entry = *self
            .catalog
            .resolve(&entry_name)
            .ok_or_else(|| Error::not_found(format!("{source}: entry '{entry_name}'")))?;

        let footprint = header.footprint();
        let load_address = self.pool.allocate(footprint)?;
        match Self::place(&image, load_address, || entry.instantiate()) {
            Ok((memory, capability)) => {
                info!(
                    "loaded {:?} '{}' from {} at {:#010x} ({} bytes, {} relocations)",
                    module_type,
                    capability.name(),
                    source,
                    load_address,
                    footprint,
                    image.relocations.len()
                );
                Ok(ModuleInstance {
                    name: capability.name().to_string(),
                    source: source.to_string(),
                    module_type,
                    load_address,
                    memory,
                    code_size: header.code_size as usize,
                    data_size: header.data_size as usize,
                    capability,
                })
            }
            Err(err) => {
                warn!("{source}: load failed: {err}");
                self.pool.release(load_address, footprint);
                Err(err)
            }
        }
    }

    fn place(
        image: &ModuleImage<'_>,
        load_address: u32,
        instantiate: impl FnOnce() -> Capability,
    ) -> Result<(Vec<u8>, Capability)> {
        let header = &image.header;
        let code_size = header.code_size as usize;
        let data_size = header.data_size as usize;

        let mut memory = vec![0u8; header.footprint()];
        memory[..code_size].copy_from_slice(image.code);
        memory[code_size..code_size + data_size].copy_from_slice(image.data);

        let (code, rest) = memory.split_at_mut(code_size);
        let patched = relocate(code, &mut rest[..data_size], &image.relocations, load_address)?;
        debug!("relocated {patched} words against {load_address:#010x}");

        let mut capability = instantiate();
        if capability.module_type().as_raw() != header.module_type {
            return Err(Error::InvalidVersion {
                what: "resolved interface type",
                found: u32::from(capability.module_type().as_raw()),
                expected: u32::from(header.module_type),
            });
        }
        if capability.interface_version() != header.interface_version {
            return Err(Error::InvalidVersion {
                what: "resolved interface",
                found: capability.interface_version(),
                expected: header.interface_version,
            });
        }
        capability.init()?;
        Ok((memory, capability))
    }

    /// Shut a module down and give its memory back to the pool.
    pub fn unload(&mut self, mut instance: ModuleInstance) {
        instance.capability.shutdown();
        self.pool.release(instance.load_address, instance.memory.len());
        debug!("unloaded '{}'", instance.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::catalog::package;
    use crate::module::format::{
        HEADER_SIZE, ModuleHeader, ModuleImageBuilder, RelocationKind, Section,
    };
    use crate::module::storage::MemoryStorage;
    use crate::psg::PsgModule;

    fn loader() -> Loader {
        Loader::new(ExternalMemory::new(0x3F80_0000, 0x1_0000), ModuleCatalog::builtin())
    }

    fn psg_image() -> Vec<u8> {
        let catalog = ModuleCatalog::builtin();
        package(catalog.resolve(PsgModule::ENTRY).unwrap()).unwrap()
    }

    fn patch_header(bytes: &mut [u8], edit: impl FnOnce(&mut ModuleHeader)) {
        let mut header = ModuleHeader::parse(bytes).unwrap();
        edit(&mut header);
        bytes[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    }

    #[test]
    fn valid_image_loads_and_relocates() {
        let mut loader = loader();
        let module = loader
            .load_bytes(&psg_image(), ModuleType::Audio, "psg.stm")
            .unwrap();

        assert_eq!(module.module_type(), ModuleType::Audio);
        assert_eq!(module.capability().interface_version(), INTERFACE_VERSION);
        assert_eq!(module.name(), module.capability().name());
        assert_eq!(module.load_address(), 0x3F80_0000);
        // descriptor pointer now refers to the data section's true address
        let descriptor = u32::from_le_bytes(module.code()[4..8].try_into().unwrap());
        assert_eq!(descriptor, 0x3F80_0000 + 16);
        assert_eq!(module.data(), PsgModule::ENTRY.as_bytes());
        assert!(module.bss().iter().all(|&b| b == 0));
        assert_eq!(module.bss().len(), 64);
    }

    #[test]
    fn load_through_storage() {
        let mut storage = MemoryStorage::new();
        storage.insert("modules/psg.stm", psg_image());
        let mut loader = loader();
        let module = loader
            .load(&storage, "modules/psg.stm", ModuleType::Audio)
            .unwrap();
        assert_eq!(module.source(), "modules/psg.stm");
        assert!(matches!(
            loader.load(&storage, "modules/missing.stm", ModuleType::Audio),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut loader = loader();
        let err = loader
            .load_bytes(&psg_image(), ModuleType::Video, "psg.stm")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(loader.pool().available(), 0x1_0000);
    }

    #[test]
    fn interface_epoch_mismatch_is_rejected() {
        let mut bytes = psg_image();
        patch_header(&mut bytes, |h| h.interface_version = INTERFACE_VERSION + 0x1_0000);
        let err = loader()
            .load_bytes(&bytes, ModuleType::Audio, "psg.stm")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidVersion { .. }));
    }

    #[test]
    fn working_memory_beyond_pool_is_rejected() {
        let mut bytes = psg_image();
        patch_header(&mut bytes, |h| h.min_ram = 0x2_0000);
        let err = loader()
            .load_bytes(&bytes, ModuleType::Audio, "psg.stm")
            .unwrap_err();
        assert!(matches!(err, Error::OutOfResources(_)));
    }

    #[test]
    fn out_of_bounds_relocation_discards_the_module() {
        let bytes = ModuleImageBuilder::new(ModuleType::Audio)
            .code(&[0u8; 16])
            .data(&[0u8; 4])
            .relocation(Section::Code, 0, RelocationKind::Absolute)
            .relocation(Section::Data, 2, RelocationKind::Absolute)
            .entry(PsgModule::ENTRY, 0)
            .build()
            .unwrap();
        let mut loader = loader();
        let err = loader
            .load_bytes(&bytes, ModuleType::Audio, "bad.stm")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        // allocation went back to the pool
        assert_eq!(loader.pool().available(), 0x1_0000);
    }

    #[test]
    fn unknown_entry_symbol_is_not_found() {
        let bytes = ModuleImageBuilder::new(ModuleType::Io)
            .code(&[0u8; 8])
            .entry("no_such_entry", 0)
            .build()
            .unwrap();
        assert!(matches!(
            loader().load_bytes(&bytes, ModuleType::Io, "x.stm"),
            Err(Error::NotFound(_))
        ));

        let bytes = ModuleImageBuilder::new(ModuleType::Io)
            .code(&[0u8; 8])
            .build()
            .unwrap();
        assert!(matches!(
            loader().load_bytes(&bytes, ModuleType::Io, "x.stm"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn entry_outside_code_is_invalid() {
        let bytes = ModuleImageBuilder::new(ModuleType::Audio)
            .code(&[0u8; 8])
            .entry(PsgModule::ENTRY, 8)
            .build()
            .unwrap();
        assert!(matches!(
            loader().load_bytes(&bytes, ModuleType::Audio, "x.stm"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn entry_of_wrong_capability_is_rejected() {
        // image claims Video but its entry builds the PSG
        let bytes = ModuleImageBuilder::new(ModuleType::Video)
            .code(&[0u8; 8])
            .entry(PsgModule::ENTRY, 0)
            .build()
            .unwrap();
        let mut loader = loader();
        assert!(matches!(
            loader.load_bytes(&bytes, ModuleType::Video, "x.stm"),
            Err(Error::InvalidVersion { .. })
        ));
        assert_eq!(loader.pool().available(), 0x1_0000);
    }

    #[test]
    fn unload_returns_memory() {
        let mut loader = loader();
        let module = loader
            .load_bytes(&psg_image(), ModuleType::Audio, "psg.stm")
            .unwrap();
        assert!(loader.pool().available() < 0x1_0000);
        loader.unload(module);
        assert_eq!(loader.pool().available(), 0x1_0000);
    }
}
