//! Table of loaded modules.

use log::debug;

use super::format::ModuleType;
use super::loader::ModuleInstance;
use crate::error::{Error, Result};

pub const MAX_MODULES: usize = 16;

/// Opaque registry handle. [`ModuleHandle::NULL`] never names a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(u32);

impl ModuleHandle {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Snapshot of a registered module's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub handle: ModuleHandle,
    pub name: String,
    pub module_type: ModuleType,
    pub interface_version: u32,
    pub load_address: u32,
    pub footprint: usize,
    pub source: String,
}

/// A module [`Registry::register`] turned away, handed back for unloading.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct Rejected {
    pub error: Error,
    pub instance: ModuleInstance,
}

impl From<Rejected> for Error {
    fn from(rejected: Rejected) -> Self {
        rejected.error
    }
}

#[derive(Debug)]
struct Slot {
    handle: ModuleHandle,
    instance: ModuleInstance,
}

#[derive(Debug, Default)]
pub struct Registry {
    slots: Vec<Slot>,
    next_id: u32,
    in_frame: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn register(
        &mut self,
        instance: ModuleInstance,
    ) -> std::result::Result<ModuleHandle, Rejected> {
        if let Err(error) = self.admits(&instance) {
            return Err(Rejected { error, instance });
        }
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let handle = ModuleHandle(self.next_id);
        debug!("registry: '{}' -> {:?}", instance.name(), handle);
        self.slots.push(Slot { handle, instance });
        Ok(handle)
    }

    /// Check whether `instance` would be accepted by [`Self::register`].
    pub fn admits(&self, instance: &ModuleInstance) -> Result<()> {
        if instance.name().is_empty() {
            return Err(Error::invalid_argument("module has no name"));
        }
        if instance.capability().module_type() != instance.module_type() {
            return Err(Error::invalid_argument(format!(
                "'{}' registered as {:?} but implements {:?}",
                instance.name(),
                instance.module_type(),
                instance.capability().module_type()
            )));
        }
        if self.slots.len() >= MAX_MODULES {
            return Err(Error::invalid_argument(format!(
                "registry full ({MAX_MODULES} modules)"
            )));
        }
        Ok(())
    }

    /// Remove a module and hand it back to the caller for unloading.
    pub fn unregister(&mut self, handle: ModuleHandle) -> Result<ModuleInstance> {
        if self.in_frame {
            return Err(Error::invalid_state("cannot unregister during a frame"));
        }
        let idx = self
            .slots
            .iter()
            .position(|s| s.handle == handle)
            .ok_or_else(|| Error::not_found(format!("{handle:?}")))?;
        Ok(self.slots.remove(idx).instance)
    }

    /// Up to `max` entries in registration order, plus the total count.
    pub fn list(&self, max: usize) -> (Vec<ModuleInfo>, usize) {
        let infos = self
            .slots
            .iter()
            .take(max)
            .map(Self::info)
            .collect();
        (infos, self.slots.len())
    }

    pub fn get_info(&self, handle: ModuleHandle) -> Result<ModuleInfo> {
        if handle.is_null() {
            return Err(Error::invalid_argument("null module handle"));
        }
        self.slot(handle)
            .map(Self::info)
            .ok_or_else(|| Error::not_found(format!("{handle:?}")))
    }

    pub fn get(&self, handle: ModuleHandle) -> Option<&ModuleInstance> {
        self.slot(handle).map(|s| &s.instance)
    }

    pub fn get_mut(&mut self, handle: ModuleHandle) -> Option<&mut ModuleInstance> {
        self.slots
            .iter_mut()
            .find(|s| s.handle == handle)
            .map(|s| &mut s.instance)
    }

    pub fn find(&self, name: &str) -> Option<ModuleHandle> {
        self.slots
            .iter()
            .find(|s| s.instance.name() == name)
            .map(|s| s.handle)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ModuleInstance> {
        self.slots.iter_mut().map(|s| &mut s.instance)
    }

    pub fn handles(&self) -> Vec<ModuleHandle> {
        self.slots.iter().map(|s| s.handle).collect()
    }

    pub fn begin_frame(&mut self) {
        self.in_frame = true;
    }

    pub fn end_frame(&mut self) {
        self.in_frame = false;
    }

    pub fn in_frame(&self) -> bool {
        self.in_frame
    }

    fn slot(&self, handle: ModuleHandle) -> Option<&Slot> {
        self.slots.iter().find(|s| s.handle == handle)
    }

    fn info(slot: &Slot) -> ModuleInfo {
        let instance = &slot.instance;
        ModuleInfo {
            handle: slot.handle,
            name: instance.name().to_string(),
            module_type: instance.module_type(),
            interface_version: instance.capability().interface_version(),
            load_address: instance.load_address(),
            footprint: instance.footprint(),
            source: instance.source().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::catalog::{ModuleCatalog, package};
    use crate::module::loader::Loader;
    use crate::module::pool::ExternalMemory;

    fn load(loader: &mut Loader, symbol: &str) -> ModuleInstance {
        let entry = *loader.catalog().resolve(symbol).unwrap();
        let bytes = package(&entry).unwrap();
        loader
            .load_bytes(&bytes, entry.module_type, symbol)
            .unwrap()
    }

    fn loader() -> Loader {
        Loader::new(ExternalMemory::default(), ModuleCatalog::builtin())
    }

    #[test]
    fn register_list_and_info() {
        let mut loader = loader();
        let mut registry = Registry::new();
        let mfp = registry.register(load(&mut loader, "mfp_entry")).unwrap();
        let psg = registry.register(load(&mut loader, "psg_entry")).unwrap();
        assert_ne!(mfp, psg);
        assert!(!mfp.is_null());

        let (infos, total) = registry.list(1);
        assert_eq!(total, 2);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].handle, mfp);

        let info = registry.get_info(psg).unwrap();
        assert_eq!(info.module_type, ModuleType::Audio);
        assert_eq!(info.source, "psg_entry");
        assert_eq!(registry.find(&info.name), Some(psg));
    }

    #[test]
    fn null_and_unknown_handles() {
        let registry = Registry::new();
        assert!(matches!(
            registry.get_info(ModuleHandle::NULL),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.get_info(ModuleHandle(42)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn unregister_unknown_is_not_found() {
        let mut registry = Registry::new();
        assert!(matches!(
            registry.unregister(ModuleHandle(7)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn unregister_mid_frame_is_rejected() {
        let mut loader = loader();
        let mut registry = Registry::new();
        let handle = registry.register(load(&mut loader, "glue_entry")).unwrap();
        registry.begin_frame();
        assert!(matches!(
            registry.unregister(handle),
            Err(Error::InvalidState(_))
        ));
        registry.end_frame();
        let instance = registry.unregister(handle).unwrap();
        loader.unload(instance);
        assert!(registry.is_empty());
    }

    #[test]
    fn table_capacity_is_fixed() {
        let mut loader = loader();
        let mut registry = Registry::new();
        for _ in 0..MAX_MODULES {
            registry.register(load(&mut loader, "acia_entry")).unwrap();
        }
        let available = loader.pool().available();
        let extra = load(&mut loader, "acia_entry");
        assert!(loader.pool().available() < available);

        let rejected = registry.register(extra).unwrap_err();
        assert!(matches!(rejected.error, Error::InvalidArgument(_)));
        assert_eq!(registry.len(), MAX_MODULES);

        // the instance comes back so its memory can be returned
        loader.unload(rejected.instance);
        assert_eq!(loader.pool().available(), available);
    }
}
