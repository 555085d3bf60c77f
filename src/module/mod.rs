//! Dynamic component runtime: image format, relocation, loading and the
//! registry of loaded modules.

pub mod capability;
pub mod catalog;
pub mod format;
pub mod loader;
pub mod pool;
pub mod registry;
pub mod relocate;
pub mod storage;

pub use capability::{
    AttachContext, AudioModule, Capability, CpuModule, InterruptController, IoModule, Module,
    SharedInterruptController, SystemModule, VideoModule,
};
pub use catalog::{CatalogEntry, ModuleCatalog, ModuleFactory, package};
pub use format::{
    INTERFACE_VERSION, ModuleFlags, ModuleHeader, ModuleImage, ModuleImageBuilder, ModuleType,
    Relocation, RelocationKind, Section, Symbol,
};
pub use loader::{Loader, ModuleInstance};
pub use pool::ExternalMemory;
pub use registry::{MAX_MODULES, ModuleHandle, ModuleInfo, Registry, Rejected};
pub use relocate::relocate;
pub use storage::{DirStorage, MemoryStorage, Storage};
