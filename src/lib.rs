// Copyright (C) 2025 Dayton Fishell
// STBox Machine Emulator Core
// This file is part of STBox.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

//! STBox Machine Emulator Core
//!
//! This library provides the runtime for an Atari ST class machine built out
//! of loadable modules: the module file format and loader, the 24-bit bus
//! controller, and the GLUE, MFP, PSG, ACIA and Shifter peripherals.

pub mod acia;
pub mod chipset;
pub mod config;
pub mod core;
pub mod error;
pub mod glue;
pub mod machine;
pub mod mfp;
pub mod module;
pub mod psg;
pub mod shifter;

// Re-export commonly used types
pub use config::{MachineConfig, ModuleSpec};
pub use core::{BusAccess, BusController, BusFault, BusStats, IoDevice, IoHandler};
pub use error::{Error, Result};
pub use machine::{FrameReport, Machine, MachineStats};
pub use module::{
    Capability, Loader, MemoryStorage, ModuleCatalog, ModuleHandle, ModuleType, Registry, Storage,
};
