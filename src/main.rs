// Copyright (C) 2025 Dayton Fishell
// STBox Machine Emulator Core
// This file is part of STBox.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version. See the LICENSE file in the project root for details.
// SPDX-License-Identifier: GPL-3.0-or-later

// A small demo driver for the STBox machine core.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use stbox_core::chipset::ChipsetModule;
use stbox_core::machine::CPU_CLOCK_HZ;
use stbox_core::module::{MAX_MODULES, package};
use stbox_core::{
    Machine, MachineConfig, MemoryStorage, ModuleCatalog, ModuleSpec, ModuleType, Storage,
};

#[derive(Parser, Debug)]
#[command(name = "stbox", about = "Assemble an STBox machine from modules and run it.")]
struct Args {
    /// Machine config (YAML or JSON); the bundled chipset runs when omitted
    config: Option<PathBuf>,

    /// Write every built-in module image into this directory first
    #[arg(long, value_name = "DIR")]
    emit_modules: Option<PathBuf>,

    /// Number of frames to run
    #[arg(long, value_name = "N", default_value_t = 50)]
    frames: u64,
}

fn image_name(symbol: &str) -> String {
    format!("{symbol}.stm")
}

/// Write every catalog entry as a module image into `dir`.
fn emit_modules(catalog: &ModuleCatalog, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    for entry in catalog.entries() {
        let path = dir.join(image_name(entry.symbol));
        let bytes = package(entry).with_context(|| format!("packaging {}", entry.symbol))?;
        fs::write(&path, &bytes).with_context(|| format!("writing {}", path.display()))?;
        println!("  wrote {} ({} bytes)", path.display(), bytes.len());
    }
    Ok(())
}

/// Default machine: the bundled chipset, served from memory.
fn builtin_setup(catalog: &ModuleCatalog) -> Result<(MachineConfig, Box<dyn Storage>)> {
    let entry = catalog
        .resolve(ChipsetModule::ENTRY)
        .context("chipset missing from the catalog")?;
    let path = image_name(entry.symbol);
    let mut storage = MemoryStorage::new();
    storage.insert(path.clone(), package(entry)?);
    let config = MachineConfig {
        modules: vec![ModuleSpec::new(path, ModuleType::System)],
        ..MachineConfig::default()
    };
    Ok((config, Box::new(storage)))
}

#[cfg(feature = "serde-config")]
fn load_config(path: &Path) -> Result<(MachineConfig, Box<dyn Storage>)> {
    let config = MachineConfig::from_path(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let root = path.parent().unwrap_or_else(|| Path::new("."));
    Ok((config, Box::new(stbox_core::module::DirStorage::new(root))))
}

#[cfg(not(feature = "serde-config"))]
fn load_config(path: &Path) -> Result<(MachineConfig, Box<dyn Storage>)> {
    anyhow::bail!(
        "{}: config files need the serde-config feature",
        path.display()
    )
}

fn main() -> Result<()> {
    env_logger::init();

    println!("STBox Machine Core v0.1.0");
    println!("=========================");
    println!();

    let options = Args::parse();
    let catalog = ModuleCatalog::builtin();

    if let Some(dir) = options.emit_modules.as_deref() {
        println!("Emitting module images...");
        emit_modules(&catalog, dir)?;
        println!();
    }

    let (config, storage) = match options.config.as_deref() {
        Some(path) => load_config(path)?,
        None => builtin_setup(&catalog)?,
    };

    let mut machine =
        Machine::assemble(&config, storage.as_ref(), catalog).context("assembling machine")?;

    let (modules, total) = machine.registry().list(MAX_MODULES);
    println!("Loaded {total} module(s):");
    for info in &modules {
        println!(
            "  {:<14} {:?} @ 0x{:08X} ({} bytes)",
            info.name, info.module_type, info.load_address, info.footprint
        );
    }
    println!();

    println!("Running {} frame(s)...", options.frames);
    let mut last = None;
    for _ in 0..options.frames {
        last = Some(machine.run_frame());
    }
    println!();

    let stats = machine.stats();
    let seconds = stats.total_cycles as f64 / f64::from(CPU_CLOCK_HZ);
    println!("Final state:");
    println!("  Frames:       {}", stats.frame_count);
    println!("  Cycles:       {} ({seconds:.3} s emulated)", stats.total_cycles);
    println!("  IPL:          {}", stats.ipl);
    println!("  Bus reads:    {}", stats.bus.reads);
    println!("  Bus writes:   {}", stats.bus.writes);
    println!("  Bus faults:   {}", stats.bus.faults);
    println!("  Pool free:    {} bytes", stats.pool_available);
    if let Some(report) = last {
        println!("  Pixels:       {}", report.pixels);
        println!("  Audio frames: {}", report.samples);
    }

    machine.shutdown();
    Ok(())
}
