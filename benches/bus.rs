use std::hint::black_box;
use std::time::Duration;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use stbox_core::chipset::ChipsetModule;
use stbox_core::mfp::{MFP_BASE, MFP_END, MfpModule};
use stbox_core::module::{AttachContext, Module};
use stbox_core::{BusAccess, BusController};

fn criterion_config() -> Criterion {
    match std::env::var("STBOX_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(20),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50),
    }
}

const ACCESSES: u64 = 4096;

fn bench_ram(c: &mut Criterion) {
    let mut bus = BusController::new(0x10_0000).unwrap();
    let mut group = c.benchmark_group("ram");
    group.throughput(Throughput::Elements(ACCESSES));
    group.bench_function("write_u16", |b| {
        b.iter(|| {
            for i in 0..ACCESSES as u32 {
                bus.write_u16(black_box(i * 2), i as u16);
            }
        })
    });
    group.bench_function("read_u32", |b| {
        b.iter(|| {
            let mut sum = 0u32;
            for i in 0..ACCESSES as u32 {
                sum = sum.wrapping_add(bus.read_u32(black_box(i * 4)));
            }
            sum
        })
    });
    group.finish();
}

fn bench_io(c: &mut Criterion) {
    let mut bus = BusController::new(0x10_0000).unwrap();
    let mut mfp = MfpModule::new();
    mfp.attach(&mut AttachContext::new(&mut bus)).unwrap();

    let mut group = c.benchmark_group("io");
    group.throughput(Throughput::Elements(ACCESSES));
    group.bench_function("mfp_register_read", |b| {
        b.iter(|| {
            let mut acc = 0u8;
            for i in 0..ACCESSES as u32 {
                let addr = MFP_BASE + ((i * 2 + 1) % (MFP_END - MFP_BASE));
                acc ^= bus.read_u8(black_box(addr));
            }
            acc
        })
    });

    // worst case: full chipset, miss every handler
    let mut crowded = BusController::new(0x10_0000).unwrap();
    let mut chipset = ChipsetModule::new();
    chipset
        .attach(&mut AttachContext::new(&mut crowded))
        .unwrap();
    group.bench_function("unmapped_read", |b| {
        b.iter(|| {
            let mut acc = 0u8;
            for _ in 0..ACCESSES {
                acc ^= crowded.read_u8(black_box(0xFF_9000));
            }
            crowded.take_fault();
            acc
        })
    });
    group.finish();
}

criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_ram, bench_io
}
criterion_main!(benches);
