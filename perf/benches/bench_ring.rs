use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use sluice_ipc::{OpenMode, RingConfig};
use sluice_perf::{BenchRing, format_bytes};

const NBUFS: u64 = 4;

/// One full slot through the bare protocol: acquire, fill, read, clear.
fn bench_slot_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring");

    for bufsz in [4096u64, 1 << 20] {
        let bench = BenchRing::new(RingConfig::new(NBUFS, bufsz));
        let mut writer = bench.handle();
        let mut reader = bench.handle();
        writer.lock_write().expect("lock writer");
        reader.lock_read().expect("lock reader");

        group.throughput(Throughput::Bytes(bufsz));
        group.bench_function(format!("slot_cycle/{}", format_bytes(bufsz)), |b| {
            b.iter(|| {
                let index = writer.next_write().unwrap();
                writer.slot_mut(index)[0] = 1;
                writer.mark_filled(bufsz).unwrap();

                let slot = reader.next_read().unwrap().unwrap();
                black_box(reader.slot(slot.index)[0]);
                reader.mark_cleared().unwrap();
            });
        });

        reader.unlock_read().unwrap();
        writer.unlock_write().unwrap();
    }
}

/// The same cycle through the zero-copy block API.
fn bench_block_cycle(c: &mut Criterion) {
    let bufsz = 1 << 16;
    let bench = BenchRing::new(RingConfig::new(NBUFS, bufsz));
    let mut writer = bench.stream(OpenMode::WriteImmediate);
    let mut reader = bench.stream(OpenMode::Read);

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Bytes(bufsz));
    group.bench_function(format!("block_cycle/{}", format_bytes(bufsz)), |b| {
        b.iter(|| {
            let (_, block) = writer.open_block_write().unwrap();
            block[0] = 1;
            writer.close_block_write(bufsz).unwrap();

            let (_, block) = reader.open_block_read().unwrap().unwrap();
            black_box(block[0]);
            reader.close_block_read(bufsz).unwrap();
        });
    });
}

criterion_group!(benches, bench_slot_cycle, bench_block_cycle);
criterion_main!(benches);
