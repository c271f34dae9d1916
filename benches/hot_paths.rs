use criterion::{black_box, criterion_group, criterion_main, Criterion};
use leakwatch::classify::classify;
use leakwatch::report::{MemCounters, MemKey, Report};
use leakwatch::transport::{decode_line, encode_batch, DecodedLine};

const NOW: i64 = 1_700_000_000;

fn snapshot_entries() -> Vec<(MemKey, MemCounters)> {
    (0..256u32)
        .map(|i| {
            let pid = 4_000 + i;
            let alloc = u64::from(i + 1) * 64 * 1024;
            let freed = if i % 3 == 0 { 0 } else { alloc / 2 };
            (
                MemKey::new(pid, format!("worker-{i}")),
                MemCounters::new(alloc, freed),
            )
        })
        .collect()
}

fn batch() -> Vec<Report> {
    snapshot_entries()
        .iter()
        .map(|(key, counters)| classify(key, counters, "bench-host", NOW))
        .collect()
}

fn bench_classify(c: &mut Criterion) {
    let entries = snapshot_entries();

    c.bench_function("classify/256_entries", |b| {
        b.iter(|| {
            let suspects = entries
                .iter()
                .map(|(key, counters)| classify(black_box(key), black_box(counters), "bench-host", NOW))
                .filter(|r| r.leak_suspect)
                .count();
            black_box(suspects)
        })
    });
}

fn bench_codec(c: &mut Criterion) {
    let reports = batch();
    let line = encode_batch(&reports).expect("encode batch");
    let single = encode_batch(&reports[..1]).expect("encode single");
    let object = serde_json::to_vec(&reports[0]).expect("encode object");

    c.bench_function("codec/encode_256", |b| {
        b.iter(|| encode_batch(black_box(&reports)).expect("encode"))
    });

    c.bench_function("codec/decode_array_256", |b| {
        b.iter(|| match decode_line(black_box(&line[..line.len() - 1])) {
            DecodedLine::Reports(r) => black_box(r.len()),
            DecodedLine::Invalid(e) => panic!("invalid: {e}"),
        })
    });

    c.bench_function("codec/decode_array_1", |b| {
        b.iter(|| decode_line(black_box(&single[..single.len() - 1])))
    });

    c.bench_function("codec/decode_object_fallback", |b| {
        b.iter(|| decode_line(black_box(&object)))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_classify(c);
    bench_codec(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
