use cask_envelope::{Envelope, EnvelopeBuilder};
use cask_types::EnvelopeId;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn sample(payload_len: usize) -> EnvelopeBuilder {
    let mut builder = EnvelopeBuilder::new(EnvelopeId::from_hash([9; 32]), vec![7u8; payload_len])
        .type_name("post")
        .field("title", "benchmarking envelopes")
        .field("rank", 42i64)
        .field("tags", vec!["rust", "storage", "hashing"]);
    for n in 0..16u8 {
        builder = builder.relate("cites", EnvelopeId::from_hash([n; 32]));
    }
    builder
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for len in [64usize, 4096, 1 << 20] {
        let builder = sample(len);
        group.bench_function(format!("build/{len}"), |b| {
            b.iter(|| black_box(builder.clone().build().unwrap()))
        });
    }
    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let stored = sample(4096).build().unwrap().into_bytes();
    c.bench_function("decode_verify/4096", |b| {
        b.iter(|| black_box(Envelope::decode(stored.clone()).unwrap()))
    });

    let env = Envelope::decode(stored).unwrap();
    c.bench_function("field_lookup", |b| {
        b.iter(|| black_box(env.field("rank").and_then(|v| v.as_int())))
    });
}

criterion_group!(benches, bench_encode, bench_read);
criterion_main!(benches);
