use std::io::BufReader;

use criterion::*;
use ember::collapsed;
use ember::ingest::{self, Format};
use ember::mojo::Writer;
use ember::sample::{Frame, Metrics, Record, Sample};
use ember::store::Store;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const SAMPLES: usize = 20_000;

fn frames() -> Vec<Frame> {
    (0..64)
        .map(|i| Frame::new(format!("function_{}", i), format!("module_{}.py", i % 8), i * 3 + 1))
        .collect()
}

// Stacks drawn from a fixed set of frames, shallow towards the root, so that the trees branch
// the way real programs do.
fn stacks(rng: &mut SmallRng, frames: &[Frame]) -> Vec<(u64, Vec<usize>, u64)> {
    (0..SAMPLES)
        .map(|_| {
            let depth = rng.gen_range(1..24);
            let stack = (0..depth)
                .map(|d| rng.gen_range(0..(4 + d * 2).min(frames.len())))
                .collect();
            (rng.gen_range(0..4), stack, rng.gen_range(1..5000))
        })
        .collect()
}

fn collapsed_input() -> Vec<u8> {
    let frames = frames();
    let mut rng = SmallRng::seed_from_u64(1);
    let mut out = Vec::new();
    for (tid, stack, time) in stacks(&mut rng, &frames) {
        let record = Record::Sample(Sample {
            pid: Some(4242),
            tid: tid.to_string(),
            frames: stack.into_iter().map(|i| frames[i].clone()).collect(),
            metrics: Metrics::Single(time as i64),
        });
        collapsed::write_record(&mut out, &record).unwrap();
    }
    out
}

fn mojo_input() -> Vec<u8> {
    let frames = frames();
    let mut rng = SmallRng::seed_from_u64(1);
    let mut writer = Writer::new(Vec::new()).unwrap();
    for (i, frame) in frames.iter().enumerate() {
        writer.frame(i as i64, frame).unwrap();
    }
    for (tid, stack, time) in stacks(&mut rng, &frames) {
        writer.stack(4242, &tid.to_string()).unwrap();
        for i in stack {
            writer.frame_ref(i as i64).unwrap();
        }
        writer.time(time).unwrap();
    }
    writer.into_inner().unwrap()
}

fn decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for (id, format, bytes) in [
        ("collapsed", Format::Collapsed, collapsed_input()),
        ("mojo", Format::Mojo, mojo_input()),
    ] {
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(id), &bytes, |b, data| {
            b.iter(|| {
                let reader = BufReader::new(data.as_slice());
                ingest::records(reader, format, Default::default())
                    .unwrap()
                    .count()
            })
        });
    }
    group.finish();
}

fn aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate");
    let bytes = mojo_input();
    let records: Vec<_> = ingest::records(&bytes[..], Format::Mojo, Default::default())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    group.throughput(Throughput::Elements(records.len() as u64));
    group.bench_function("store", |b| {
        b.iter(|| {
            let store = Store::default();
            for record in &records {
                store.record(record);
            }
            store.samples()
        })
    });
    group.finish();
}

criterion_group!(benches, decode, aggregate);
criterion_main!(benches);
