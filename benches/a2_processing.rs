//! Benchmarks for the per-word and per-event hot paths
//!
//! Run with: cargo bench

use a2_engine::data_filter::{filter, DataFilter, ListFilter, ListFilterFlags, MultiWordFilter};
use a2_engine::operators::{AggregateOp, HistoFillStrategy};
use a2_engine::{A2Builder, Arena, DataSource, DataSourceOptions, Operator, Thresholds, A2};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn random_words(n: usize) -> Vec<u32> {
    let mut rng = SmallRng::seed_from_u64(1);
    (0..n).map(|_| rng.gen::<u32>() & 0x00ff_ffff).collect()
}

fn bench_filter_extract(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_extract");
    let words = random_words(4096);

    for pattern in ["XXXX XXXX AAAA AXXX DDDD DDDD DDDD DDDD", "XXXX XXXX AXAX AXAX DXDX DXDX DXDX DXDX"] {
        let f = DataFilter::parse(pattern).unwrap();
        let cache = f.cache_entry('d');
        group.throughput(Throughput::Elements(words.len() as u64));
        group.bench_with_input(BenchmarkId::new("extract", pattern), &words, |b, words| {
            b.iter(|| {
                let mut acc = 0u32;
                for &w in words {
                    if f.matches(w, -1) {
                        acc = acc.wrapping_add(filter::extract(&cache, w));
                    }
                }
                black_box(acc)
            });
        });
    }

    group.finish();
}

fn bench_listfilter_combine(c: &mut Criterion) {
    let mut group = c.benchmark_group("listfilter_combine");
    let words = random_words(4096);

    for (flags, count) in [
        (ListFilterFlags::empty(), 2u8),
        (ListFilterFlags::empty(), 4),
        (ListFilterFlags::WORD_SIZE_32, 2),
        (ListFilterFlags::REVERSE_COMBINE, 4),
    ] {
        let mut lf = ListFilter::new(flags, count, &["DDDD DDDD DDDD DDDD XXXX XXXX AAAA AAAA"]).unwrap();
        let id = format!("{:?}/{}", flags, count);
        group.throughput(Throughput::Elements((words.len() / count as usize) as u64));
        group.bench_with_input(BenchmarkId::new("combine_extract", id), &words, |b, words| {
            b.iter(|| {
                let mut acc = 0u64;
                for chunk in words.chunks_exact(count as usize) {
                    let combined = lf.combine(chunk);
                    acc ^= lf.extract_address_and_value_from_combined(combined).value;
                }
                black_box(acc)
            });
        });
    }

    group.finish();
}

fn bench_extractor(c: &mut Criterion) {
    let mut group = c.benchmark_group("extractor");

    for n in [16usize, 64, 256] {
        let mut arena = Arena::new(1 << 20);
        let filter = MultiWordFilter::parse(&["0000 0000 XXXX AAAA XXXX DDDD DDDD DDDD"]).unwrap();
        let mut src =
            DataSource::extractor(&mut arena, filter, 1, 3, 0, DataSourceOptions::empty()).unwrap();
        let words = random_words(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("module_data", n), &words, |b, words| {
            b.iter(|| {
                src.begin_event(&arena);
                black_box(src.process_module_data(&arena, words))
            });
        });
    }

    group.finish();
}

fn bench_operator_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("operator_step");

    for op in [AggregateOp::Sum, AggregateOp::Mean, AggregateOp::SigmaX] {
        let mut b = A2Builder::new(1 << 20, HistoFillStrategy::Direct);
        let input = a2_engine::PipeVectors::push(b.arena_mut(), 256, 0.0, 4096.0).unwrap();
        let values: Vec<f64> = random_words(256).iter().map(|&w| (w & 0xfff) as f64).collect();
        b.arena().copy_from(input.data, &values);
        let agg = Operator::aggregate(b.arena_mut(), input, op, Thresholds::unbounded()).unwrap();
        b.add_operator(0, agg).unwrap();
        let mut a2 = b.build();
        a2.begin_run();

        group.bench_function(BenchmarkId::new("aggregate", op.name()), |bench| {
            bench.iter(|| a2.end_event(black_box(0)));
        });
    }

    group.finish();
}

fn full_event_a2(strategy: HistoFillStrategy) -> A2 {
    let mut b = A2Builder::new(4 << 20, strategy);
    let filter = MultiWordFilter::parse(&["0000 0000 XXXX AAAA XXXX DDDD DDDD DDDD"]).unwrap();
    let src = DataSource::extractor(b.arena_mut(), filter, 1, 9, 0, DataSourceOptions::empty()).unwrap();
    let raw = src.outputs[0];
    b.add_source(0, src).unwrap();

    let cal = Operator::calibration(b.arena_mut(), raw, 0.0, 100.0).unwrap();
    let cal_out = cal.outputs[0];
    b.add_operator(0, cal).unwrap();
    let sum = Operator::aggregate(b.arena_mut(), cal_out, AggregateOp::Sum, Thresholds::unbounded()).unwrap();
    let sum_out = sum.outputs[0];
    b.add_operator(0, sum).unwrap();
    let h = Operator::h1d_sink(b.arena_mut(), cal_out, 1024, None).unwrap();
    b.add_operator(0, h).unwrap();
    let hs = Operator::h1d_sink(b.arena_mut(), sum_out, 4096, None).unwrap();
    b.add_operator(0, hs).unwrap();
    b.build()
}

fn bench_full_event(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_event");
    let words = random_words(16);

    for strategy in [HistoFillStrategy::Direct, HistoFillStrategy::Batched] {
        let mut a2 = full_event_a2(strategy);
        a2.begin_run();
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("event", format!("{:?}", strategy)),
            &words,
            |b, words| {
                b.iter(|| {
                    a2.begin_event(0);
                    a2.process_module_data(0, 0, black_box(words));
                    a2.end_event(0);
                });
            },
        );
        a2.end_run();
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_filter_extract,
    bench_listfilter_combine,
    bench_extractor,
    bench_operator_step,
    bench_full_event,
);

criterion_main!(benches);
