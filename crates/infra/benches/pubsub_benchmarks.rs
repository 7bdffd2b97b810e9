use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use cms_core::JobId;
use cms_events::{JobPubSub, JobSubscription};
use cms_job::State;

/// Subscribers that drain after every publish, so sends never hit a full buffer.
fn subscribed(bus: &JobPubSub, job: &JobId, n: usize) -> Vec<JobSubscription> {
    (0..n).map(|_| bus.subscribe(job).unwrap()).collect()
}

fn bench_publish_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_fan_out");

    for subscribers in [0usize, 1, 8, 64] {
        group.throughput(Throughput::Elements(subscribers.max(1) as u64));

        for cache in [0usize, 5] {
            let bus = JobPubSub::new(cache);
            let job = JobId::new();
            let subs = subscribed(&bus, &job, subscribers);

            group.bench_with_input(
                BenchmarkId::new(format!("cache_{cache}"), subscribers),
                &subscribers,
                |b, _| {
                    let mut n = 0u64;
                    b.iter(|| {
                        n += 1;
                        bus.publish(&job, black_box(State::in_progress(n, 1_000_000))).unwrap();
                        for sub in &subs {
                            while sub.try_recv().is_ok() {}
                        }
                    })
                },
            );
        }
    }

    group.finish();
}

fn bench_publish_to_stalled_subscribers(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_drop_on_full");

    // Nobody reads: every send after the first buffer-full is a drop.
    let bus = JobPubSub::new(0);
    let job = JobId::new();
    let _stalled = subscribed(&bus, &job, 16);

    group.bench_function("sixteen_full_buffers", |b| {
        b.iter(|| bus.publish(&job, black_box(State::in_progress(1, 2))).unwrap())
    });

    group.finish();
}

fn bench_subscribe_with_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("subscribe_replay");

    for cache in [0usize, 5, 50] {
        let job = JobId::new();
        let seeded = move || {
            let bus = JobPubSub::new(cache);
            for n in 0..cache as u64 {
                bus.publish(&job, State::in_progress(n, cache as u64)).unwrap();
            }
            bus
        };

        group.bench_with_input(BenchmarkId::new("cache", cache), &cache, |b, _| {
            b.iter_batched(
                seeded,
                |bus| {
                    let sub = bus.subscribe(&job).unwrap();
                    (bus, sub)
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_publish_fan_out,
    bench_publish_to_stalled_subscribers,
    bench_subscribe_with_replay
);
criterion_main!(benches);
