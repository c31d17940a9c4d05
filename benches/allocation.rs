use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tenure::header::tag_pointer;
use tenure::{collect, HeapObject, OldSpace};

pub fn bench_old_space(c: &mut Criterion) {
    let mut group = c.benchmark_group("old space");
    group.sample_size(50);

    for count in [1_000usize, 10_000, 100_000] {
        group.bench_function(BenchmarkId::new("bump", count), |b| {
            b.iter_batched_ref(
                || {
                    let mut space = OldSpace::new();
                    space.set_allocation_budget(64 * 1024 * 1024);
                    space
                },
                |space| {
                    for _ in 0..count {
                        let address = space.allocate(64);
                        assert!(address != 0);
                        HeapObject::format_boxed(address, 64);
                    }
                },
                criterion::BatchSize::LargeInput,
            );
        });

        group.bench_function(BenchmarkId::new("alloc+collect", count), |b| {
            b.iter_batched_ref(
                || {
                    let mut space = OldSpace::new();
                    space.set_allocation_budget(64 * 1024 * 1024);
                    space
                },
                |space| {
                    let mut roots = vec![];
                    for i in 0..count {
                        let address = space.allocate(64);
                        assert!(address != 0);
                        let object = HeapObject::format_boxed(address, 64);
                        if i % 4 == 0 {
                            roots.push(tag_pointer(object.address()));
                        }
                    }
                    collect(space, &mut roots);
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_old_space);
criterion_main!(benches);
