//! Transaction Benchmarks
//!
//! | Benchmark | What it measures |
//! |-----------|------------------|
//! | tx/empty_commit | stage machine entry and exit |
//! | tx/alloc_commit | transactional allocation plus deferred free |
//! | tx/alloc_abort | rollback of one allocation |
//! | tx/snapshot_commit | undo-log range capture and persist |
//! | tx/locked_commit | lock registration and release |
//! | atomic/* | the non-transactional allocation path |
//!
//! ## Running
//!
//! ```bash
//! cargo bench --bench transactions
//! ```

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use pmkit::prelude::*;
use pmkit::txn::{run, run_locked};

const POOL_SIZE: usize = 16 << 20;

fn tx_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("tx");
    group.throughput(Throughput::Elements(1));

    let pool = Pool::anonymous(POOL_SIZE).unwrap();
    let handle = pool.handle();

    group.bench_function("empty_commit", |b| {
        b.iter(|| run(&handle, |_| Ok(())).unwrap())
    });

    group.bench_function("alloc_commit", |b| {
        b.iter(|| {
            let ptr = run(&handle, |_| make_persistent(&handle, black_box([0u64; 8]))).unwrap();
            run(&handle, |_| delete_persistent(&handle, ptr.as_ptr())).unwrap();
        })
    });

    group.bench_function("alloc_abort", |b| {
        b.iter(|| {
            let mut tx = Transaction::begin(&handle).unwrap();
            black_box(make_persistent(&handle, [0u64; 8]).unwrap());
            tx.abort("bench");
            black_box(tx.commit().unwrap_err());
        })
    });

    let cell = run(&handle, |_| make_persistent(&handle, [0u64; 8])).unwrap();
    group.bench_function("snapshot_commit", |b| {
        b.iter(|| {
            run(&handle, |tx| {
                tx.snapshot(cell.as_ptr())?;
                // SAFETY: live block, only touched by this benchmark
                unsafe { (*cell.as_ptr())[0] += 1 };
                Ok(())
            })
            .unwrap()
        })
    });

    let lock = run(&handle, |_| {
        make_persistent_in_place(&handle, AllocFlags::NONE, |slot| PMutex::init(slot).map(drop))
    })
    .unwrap();
    // SAFETY: committed and never freed while the pool lives
    let lock: &'static PMutex = unsafe { &*lock.as_ptr() };
    group.bench_function("locked_commit", |b| {
        b.iter(|| run_locked(&handle, &[lock], |_| Ok(())).unwrap())
    });

    group.finish();
}

fn atomic_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("atomic");
    group.throughput(Throughput::Elements(1));

    let pool = Pool::anonymous(POOL_SIZE).unwrap();
    let handle = pool.handle();
    let slot = make_persistent_atomic(&handle, AllocFlags::NONE, || {
        Ok(RelPtr::<[u64; 8]>::null())
    })
    .unwrap();
    // SAFETY: live block owned by this benchmark
    let slot = unsafe { &mut *slot.as_ptr() };

    group.bench_function("alloc_free", |b| {
        b.iter(|| {
            let ptr =
                make_persistent_atomic(&handle, AllocFlags::NONE, || Ok([1u64; 8])).unwrap();
            slot.set(ptr.as_ptr());
            delete_persistent_atomic(&handle, slot).unwrap();
        })
    });

    group.finish();
}

criterion_group!(benches, tx_benchmarks, atomic_benchmarks);
criterion_main!(benches);
