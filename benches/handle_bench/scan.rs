//! Benchmarks for scanning a table of strong handles.

use super::*;
use gchandles::object_handle::roots;
use gchandles::HandleType;

const NUM_HANDLES: usize = 100_000;

pub fn bench(c: &mut Criterion) {
    let manager = manager();
    let store = manager.global_handle_store().unwrap();
    for i in 0..NUM_HANDLES {
        store
            .create_handle_of_type(object(i), HandleType::Strong)
            .unwrap();
    }

    c.bench_function("scan_strong_full", |b| {
        let mut sc = ScanContext::new();
        b.iter(|| {
            let mut tracer = BenchTracer { promoted: 0 };
            roots::trace_normal_roots::<BenchVM>(manager.map(), 2, 2, &mut sc, &mut tracer);
            assert_eq!(tracer.promoted, NUM_HANDLES);
        })
    });

    // Once aged, the clumps are skipped by an ephemeral scan.
    manager.age_handles(2, 2, &ScanContext::new());
    c.bench_function("scan_strong_ephemeral_aged", |b| {
        let mut sc = ScanContext::new();
        b.iter(|| {
            let mut tracer = BenchTracer { promoted: 0 };
            roots::trace_normal_roots::<BenchVM>(manager.map(), 0, 2, &mut sc, &mut tracer);
            assert_eq!(tracer.promoted, 0);
        })
    });
}
