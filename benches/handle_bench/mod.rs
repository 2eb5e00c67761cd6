pub mod alloc;
pub mod scan;

pub use criterion::Criterion;
use gchandles::util::options::Options;
use gchandles::util::{Address, ObjectReference};
use gchandles::vm::*;
use gchandles::GCHandleManager;

/// A runtime whose objects all live in generation 0.
pub struct BenchVM;

impl VMBinding for BenchVM {
    type VMObjectModel = BenchVM;
    type VMInterop = BenchVM;
}

impl ObjectModel<BenchVM> for BenchVM {
    fn generation_of(_object: ObjectReference) -> u8 {
        0
    }
}

impl Interop<BenchVM> for BenchVM {}

pub fn manager() -> GCHandleManager<BenchVM> {
    GCHandleManager::new(Options::default()).unwrap()
}

pub fn object(id: usize) -> Option<ObjectReference> {
    ObjectReference::from_raw_address(unsafe { Address::from_usize((id + 1) << 4) })
}

/// Promotes everything in place.
pub struct BenchTracer {
    pub promoted: usize,
}

impl HandleTracer for BenchTracer {
    fn promote(
        &mut self,
        object: ObjectReference,
        _context: &mut ScanContext,
        _flags: PromoteFlags,
    ) -> ObjectReference {
        self.promoted += 1;
        object
    }

    fn is_promoted(&self, _object: ObjectReference) -> bool {
        true
    }
}

pub fn bench(c: &mut Criterion) {
    alloc::bench(c);
    scan::bench(c);
}
