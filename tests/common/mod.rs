//! A small runtime and collector for the integration tests.
//!
//! Objects are not real memory. A reference encodes an object id and the
//! generation the object lives in; relocation moves an object into the next
//! generation by handing out a new reference with the same id.

#![allow(dead_code)]

use gchandles::util::options::Options;
use gchandles::util::{Address, ObjectReference};
use gchandles::vm::*;
use gchandles::GCHandleManager;
use std::collections::{HashMap, HashSet};

pub const MAX_GEN: u8 = 2;

const ID_SHIFT: usize = 8;
const GEN_SHIFT: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TestObject {
    pub id: usize,
    pub generation: u8,
}

impl TestObject {
    pub fn new(id: usize, generation: u8) -> Self {
        assert!(id > 0 && generation <= MAX_GEN);
        TestObject { id, generation }
    }

    pub fn to_ref(self) -> ObjectReference {
        let raw = (self.id << ID_SHIFT) | ((self.generation as usize) << GEN_SHIFT);
        ObjectReference::from_raw_address(unsafe { Address::from_usize(raw) }).unwrap()
    }

    pub fn from_ref(object: ObjectReference) -> Self {
        let raw = object.to_raw_address().as_usize();
        TestObject {
            id: raw >> ID_SHIFT,
            generation: ((raw >> GEN_SHIFT) & 0xF) as u8,
        }
    }

    pub fn moved(self) -> Self {
        TestObject {
            generation: (self.generation + 1).min(MAX_GEN),
            ..self
        }
    }
}

pub fn obj(id: usize, generation: u8) -> Option<ObjectReference> {
    Some(TestObject::new(id, generation).to_ref())
}

pub struct TestVM;

impl VMBinding for TestVM {
    type VMObjectModel = TestVM;
    type VMInterop = TestVM;
}

impl ObjectModel<TestVM> for TestVM {
    fn generation_of(object: ObjectReference) -> u8 {
        TestObject::from_ref(object).generation
    }
}

impl Interop<TestVM> for TestVM {}

pub fn manager() -> GCHandleManager<TestVM> {
    GCHandleManager::new(Options::default()).unwrap()
}

/// A collector of generations `0..=condemned`. Marking an object also marks
/// everything reachable from it through `edges`, as draining a mark stack
/// would.
pub struct TestCollector {
    pub condemned: u8,
    pub marked: HashSet<usize>,
    pub pinned: HashSet<usize>,
    pub edges: HashMap<usize, Vec<usize>>,
}

impl TestCollector {
    pub fn new(condemned: u8) -> Self {
        TestCollector {
            condemned,
            marked: HashSet::new(),
            pinned: HashSet::new(),
            edges: HashMap::new(),
        }
    }

    pub fn is_marked(&self, object: TestObject) -> bool {
        self.marked.contains(&object.id)
    }

    fn mark(&mut self, id: usize) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if self.marked.insert(id) {
                if let Some(children) = self.edges.get(&id) {
                    stack.extend(children.iter().copied());
                }
            }
        }
    }
}

impl HandleTracer for TestCollector {
    fn promote(
        &mut self,
        object: ObjectReference,
        context: &mut ScanContext,
        flags: PromoteFlags,
    ) -> ObjectReference {
        let o = TestObject::from_ref(object);
        if o.generation > self.condemned {
            return object;
        }
        if context.promotion {
            self.mark(o.id);
            if flags.contains(PromoteFlags::PINNED) {
                self.pinned.insert(o.id);
            }
            object
        } else if self.pinned.contains(&o.id) {
            object
        } else {
            o.moved().to_ref()
        }
    }

    fn is_promoted(&self, object: ObjectReference) -> bool {
        let o = TestObject::from_ref(object);
        o.generation > self.condemned || self.marked.contains(&o.id)
    }

    fn promoted_bytes(&self, _thread_number: usize) -> usize {
        self.marked.len() * 16
    }
}
