//! A binding for unit tests.
//!
//! Mock objects are not real memory. An object reference encodes an id, a
//! generation and one flag bit, which is enough for the handle table: it
//! never dereferences objects, it only asks the binding about them.

use crate::util::{Address, ObjectReference};
use crate::vm::*;
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

const ID_SHIFT: usize = 7;
const FLAG_BIT: usize = 1 << 6;
const GEN_SHIFT: usize = 3;
const GEN_MASK: usize = 0x7;

pub const MOCK_MAX_GEN: u8 = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MockObject {
    pub id: usize,
    pub generation: u8,
    pub flag: bool,
}

impl MockObject {
    pub fn new(id: usize, generation: u8) -> Self {
        assert!(id > 0);
        assert!(generation as usize <= GEN_MASK);
        MockObject {
            id,
            generation,
            flag: false,
        }
    }

    pub fn flagged(id: usize, generation: u8) -> Self {
        MockObject {
            flag: true,
            ..Self::new(id, generation)
        }
    }

    pub fn generation(&self) -> u8 {
        self.generation
    }

    pub fn to_ref(self) -> ObjectReference {
        let raw = (self.id << ID_SHIFT)
            | if self.flag { FLAG_BIT } else { 0 }
            | ((self.generation as usize) << GEN_SHIFT);
        ObjectReference::from_raw_address(unsafe { Address::from_usize(raw) }).unwrap()
    }

    pub fn from_ref(object: ObjectReference) -> Self {
        let raw = object.value();
        MockObject {
            id: raw >> ID_SHIFT,
            generation: ((raw >> GEN_SHIFT) & GEN_MASK) as u8,
            flag: raw & FLAG_BIT != 0,
        }
    }

    /// The same object after the collector moved it into the next generation.
    pub fn promoted(self) -> Self {
        MockObject {
            generation: (self.generation + 1).min(MOCK_MAX_GEN),
            ..self
        }
    }
}

lazy_static! {
    /// Objects an async-pinned referent keeps pinned, by referent id.
    pub static ref ASYNC_PINNED_PAYLOADS: Mutex<HashMap<usize, ObjectReference>> =
        Mutex::new(HashMap::new());
}

thread_local! {
    pub static HOME_HEAP: Cell<usize> = const { Cell::new(0) };
}

#[derive(Default)]
pub struct MockVM;

impl VMBinding for MockVM {
    type VMObjectModel = MockVM;
    type VMInterop = MockVM;
}

impl ObjectModel<MockVM> for MockVM {
    fn generation_of(object: ObjectReference) -> u8 {
        MockObject::from_ref(object).generation
    }
}

impl Interop<MockVM> for MockVM {
    fn is_ref_counted_handle_active(object: ObjectReference) -> bool {
        MockObject::from_ref(object).flag
    }

    fn for_each_async_pinned_object(
        object: ObjectReference,
        visitor: &mut dyn FnMut(ObjectReference) -> ObjectReference,
    ) {
        let id = MockObject::from_ref(object).id;
        let mut payloads = ASYNC_PINNED_PAYLOADS.lock().unwrap();
        if let Some(payload) = payloads.get_mut(&id) {
            *payload = visitor(*payload);
        }
    }

    fn home_heap_number() -> usize {
        HOME_HEAP.with(|heap| heap.get())
    }
}

/// A collector that condemns generations `0..=condemned`.
///
/// While marking, `promote` records the object and returns it unchanged.
/// While relocating, it moves every condemned object that was not pinned into
/// the next generation.
pub struct MockTracer {
    pub condemned: u8,
    pub promoted: HashSet<usize>,
    pub pinned: HashSet<usize>,
    pub promote_calls: Vec<(MockObject, PromoteFlags)>,
}

impl MockTracer {
    pub fn new(condemned: u8) -> Self {
        MockTracer {
            condemned,
            promoted: HashSet::new(),
            pinned: HashSet::new(),
            promote_calls: Vec::new(),
        }
    }
}

impl HandleTracer for MockTracer {
    fn promote(
        &mut self,
        object: ObjectReference,
        context: &mut ScanContext,
        flags: PromoteFlags,
    ) -> ObjectReference {
        let mock = MockObject::from_ref(object);
        self.promote_calls.push((mock, flags));
        if mock.generation > self.condemned {
            return object;
        }
        if context.promotion {
            self.promoted.insert(mock.id);
            if flags.contains(PromoteFlags::PINNED) {
                self.pinned.insert(mock.id);
            }
            object
        } else if self.pinned.contains(&mock.id) {
            object
        } else {
            mock.promoted().to_ref()
        }
    }

    fn is_promoted(&self, object: ObjectReference) -> bool {
        let mock = MockObject::from_ref(object);
        mock.generation > self.condemned || self.promoted.contains(&mock.id)
    }

    fn promoted_bytes(&self, _thread_number: usize) -> usize {
        self.promoted.len() * 32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_round_trips() {
        let object = MockObject::flagged(12345, 2);
        assert_eq!(MockObject::from_ref(object.to_ref()), object);
        assert_eq!(MockVM::generation_of(object.to_ref()), 2);
        assert!(MockVM::is_ref_counted_handle_active(object.to_ref()));
    }
}
