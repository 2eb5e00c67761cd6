use crate::util::ObjectReference;
use crate::vm::VMBinding;

/// The object model of the runtime, as far as the handle table needs it.
pub trait ObjectModel<VM: VMBinding> {
    /// Return the generation the object currently lives in, where 0 is the
    /// youngest. The write barrier uses this to keep the age map conservative,
    /// so the result must never be older than the object's real generation.
    ///
    /// Arguments:
    /// * `object`: The object to query. It is never null.
    fn generation_of(object: ObjectReference) -> u8;
}
