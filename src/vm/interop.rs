use crate::util::ObjectReference;
use crate::vm::VMBinding;

/// Runtime callbacks used by specific handle types.
pub trait Interop<VM: VMBinding> {
    /// Is the native wrapper behind a ref-counted handle still referenced from
    /// native code? A ref-counted handle keeps its referent alive only while
    /// this returns true.
    ///
    /// Arguments:
    /// * `object`: The referent of the ref-counted handle.
    fn is_ref_counted_handle_active(_object: ObjectReference) -> bool {
        false
    }

    /// Visit the objects an async-pinned handle's referent keeps pinned, such
    /// as the user buffer of an overlapped I/O request. The visitor returns the
    /// possibly relocated reference, which the runtime stores back.
    ///
    /// Arguments:
    /// * `object`: The referent of the async-pinned handle.
    /// * `visitor`: Call this for each nested object.
    fn for_each_async_pinned_object(
        _object: ObjectReference,
        _visitor: &mut dyn FnMut(ObjectReference) -> ObjectReference,
    ) {
    }

    /// Return the heap the current thread prefers to allocate from. Only used
    /// in server mode to pick a table within a bucket.
    fn home_heap_number() -> usize {
        0
    }
}
