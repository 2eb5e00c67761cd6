//! The interface between the handle table and the runtime that embeds it.
//!
//! A runtime implements [`VMBinding`] on a zero-sized type and supplies its
//! object model and interop callbacks through the associated types. The
//! collector drives scans with a [`HandleTracer`] and a [`ScanContext`].

mod interop;
mod object_model;
mod scanning;

pub use self::interop::Interop;
pub use self::object_model::ObjectModel;
pub use self::scanning::HandleTracer;
pub use self::scanning::PromoteFlags;
pub use self::scanning::ScanContext;

/// The `VMBinding` trait associates the traits a runtime implements for the handle table.
pub trait VMBinding
where
    Self: Sized + 'static + Send + Sync,
{
    /// How the handle table learns the generation of an object.
    type VMObjectModel: ObjectModel<Self>;
    /// Callbacks for the handle types whose liveness the runtime decides.
    type VMInterop: Interop<Self>;
}
