//! A concurrent, generation-aware handle table for garbage collected runtimes.
//!
//! Native code refers to managed objects through handles: stable slots that
//! hold an object reference and that the collector updates when it moves or
//! frees the object. This crate implements the handle tables and the handle
//! side of a collection. It does not implement a collector. A runtime
//! implements [`vm::VMBinding`] to tell the tables about its objects, and its
//! collector implements [`vm::HandleTracer`] to promote what handles keep
//! alive.
//!
//! The crate is organized as follows:
//! * [`table`]: the untyped engine. Segments, blocks, per-type caches, the
//!   age map and the scanning engine.
//! * [`object_handle`]: the handle types a runtime uses, and the passes a
//!   collector runs over them.
//! * [`handle_manager`]: the API a runtime calls to create stores and handles.
//! * [`util`]: options, logging and low level support.
//! * [`vm`]: the traits a runtime and its collector implement.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod handle_manager;
pub mod object_handle;
pub mod table;
pub mod util;
pub mod vm;

pub use crate::handle_manager::GCHandleManager;
pub use crate::handle_manager::GCHandleStore;
pub use crate::object_handle::HandleType;
pub use crate::table::ObjectHandle;
