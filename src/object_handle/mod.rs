//! Typed handles on top of the generic table engine.
//!
//! [`HandleType`] gives each table type number its meaning, and [`roots`]
//! holds the passes a collector runs over the handles of every table in a
//! [`HandleTableMap`](crate::table::HandleTableMap).

mod callbacks;
mod handle_type;
pub mod roots;

pub use self::callbacks::DependentHandleContext;
pub use self::handle_type::compare_exchange_variable_handle_type;
pub use self::handle_type::get_variable_handle_type;
pub use self::handle_type::update_variable_handle_type;
pub use self::handle_type::HandleStrength;
pub use self::handle_type::HandleType;
pub use self::handle_type::HandleTypeInfo;
pub use self::handle_type::VariableHandleMask;
pub use self::handle_type::VariableHandleType;

pub(crate) use self::callbacks::{dependent_extra_info, dependent_secondary};
