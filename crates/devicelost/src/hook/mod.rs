//! Interception primitives: dispatch-table slots and import-table entries.

pub mod imports;
pub mod vtable;

pub use imports::redirect_import;
pub use vtable::{Binding, DispatchContract, Interceptor, dispatch_entry};
