//! Runtime selection of the active storage backend.

mod degraded;
mod selector;

pub use degraded::DegradedStore;
pub use selector::{BackendMode, BackendSelector, write_probe};
