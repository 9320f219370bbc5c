//! Namespace index: the durable (repository, path) → blob mapping.

pub mod memory;
pub mod sqlite;
pub mod store;
