//! Persistence layer for the rewind transaction manager
//!
//! One SQLite database (`tx.db`) holds four tables:
//! - `tx`: one row per logical transaction
//! - `call` / `undo_call`: the forward and inverse call logs (structurally
//!   identical)
//! - `_meta`: key-value metadata, currently just the schema version
//!
//! The store also owns the SQL-level transaction boundary. `begin`, `commit`
//! and `rollback` issue literal statements guarded by an internal open-flag,
//! so `commit`/`rollback` are no-ops when no transaction is open. The call
//! loop relies on this to switch between wrapped and autocommitted
//! statements mid-operation.

#![warn(missing_docs)]

mod store;

pub use store::{CallTable, Store, StoreError, DB_FILE, LOCK_FILE, SCHEMA_VERSION};

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
