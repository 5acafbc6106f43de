//! Schema-driven CRUD over an uploaded SQLite file.
//!
//! A [`SessionStore`] keeps a private working copy of the most recent upload,
//! the [`catalog`](libs::catalog) introspects it at runtime, the
//! [`StatementBuilder`] turns a [`LogicalOperation`] into parameterized SQL and
//! the [`Engine`] ties them together, returning a fresh [`Snapshot`] after
//! every call.

pub mod libs;

pub use libs::*;
