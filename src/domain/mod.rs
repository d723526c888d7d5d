//! Tool collaborators reached through the dispatcher
//!
//! The dispatcher only knows the `ToolRegistry` contract; `BuiltinTools` is the
//! small in-process registry the binary ships with.

pub mod registry;
pub mod tools;
