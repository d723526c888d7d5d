//! Model Context Protocol (MCP) JSON-RPC handling
//!
//! Wire envelope types and classification live in `rpc`; the method table and
//! in-flight request tracking live in `server`.

pub mod rpc;
pub mod server;
