//! HTTP transport layer for the Model Context Protocol
//!
//! Streamable endpoint on the configured path, legacy SSE and RPC endpoints,
//! metadata routes and the CORS layer.

pub mod cors;
pub mod handlers;
pub mod headers;
pub mod sse;
pub mod streamable;
