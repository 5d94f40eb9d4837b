//! # Refork MCP Server
//!
//! Line-delimited JSON-RPC 2.0 over stdio, MCP-compatible
//! (`protocolVersion "2024-11-05"`).
//!
//! One UTF-8 JSON document per line in, one per line out. Responses are
//! written by a single writer task so every line is atomic; ordering is not
//! guaranteed and correlation is by `id`. The service binds no sockets.

pub mod dispatcher;
pub mod env;
pub mod rpc;
pub mod tools;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use env::Environment;
