//! MCP (Model Context Protocol) client
//!
//! Capability providers are MCP servers reached over streamable HTTP. This
//! module covers the parts chatrelay needs from them:
//! - JSON-RPC 2.0 messaging with JSON or event-stream replies
//! - The `initialize` handshake and session header
//! - `tools/list` and `tools/call`

mod client;
mod transport;
mod types;

pub use client::{HttpConnector, McpClient, McpConnection, McpConnector};
pub use transport::{HttpTransport, McpMessage, SESSION_HEADER, Transport};
pub use types::*;
