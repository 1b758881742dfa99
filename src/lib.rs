//! chatrelay - chat orchestration server
//!
//! A user message goes in; a multi-step model turn comes out as a stream of
//! events that any number of clients can attach to, with tools discovered
//! from remote MCP capability providers at request time.

pub mod cli;
pub mod config;
pub mod mcp;
pub mod provider;
pub mod server;
pub mod session;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod tool;
