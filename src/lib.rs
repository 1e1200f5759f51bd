//! Mods is a command-line client that streams chat completions from a
//! configurable set of LLM providers and persists each conversation
//! under a content-addressed id.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`proto`] defines the shared message model.
//! - [`stream`] is the cursor contract every provider adapter honors,
//!   including tool rounds that reopen the underlying request.
//! - [`api`] holds the five provider adapters and their wire payloads.
//! - [`mcp`] discovers and invokes tools on external MCP servers over
//!   stdio, SSE, and streamable HTTP transports.
//! - [`store`] is the conversation index (SQLite) plus the
//!   content-addressed message-blob caches.
//! - [`core`] carries configuration and the session coordinator that
//!   binds everything into one event-driven run.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and
//! route through [`cli::run`].

pub mod api;
pub mod cli;
pub mod core;
pub mod error;
pub mod load;
pub mod logging;
pub mod mcp;
pub mod proto;
pub mod sha;
pub mod store;
pub mod stream;
pub mod term;
