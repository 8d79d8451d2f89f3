//! Multi-client TCP relay.
//!
//! Every message a client sends is forwarded to every other connected
//! client. Messages are opaque byte payloads carried in length-prefixed
//! frames. Each module has one responsibility:
//!
//! - [`frame`] encodes and decodes the `[u32 big-endian length][payload]`
//!   wire format.
//! - [`connection`] wraps one accepted socket: buffered receive, serialized
//!   send, idempotent close.
//! - [`registry`] is the shared set of live connections, guarded by one lock
//!   and read through snapshots.
//! - [`dispatch`] fans a message out to everyone but its sender and evicts
//!   recipients whose send fails.
//! - [`server`] runs the accept loop and one handler task per connection.
//! - [`config`] and [`cli`] describe how the binary is configured.
//! - [`client`] is a small interactive client for trying the relay out.
//! - [`transfer`] is a separate one-way file upload protocol (name line,
//!   raw bytes, half-close) with its sender and receiver.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod frame;
pub mod registry;
pub mod server;
pub mod transfer;
