//! Minimal TCP chat relay with in-band file transfer.
//!
//! The server takes the first frame on each connection as the client's
//! display name, relays chat text to every other connected client, and
//! moves files in either direction over the same socket, delimited by a
//! literal `EOF` sentinel. Each module focuses on one responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`frame`] defines the raw wire format: read-sized frames, control
//!   prefixes, and the transfer sentinel.
//! - [`registry`] tracks connected sessions and fans out broadcasts.
//! - [`server`] accepts TCP connections and runs one session handler per
//!   client.
//! - [`transfer`] implements the sentinel-delimited file sub-protocol.
//! - [`chatlog`] appends the chat transcript to a file.
//! - [`client`] connects to a relay and multiplexes stdin with server
//!   frames for a terminal user.
//!
//! Integration tests use this crate directly to exercise the registry and
//! the session state machine over real sockets.

pub mod chatlog;
pub mod cli;
pub mod client;
pub mod frame;
pub mod registry;
pub mod server;
pub mod transfer;
