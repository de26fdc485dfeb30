#![forbid(unsafe_code)]
//! snapstore daemon: snap-read lock table, request dispatch and the
//! single-threaded poll server.

pub mod dispatch;
pub mod locks;
pub mod server;

pub use server::Server;
