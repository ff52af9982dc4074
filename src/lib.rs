//! arena-server: a bounded-concurrency TCP server with pooled resources.
//!
//! Features:
//! - One contiguous buffer arena sliced into fixed-size I/O buffers
//! - Preallocated operation contexts, reused across connections
//! - Admission gate capping concurrently open connections
//! - Non-blocking receive/respond state machine per connection
//! - Pluggable application callback (default: fixed `+PONG` reply)

pub mod config;
pub mod error;
pub mod handler;
pub mod runtime;
pub mod server;

pub use config::Config;
pub use error::{Result, ServerError};
pub use handler::{FixedReply, Handler};
pub use server::{ConnectionServer, ServerHandle};
