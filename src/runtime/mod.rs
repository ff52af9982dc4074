//! Runtime building blocks for the connection server.
//!
//! - `BufferArena`: one contiguous allocation sliced into I/O buffers
//! - `OperationContextPool`: preallocated contexts, one arena slice each
//! - `AdmissionGate`: counting semaphore bounding open connections
//! - `Connection`: per-connection receive/respond state machine
//! - `ServerCounters`: atomic observability counters

mod arena;
mod connection;
mod context;
mod counters;
mod gate;

pub use arena::BufferArena;
pub use connection::{ConnState, Connection, ConnectionRegistry};
pub use context::{OpKind, OperationContext, OperationContextPool};
pub use counters::{CountersSnapshot, ServerCounters};
pub use gate::{AdmissionGate, AdmissionPermit};

/// Contexts preallocated per admitted connection.
///
/// A connection receives and sends through the same context, so it checks
/// out only one. The second context and its arena slice stay unused; the
/// arena therefore holds `max_connections * buffer_size` bytes that no
/// connection ever touches.
pub const OPS_PER_CONNECTION: usize = 2;
