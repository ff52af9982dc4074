//! Connection state machine for managing TCP connections.
//!
//! Each connection strictly alternates between receiving a request into its
//! context slice and sending the response back out of the same slice. Only
//! one operation is ever outstanding per connection. A finished connection
//! leaves the registry and is split back into its parts.

use crate::runtime::{AdmissionPermit, OpKind, OperationContext};
use mio::net::TcpStream;
use mio::Interest;
use slab::Slab;
use std::net::SocketAddr;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the next request.
    Receiving,
    /// Sending the response held in the context slice.
    Responding {
        /// Bytes already written.
        written: usize,
        /// Total bytes to write.
        total: usize,
    },
}

impl ConnState {
    /// Readiness needed for the pending operation.
    pub fn interest(&self) -> Interest {
        match self {
            ConnState::Receiving => Interest::READABLE,
            ConnState::Responding { .. } => Interest::WRITABLE,
        }
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Context checked out for this connection's lifetime.
    pub context: OperationContext,
    pub state: ConnState,
    /// Interest currently registered with the poller.
    pub interest: Interest,
    /// Bytes received on this connection.
    pub bytes_served: u64,
    /// Responses fully sent on this connection.
    pub requests: u64,
    /// Admission slot, released when the connection is dropped.
    permit: AdmissionPermit,
}

impl Connection {
    /// Create a new connection in the receiving state.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        mut context: OperationContext,
        permit: AdmissionPermit,
    ) -> Self {
        context.record(OpKind::Receive);
        Self {
            stream,
            peer,
            context,
            state: ConnState::Receiving,
            interest: Interest::READABLE,
            bytes_served: 0,
            requests: 0,
            permit,
        }
    }

    /// Transition to sending a `total`-byte response.
    pub fn start_responding(&mut self, total: usize) {
        self.context.record(OpKind::Send);
        self.state = ConnState::Responding { written: 0, total };
    }

    /// Account for `n` bytes written.
    ///
    /// Returns `true` once the whole response is out, after which the
    /// connection is back in the receiving state.
    pub fn advance_write(&mut self, n: usize) -> bool {
        if let ConnState::Responding { written, total } = &mut self.state {
            *written += n;
            if *written >= *total {
                self.requests += 1;
                self.start_receiving();
                return true;
            }
        }
        false
    }

    /// Transition back to receiving.
    pub fn start_receiving(&mut self) {
        self.context.record(OpKind::Receive);
        self.state = ConnState::Receiving;
    }

    /// Split into the socket, the context and the admission slot.
    pub fn into_parts(self) -> (TcpStream, OperationContext, AdmissionPermit) {
        (self.stream, self.context, self.permit)
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection and bind its context to the assigned id.
    ///
    /// Returns the connection back if the registry is at capacity.
    pub fn insert(&mut self, mut conn: Connection) -> Result<usize, Connection> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        let entry = self.connections.vacant_entry();
        let id = entry.key();
        conn.context.bind(id);
        entry.insert(conn);
        Ok(id)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    /// Ids of every open connection.
    pub fn ids(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }

}
