//! Pooled per-operation I/O contexts.
//!
//! Every context is bound at construction to one slice of the
//! [`BufferArena`] and is reused for the lifetime of the server. A
//! connection checks a context out on accept, receives into and sends from
//! its slice, and puts it back on close.

use crate::error::{Result, ServerError};
use crate::runtime::BufferArena;
use std::sync::Mutex;

/// Kind of the last I/O operation issued with a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Receive,
    Send,
}

/// Reusable I/O state bound to one arena slice.
#[derive(Debug)]
pub struct OperationContext {
    /// Start of the slice in the arena.
    offset: usize,
    /// Length of the slice.
    len: usize,
    /// Connection currently holding this context.
    bound: Option<usize>,
    /// Last operation issued, for diagnostics.
    last_op: Option<OpKind>,
}

impl OperationContext {
    fn new(offset: usize, len: usize) -> Self {
        Self {
            offset,
            len,
            bound: None,
            last_op: None,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn slice_len(&self) -> usize {
        self.len
    }

    /// Attach the context to a connection.
    pub fn bind(&mut self, conn_id: usize) {
        debug_assert!(self.bound.is_none(), "context already bound");
        self.bound = Some(conn_id);
    }

    pub fn bound(&self) -> Option<usize> {
        self.bound
    }

    /// Record the operation about to be issued.
    pub fn record(&mut self, op: OpKind) {
        self.last_op = Some(op);
    }

    pub fn last_op(&self) -> Option<OpKind> {
        self.last_op
    }

    fn reset(&mut self) {
        self.bound = None;
        self.last_op = None;
    }
}

/// Thread-safe stack of preallocated operation contexts.
///
/// `available() + checked_out() == total()` holds at every instant.
pub struct OperationContextPool {
    available: Mutex<Vec<OperationContext>>,
    total: usize,
}

impl OperationContextPool {
    /// Preallocate `count` contexts, each bound to a fresh arena slice.
    pub fn preallocate(count: usize, arena: &mut BufferArena) -> Result<Self> {
        let mut available = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = arena.checkout()?;
            available.push(OperationContext::new(offset, arena.slice_size()));
        }

        Ok(Self {
            available: Mutex::new(available),
            total: count,
        })
    }

    /// Take a context out of the pool.
    pub fn checkout(&self) -> Result<OperationContext> {
        self.lock().pop().ok_or(ServerError::PoolExhausted { total: self.total })
    }

    /// Return a context to the pool.
    ///
    /// The caller must not have any I/O outstanding against its slice.
    pub fn put_back(&self, mut ctx: OperationContext) {
        ctx.reset();
        self.lock().push(ctx);
    }

    /// Release the slices of every pooled context back to the arena.
    ///
    /// Contexts still checked out are not touched. Returns the number of
    /// contexts torn down. Only called once the server has stopped serving.
    pub fn teardown(&self, arena: &mut BufferArena) -> usize {
        let drained: Vec<OperationContext> = self.lock().drain(..).collect();
        for ctx in &drained {
            arena.release(ctx.offset);
        }
        drained.len()
    }

    pub fn available(&self) -> usize {
        self.lock().len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn checked_out(&self) -> usize {
        self.total - self.available()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OperationContext>> {
        // The stack stays consistent even if a holder panicked mid push/pop.
        self.available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
