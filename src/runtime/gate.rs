//! Admission gate bounding concurrently open connections.
//!
//! A thin wrapper over a counting semaphore. The accept path takes a permit
//! before accepting; the permit lives inside the connection and its slot is
//! returned when the connection is dropped.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting semaphore sized to the maximum number of connections.
#[derive(Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    max: usize,
}

/// One admitted connection slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Take a slot if one is free.
    ///
    /// Never blocks. `None` means the gate is saturated and the caller must
    /// stop accepting until a permit is dropped.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| AdmissionPermit { _permit: permit })
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn outstanding(&self) -> usize {
        self.max - self.available()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_bounds_admissions() {
        let gate = AdmissionGate::new(2);

        let first = gate.try_acquire().expect("first slot");
        let second = gate.try_acquire().expect("second slot");
        assert_eq!(gate.outstanding(), 2);
        assert_eq!(gate.available(), 0);

        // Saturated
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.outstanding(), 2);

        drop(first);
        assert_eq!(gate.outstanding(), 1);

        let third = gate.try_acquire().expect("slot freed by drop");
        assert_eq!(gate.outstanding(), 2);

        drop(second);
        drop(third);
        assert_eq!(gate.available(), gate.max());
    }

    #[test]
    fn test_gate_clones_share_slots() {
        let gate = AdmissionGate::new(1);
        let view = gate.clone();

        let permit = gate.try_acquire().unwrap();
        assert!(view.try_acquire().is_none());
        assert_eq!(view.outstanding(), 1);

        drop(permit);
        assert!(view.try_acquire().is_some());
    }
}
