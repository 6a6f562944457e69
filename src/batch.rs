//! Batch countdown for response correlation.
//!
//! Each sent batch of N requests expects exactly N responses. The tracker
//! keeps one countdown per in-flight batch, oldest first; every received
//! response decrements the oldest one, and reaching zero is the one-time
//! completion event of that batch.
//!
//! Batches are armed before their frame is written, so a fast server can
//! never deliver a response ahead of the countdown it belongs to.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Result of recording one received response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchProgress {
    /// The oldest batch still expects `remaining` responses.
    Pending { remaining: usize },
    /// That response was the last one of the oldest batch.
    Completed,
    /// No batch was waiting for a response.
    Unexpected,
}

/// FIFO of per-batch countdowns.
#[derive(Debug, Default)]
pub struct BatchTracker {
    outstanding: Mutex<VecDeque<usize>>,
}

impl BatchTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<usize>> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm a countdown for a batch of `size` requests.
    ///
    /// Returns `false` for an empty batch: nothing is armed and the batch is
    /// complete already.
    pub fn arm(&self, size: usize) -> bool {
        if size == 0 {
            return false;
        }
        self.lock().push_back(size);
        true
    }

    /// Roll back the most recently armed countdown after a failed write.
    pub fn abandon_last(&self) -> Option<usize> {
        self.lock().pop_back()
    }

    /// Count one received response against the oldest batch.
    pub fn record(&self) -> BatchProgress {
        let mut outstanding = self.lock();
        match outstanding.front_mut() {
            None => BatchProgress::Unexpected,
            Some(remaining) if *remaining <= 1 => {
                outstanding.pop_front();
                BatchProgress::Completed
            }
            Some(remaining) => {
                *remaining -= 1;
                BatchProgress::Pending {
                    remaining: *remaining,
                }
            }
        }
    }

    /// Drop every countdown, returning how many responses were still expected.
    pub fn reset(&self) -> usize {
        let mut outstanding = self.lock();
        let remaining = outstanding.iter().sum();
        outstanding.clear();
        remaining
    }

    /// Total responses still expected across all in-flight batches.
    pub fn pending_responses(&self) -> usize {
        self.lock().iter().sum()
    }

    /// Number of batches still waiting for responses.
    pub fn batches_in_flight(&self) -> usize {
        self.lock().len()
    }
}
