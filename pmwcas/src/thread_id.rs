//! Thread-id broker: maps each live OS thread to a dense integer in
//! `[0, MAX_THREADS)`, used to index the descriptor pool.
//!
//! A thread claims the lowest free slot on first use and keeps it for its
//! lifetime; the slot is released when the thread exits, so ids are reused
//! across thread generations but never shared between live threads.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

/// Maximum number of threads that may operate on a pool concurrently.
pub const MAX_THREADS: usize = 32;

static SLOTS: [AtomicBool; MAX_THREADS] = [const { AtomicBool::new(false) }; MAX_THREADS];

/// Error returned when no thread slot is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadIdError {
    /// More than `MAX_THREADS` threads requested ids.
    Exhausted,
}

impl std::fmt::Display for ThreadIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadIdError::Exhausted => write!(f, "all {} thread id slots in use", MAX_THREADS),
        }
    }
}

impl std::error::Error for ThreadIdError {}

fn claim_in(slots: &[AtomicBool]) -> Result<usize, ThreadIdError> {
    for (i, slot) in slots.iter().enumerate() {
        if !slot.swap(true, Ordering::AcqRel) {
            return Ok(i);
        }
    }
    Err(ThreadIdError::Exhausted)
}

fn claim() -> Result<usize, ThreadIdError> {
    claim_in(&SLOTS)
}

struct IdGuard(usize);

impl Drop for IdGuard {
    fn drop(&mut self) {
        SLOTS[self.0].store(false, Ordering::Release);
    }
}

thread_local! {
    static GUARD: Cell<Option<IdGuard>> = const { Cell::new(None) };
}

/// The calling thread's id, claiming one on first use.
pub fn get() -> Result<usize, ThreadIdError> {
    GUARD.with(|guard| {
        if let Some(g) = guard.take() {
            let id = g.0;
            guard.set(Some(g));
            return Ok(id);
        }
        let id = claim()?;
        guard.set(Some(IdGuard(id)));
        Ok(id)
    })
}
