//! PMwCAS descriptors and the install/decide/persist/finalize state machine.
//!
//! A descriptor is a 256-byte persistent record owned by exactly one thread
//! (the broker guarantees single ownership) and reused for every operation
//! that thread performs. The committed/failed verdict is pinned to the medium
//! *before* any target cell is touched: the pre-operation persist writes
//! `status = Failed`, so a crash at any point before the `Succeeded` header
//! reaches the medium is indistinguishable from a decided failure and
//! recovery rolls back.
//!
//! Helpers drive decided-successful operations forward (redo). Roll-back is
//! deliberately never helped while the owner may be live: `Failed` doubles as
//! the pre-decision state, so a helper cannot tell "decided to fail" from
//! "still installing", and undoing a mid-install cell would let the owner
//! commit a half-applied operation. Threads that run into a non-committed
//! descriptor wait for the owner instead; recovery, which runs with no owner
//! alive, performs both roll-forward and roll-back.

use crate::field;
use crate::target::Target;
use crate::{PMWCAS_CAPACITY, PcasWord, WORD_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) const STATUS_COMPLETED: u64 = 0;
pub(crate) const STATUS_FAILED: u64 = 1;
pub(crate) const STATUS_SUCCEEDED: u64 = 2;

/// Bytes covered when persisting the descriptor header
/// (`status`/`count`/`self_ref`/`epoch`).
const HEADER_SIZE: usize = 32;

pub(crate) const DESC_SIZE: usize = 256;

/// Error returned by [`Descriptor::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddError {
    /// The descriptor already holds `PMWCAS_CAPACITY` targets.
    CapacityExceeded,
    /// `old` or `new` has one of the two reserved top bits set.
    InvalidPayload,
    /// The target address does not lie within the pool mapping.
    OutOfPool,
}

impl std::fmt::Display for AddError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddError::CapacityExceeded => write!(f, "descriptor capacity exceeded"),
            AddError::InvalidPayload => write!(f, "payload uses the reserved top bits"),
            AddError::OutOfPool => write!(f, "target address outside the pool"),
        }
    }
}

impl std::error::Error for AddError {}

/// A persistent K-word compare-and-swap descriptor.
///
/// Obtained from [`crate::Pool::get`]; the same thread always receives the
/// same descriptor. All fields are atomics so helpers can inspect a live
/// descriptor without data races.
#[repr(C, align(256))]
pub struct Descriptor {
    /// Operation verdict; `Failed` is also the pre-decision state.
    status: AtomicU64,
    /// Number of populated targets.
    count: AtomicU64,
    /// This descriptor's embedded form: pool offset | epoch | DESC flag.
    /// Derived state, recomputed on every pool open.
    self_ref: AtomicU64,
    /// Reuse counter; its low 8 bits are carried inside `self_ref`.
    epoch: AtomicU64,
    targets: [Target; PMWCAS_CAPACITY],
    // volatile caches, rewritten by `initialize` on every pool open
    mapped_base: AtomicU64,
    mapped_len: AtomicU64,
    _pad: [u8; 16],
}

const _: () = assert!(size_of::<Descriptor>() == DESC_SIZE);
const _: () = assert!(align_of::<Descriptor>() == DESC_SIZE);

impl Descriptor {
    /// The number of targets registered for the next operation.
    pub fn size(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    /// Registers one target word for the next [`Descriptor::pmwcas`] call.
    ///
    /// # Safety
    ///
    /// `addr` must point to an 8-byte-aligned word inside this descriptor's
    /// pool, and the word must only ever be accessed through the PCAS/PMwCAS
    /// operations of this crate while the operation runs.
    pub unsafe fn add<T: PcasWord>(
        &self,
        addr: *mut T,
        old: T,
        new: T,
        fence: Ordering,
    ) -> Result<(), AddError> {
        let count = self.count.load(Ordering::Relaxed) as usize;
        if count >= PMWCAS_CAPACITY {
            return Err(AddError::CapacityExceeded);
        }

        let old = old.into_word();
        let new = new.into_word();
        if (old | new) & field::INTERMEDIATE != 0 {
            return Err(AddError::InvalidPayload);
        }

        let base = self.mapped_base.load(Ordering::Relaxed) as usize;
        let len = self.mapped_len.load(Ordering::Relaxed) as usize;
        let addr = addr as usize;
        if addr % WORD_SIZE != 0 || addr < base || addr + WORD_SIZE > base + len {
            return Err(AddError::OutOfPool);
        }

        self.targets[count].set((addr - base) as u64, old, new, fence);
        self.count.store(count as u64 + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Runs the registered targets as one persistent multi-word CAS.
    ///
    /// Returns `true` when every target was swung from its expected to its
    /// desired payload; `false` when any pre-image had changed (all installed
    /// cells are rolled back). Either way the descriptor is ready for reuse
    /// on return.
    pub fn pmwcas(&self) -> bool {
        let base = self.base();
        let count = self.size();
        let self_ref = self.self_ref.load(Ordering::Relaxed);

        // Pin the Failed verdict before touching any target: from here until
        // the Succeeded header is durable, a crash means roll-back.
        self.status.store(STATUS_FAILED, Ordering::Relaxed);
        unsafe {
            pmem::persist(
                (self as *const Self).cast(),
                HEADER_SIZE + size_of::<Target>() * count,
            )
        };

        let mut embedded = 0;
        while embedded < count && self.targets[embedded].install(self_ref, base) {
            embedded += 1;
        }

        if embedded < count {
            for target in &self.targets[..embedded] {
                target.undo(self_ref, base);
            }
            pmem::drain();
            // The on-medium status is still Failed, which already describes
            // this outcome; no further persist is needed.
            self.finish();
            return false;
        }

        // The embedded references must be durable before the verdict, or
        // recovery could not find the cells to roll forward.
        for target in &self.targets[..count] {
            target.flush(base);
        }
        self.status.store(STATUS_SUCCEEDED, Ordering::Release);
        unsafe { pmem::flush((self as *const Self).cast(), HEADER_SIZE) };
        pmem::drain();

        for target in &self.targets[..count] {
            target.redo(self_ref, base);
        }
        pmem::drain();

        self.finish();
        true
    }

    /// Volatile reset after a completed operation: new epoch, empty target
    /// list, idle status. The epoch becomes durable with the next operation's
    /// pre-persist, before any cell can carry it.
    fn finish(&self) {
        self.count.store(0, Ordering::Relaxed);
        let epoch = self.epoch.load(Ordering::Relaxed).wrapping_add(1);
        self.epoch.store(epoch, Ordering::Relaxed);
        let off = field::payload(self.self_ref.load(Ordering::Relaxed)) & !field::EPOCH_MASK;
        self.self_ref
            .store(field::with_desc(off, epoch as u8), Ordering::Relaxed);
        self.status.store(STATUS_COMPLETED, Ordering::Release);
    }

    /// Cooperative completion of a committed operation, called by any thread
    /// that found `self_word` embedded in a target cell.
    ///
    /// Returns `true` if the redo phase was run. Helpers never consult the
    /// target cells again afterwards; the caller reloads its own cell.
    pub(crate) fn help_redo(&self, self_word: u64) -> bool {
        if self.status.load(Ordering::Acquire) != STATUS_SUCCEEDED {
            return false;
        }
        if self.self_ref.load(Ordering::Relaxed) != self_word {
            // recycled since self_word was read; the operation it names is
            // already complete
            return false;
        }
        let base = self.base();
        let count = self.size().min(PMWCAS_CAPACITY);
        for target in &self.targets[..count] {
            target.redo(self_word, base);
        }
        pmem::drain();
        true
    }

    /// Recovery entry point, invoked for every descriptor by the pool-open
    /// sweep. Re-derives `self_ref` from the current mapping, then rolls the
    /// interrupted operation forward (`Succeeded`) or back (anything else).
    ///
    /// The caller drains once after sweeping the whole pool.
    pub(crate) fn initialize(&self, base: *mut u8, len: usize, off: u64) {
        self.mapped_base.store(base as u64, Ordering::Relaxed);
        self.mapped_len.store(len as u64, Ordering::Relaxed);
        let epoch = self.epoch.load(Ordering::Relaxed);
        let self_ref = field::with_desc(off, epoch as u8);
        self.self_ref.store(self_ref, Ordering::Relaxed);

        let status = self.status.load(Ordering::Relaxed);
        if status != STATUS_COMPLETED {
            let succeeded = status == STATUS_SUCCEEDED;
            let count = self.size().min(PMWCAS_CAPACITY);
            for target in &self.targets[..count] {
                target.recover(succeeded, self_ref, base);
            }
        }

        self.status.store(STATUS_COMPLETED, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        unsafe { pmem::flush((self as *const Self).cast(), HEADER_SIZE) };
    }

    fn base(&self) -> *mut u8 {
        self.mapped_base.load(Ordering::Relaxed) as usize as *mut u8
    }

    #[cfg(test)]
    pub(crate) fn test_state(&self) -> (u64, u64, u64) {
        (
            self.status.load(Ordering::Relaxed),
            self.count.load(Ordering::Relaxed),
            self.self_ref.load(Ordering::Relaxed),
        )
    }

    #[cfg(test)]
    pub(crate) fn test_drive_to_install(&self) -> bool {
        // runs states A and B only; used to park an operation mid-protocol
        let base = self.base();
        let count = self.size();
        let self_ref = self.self_ref.load(Ordering::Relaxed);

        self.status.store(STATUS_FAILED, Ordering::Relaxed);
        unsafe {
            pmem::persist(
                (self as *const Self).cast(),
                HEADER_SIZE + size_of::<Target>() * count,
            )
        };

        for target in &self.targets[..count] {
            if !target.install(self_ref, base) {
                return false;
            }
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn test_commit_verdict(&self) {
        // runs state D only (after test_drive_to_install)
        let base = self.base();
        for target in &self.targets[..self.size()] {
            target.flush(base);
        }
        self.status.store(STATUS_SUCCEEDED, Ordering::Release);
        unsafe { pmem::flush((self as *const Self).cast(), HEADER_SIZE) };
        pmem::drain();
    }

    #[cfg(test)]
    pub(crate) fn test_finish(&self) {
        let base = self.base();
        let self_ref = self.self_ref.load(Ordering::Relaxed);
        for target in &self.targets[..self.size()] {
            target.redo(self_ref, base);
        }
        pmem::drain();
        self.finish();
    }
}
