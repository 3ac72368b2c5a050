//! One row of a PMwCAS descriptor: a target cell identified by its
//! pool-relative offset, its expected and desired payloads, and the memory
//! ordering to apply when the new value is installed.
//!
//! Fields are atomics so that helpers can read a slot without a data race
//! while the owner is the only writer; rows are persisted as part of the
//! descriptor's pre-operation persist.

use crate::field;
use crate::{SPINLOCK_RETRY_NUM, WORD_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};

#[repr(C)]
pub(crate) struct Target {
    offset: AtomicU64,
    old: AtomicU64,
    new: AtomicU64,
    /// Encoded [`Ordering`]; only the low byte is meaningful.
    fence: AtomicU64,
}

const _: () = assert!(size_of::<Target>() == 32);

fn encode_order(order: Ordering) -> u64 {
    match order {
        Ordering::Relaxed => 0,
        Ordering::Acquire => 1,
        Ordering::Release => 2,
        Ordering::AcqRel => 3,
        _ => 4,
    }
}

fn decode_order(bits: u64) -> Ordering {
    match bits {
        0 => Ordering::Relaxed,
        1 => Ordering::Acquire,
        2 => Ordering::Release,
        3 => Ordering::AcqRel,
        _ => Ordering::SeqCst,
    }
}

impl Target {
    pub(crate) fn set(&self, offset: u64, old: u64, new: u64, fence: Ordering) {
        self.offset.store(offset, Ordering::Relaxed);
        self.old.store(old, Ordering::Relaxed);
        self.new.store(new, Ordering::Relaxed);
        self.fence.store(encode_order(fence), Ordering::Relaxed);
    }

    fn cell(&self, base: *mut u8) -> &AtomicU64 {
        let off = self.offset.load(Ordering::Relaxed) as usize;
        unsafe { &*(base.add(off) as *const AtomicU64) }
    }

    /// Swings the cell from its expected payload to the descriptor reference.
    ///
    /// Returns `false` as soon as a stable foreign value is observed (the
    /// pre-image has changed, the whole operation must fail) or once the
    /// retry budget is exhausted on intermediate values.
    pub(crate) fn install(&self, self_ref: u64, base: *mut u8) -> bool {
        let cell = self.cell(base);
        let old = self.old.load(Ordering::Relaxed);
        let success = decode_order(self.fence.load(Ordering::Relaxed));

        let mut retries = 0;
        loop {
            match cell.compare_exchange(old, self_ref, success, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(current) => {
                    if !field::is_intermediate(current) || retries >= SPINLOCK_RETRY_NUM {
                        return false;
                    }
                }
            }
            retries += 1;
            std::hint::spin_loop();
        }
    }

    /// Schedules the installed descriptor reference for write-back.
    pub(crate) fn flush(&self, base: *mut u8) {
        unsafe { pmem::flush(self.cell(base).as_ptr().cast(), WORD_SIZE) };
    }

    /// Replaces the descriptor reference with the desired payload.
    ///
    /// A no-op once the cell no longer equals `self_ref`, so owner and
    /// helpers may race freely.
    pub(crate) fn redo(&self, self_ref: u64, base: *mut u8) {
        let cell = self.cell(base);
        let new = self.new.load(Ordering::Relaxed);
        let fence = decode_order(self.fence.load(Ordering::Relaxed));
        self.replace(cell, self_ref, new, fence);
    }

    /// Restores the expected payload; same no-op rule as [`Target::redo`].
    pub(crate) fn undo(&self, self_ref: u64, base: *mut u8) {
        let cell = self.cell(base);
        let old = self.old.load(Ordering::Relaxed);
        self.replace(cell, self_ref, old, Ordering::Relaxed);
    }

    fn replace(&self, cell: &AtomicU64, self_ref: u64, value: u64, order: Ordering) {
        if cfg!(feature = "dirty-flag") {
            let dirty = field::with_dirty(value);
            if cell
                .compare_exchange(self_ref, dirty, order, Ordering::Relaxed)
                .is_ok()
            {
                unsafe { pmem::persist(cell.as_ptr().cast(), WORD_SIZE) };
                let _ = cell.compare_exchange(dirty, value, Ordering::Relaxed, Ordering::Relaxed);
            } else {
                unsafe { pmem::flush(cell.as_ptr().cast(), WORD_SIZE) };
            }
        } else {
            let _ = cell.compare_exchange(self_ref, value, order, Ordering::Relaxed);
            unsafe { pmem::flush(cell.as_ptr().cast(), WORD_SIZE) };
        }
    }

    /// Pool-open recovery for this row. Runs single-threaded; plain stores
    /// suffice.
    pub(crate) fn recover(&self, succeeded: bool, self_ref: u64, base: *mut u8) {
        let cell = self.cell(base);
        let word = cell.load(Ordering::Relaxed);
        if word == self_ref {
            let value = if succeeded {
                self.new.load(Ordering::Relaxed)
            } else {
                self.old.load(Ordering::Relaxed)
            };
            cell.store(value, Ordering::Relaxed);
        } else if field::is_dirty(word) {
            cell.store(field::clear_flags(word), Ordering::Relaxed);
        }
        unsafe { pmem::flush(cell.as_ptr().cast(), WORD_SIZE) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target_at(idx: usize, old: u64, new: u64) -> Target {
        let t = Target {
            offset: AtomicU64::new(0),
            old: AtomicU64::new(0),
            new: AtomicU64::new(0),
            fence: AtomicU64::new(0),
        };
        t.set((idx * WORD_SIZE) as u64, old, new, Ordering::SeqCst);
        t
    }

    fn base_of(buf: &[AtomicU64]) -> *mut u8 {
        buf.as_ptr() as *mut u8
    }

    const SELF_REF: u64 = field::DESC_FLAG | 0x700;

    #[test]
    fn test_install_on_expected_value() {
        let buf = [AtomicU64::new(5), AtomicU64::new(9)];
        let t = target_at(1, 9, 10);

        assert!(t.install(SELF_REF, base_of(&buf)));
        assert_eq!(buf[1].load(Ordering::SeqCst), SELF_REF);
        assert_eq!(buf[0].load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_install_fails_on_foreign_value() {
        let buf = [AtomicU64::new(7)];
        let t = target_at(0, 9, 10);

        assert!(!t.install(SELF_REF, base_of(&buf)));
        assert_eq!(buf[0].load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_install_gives_up_on_persistent_intermediate() {
        let other_desc = field::DESC_FLAG | 0x900;
        let buf = [AtomicU64::new(other_desc)];
        let t = target_at(0, 9, 10);

        assert!(!t.install(SELF_REF, base_of(&buf)));
        assert_eq!(buf[0].load(Ordering::SeqCst), other_desc);
    }

    #[test]
    fn test_redo_idempotent() {
        let buf = [AtomicU64::new(SELF_REF)];
        let t = target_at(0, 1, 2);
        let base = base_of(&buf);

        t.redo(SELF_REF, base);
        assert_eq!(buf[0].load(Ordering::SeqCst), 2);

        // applying redo again must not disturb the cell
        t.redo(SELF_REF, base);
        assert_eq!(buf[0].load(Ordering::SeqCst), 2);

        // nor may it clobber a later unrelated write
        buf[0].store(77, Ordering::SeqCst);
        t.redo(SELF_REF, base);
        assert_eq!(buf[0].load(Ordering::SeqCst), 77);
    }

    #[test]
    fn test_undo_idempotent() {
        let buf = [AtomicU64::new(SELF_REF)];
        let t = target_at(0, 1, 2);
        let base = base_of(&buf);

        t.undo(SELF_REF, base);
        assert_eq!(buf[0].load(Ordering::SeqCst), 1);

        t.undo(SELF_REF, base);
        assert_eq!(buf[0].load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recover_rolls_forward() {
        let buf = [AtomicU64::new(SELF_REF)];
        let t = target_at(0, 1, 2);

        t.recover(true, SELF_REF, base_of(&buf));
        assert_eq!(buf[0].load(Ordering::SeqCst), 2);

        // recovery twice is the identity on the final payload
        t.recover(true, SELF_REF, base_of(&buf));
        assert_eq!(buf[0].load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_recover_rolls_back() {
        let buf = [AtomicU64::new(SELF_REF)];
        let t = target_at(0, 1, 2);

        t.recover(false, SELF_REF, base_of(&buf));
        assert_eq!(buf[0].load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recover_leaves_stable_cell_alone() {
        let buf = [AtomicU64::new(42)];
        let t = target_at(0, 1, 2);

        t.recover(true, SELF_REF, base_of(&buf));
        assert_eq!(buf[0].load(Ordering::SeqCst), 42);
    }

    #[cfg(feature = "dirty-flag")]
    #[test]
    fn test_recover_clears_orphaned_dirty_bit() {
        let buf = [AtomicU64::new(field::with_dirty(2))];
        let t = target_at(0, 1, 2);

        t.recover(true, SELF_REF, base_of(&buf));
        assert_eq!(buf[0].load(Ordering::SeqCst), 2);
    }
}
