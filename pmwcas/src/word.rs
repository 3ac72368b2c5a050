//! Word engine: persistent load and single-word CAS over one tagged cell,
//! including the resolution of intermediate (dirty or descriptor-bearing)
//! words.

use crate::field::{self, WordView};
use crate::pool;
use crate::{BACKOFF_TIME_US, SPINLOCK_RETRY_NUM, WORD_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

/// Drives `word` to a stable value, reloading from `cell` as needed.
///
/// Dirty words are first given a bounded spin (the writer is usually about to
/// clear the flag itself); if the writer stalls, the word is persisted on its
/// behalf and the flag cleared with a CAS. Descriptor-bearing words are
/// resolved by helping the owning operation forward when it has already
/// committed, and by waiting otherwise (see `descriptor.rs` for why roll-back
/// is never helped while the owner may be live).
pub(crate) fn resolve_intermediate(cell: &AtomicU64, word: &mut u64) {
    while field::is_intermediate(*word) {
        for _ in 0..SPINLOCK_RETRY_NUM {
            std::hint::spin_loop();
            *word = cell.load(Ordering::Acquire);
            if !field::is_intermediate(*word) {
                return;
            }
        }

        if let WordView::Embedded { off, epoch } = field::decode(*word) {
            if !pool::help_embedded(cell, off, epoch) {
                thread::sleep(Duration::from_micros(BACKOFF_TIME_US));
            }
            *word = cell.load(Ordering::Acquire);
            continue;
        }

        // dirty only: a writer stored but has not yet cleared the flag
        let orig = *word;
        thread::sleep(Duration::from_micros(BACKOFF_TIME_US));
        *word = cell.load(Ordering::Acquire);
        if !field::is_intermediate(*word) {
            return;
        }
        if field::is_desc(*word) || *word != orig {
            continue;
        }

        // the writer stalled; persist on its behalf and clear the flag
        unsafe { pmem::persist(cell.as_ptr().cast(), WORD_SIZE) };
        let clean = field::clear_flags(orig);
        if cell
            .compare_exchange(orig, clean, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            *word = clean;
            return;
        }
        *word = cell.load(Ordering::Acquire);
    }
}

/// Reads the stable payload of `cell`.
pub(crate) fn pload_word(cell: &AtomicU64, order: Ordering) -> u64 {
    let mut word = cell.load(order);
    if field::is_intermediate(word) {
        resolve_intermediate(cell, &mut word);
    }
    word
}

/// Persistent single-word CAS.
///
/// On success the desired value is durable before the function returns. On
/// failure `expected` holds the resolved (stable) current value.
pub(crate) fn pcas_word(
    cell: &AtomicU64,
    expected: &mut u64,
    desired: u64,
    success: Ordering,
    failure: Ordering,
) -> bool {
    debug_assert_eq!(*expected & field::INTERMEDIATE, 0);
    debug_assert_eq!(desired & field::INTERMEDIATE, 0);

    let orig = *expected;
    let (installed, install_order) = if cfg!(feature = "dirty-flag") {
        (field::with_dirty(desired), Ordering::Relaxed)
    } else {
        (desired, success)
    };

    loop {
        match cell.compare_exchange_weak(*expected, installed, install_order, failure) {
            Ok(_) => break,
            Err(current) => {
                *expected = current;
                if field::is_intermediate(current) {
                    resolve_intermediate(cell, expected);
                }
                if *expected != orig {
                    return false;
                }
            }
        }
    }

    unsafe { pmem::persist(cell.as_ptr().cast(), WORD_SIZE) };

    if cfg!(feature = "dirty-flag") {
        // a loss here just means another thread observed the write and
        // cleared the flag cooperatively
        let _ = cell.compare_exchange(installed, desired, success, Ordering::Relaxed);
    }
    true
}
