//! Lock-free persistent compare-and-swap primitives over PMEM.
//!
//! Two operations are provided over 8-byte words living in a mapped
//! persistent-memory pool:
//!
//! - [`pcas`]: a persistent single-word CAS whose new value is durable before
//!   the call returns
//! - [`Descriptor::pmwcas`]: a persistent multi-word CAS of up to
//!   [`PMWCAS_CAPACITY`] words, linearizable and crash-consistent
//!
//! Both rely on the top two bits of every target word being reserved: bit 63
//! marks a value that has been written but not yet persisted, bit 62 marks an
//! embedded descriptor reference. Readers go through [`pload`], which resolves
//! such intermediate words (cooperatively completing other threads'
//! committed operations where needed) and never returns them.
//!
//! After a crash, reopening the pool ([`Pool::open`]) rolls every interrupted
//! multi-word operation forward or back before any new operation can run;
//! each target word then reads as either its full pre-image or its full
//! post-image, never a torn intermediate.
//!
//! ```no_run
//! use std::sync::atomic::Ordering;
//!
//! let pool = pmwcas::Pool::open("/mnt/pmem/pool".as_ref(), "example").unwrap();
//! let words = pool.root::<[u64; 2]>() as *mut u64;
//!
//! let desc = pool.get().unwrap();
//! unsafe {
//!     desc.add(words, 0u64, 1u64, Ordering::SeqCst).unwrap();
//!     desc.add(words.add(1), 0u64, 1u64, Ordering::SeqCst).unwrap();
//! }
//! assert!(desc.pmwcas());
//! assert_eq!(unsafe { pmwcas::pload(words, Ordering::SeqCst) }, 1);
//! ```

mod descriptor;
mod field;
mod pool;
mod target;
mod thread_id;
mod word;

use std::sync::atomic::{AtomicU64, Ordering};

pub use descriptor::{AddError, Descriptor};
pub use field::{DESC_FLAG, DIRTY_FLAG, INTERMEDIATE};
pub use pool::{DEFAULT_POOL_SIZE, Pool, PoolError};
pub use thread_id::{MAX_THREADS, ThreadIdError};

/// Maximum number of target words per multi-word operation.
pub const PMWCAS_CAPACITY: usize = 6;

/// Bound on pause-loop iterations before backing off.
pub const SPINLOCK_RETRY_NUM: usize = 10;

/// Sleep length on contention, in microseconds.
pub const BACKOFF_TIME_US: u64 = 10;

pub(crate) const WORD_SIZE: usize = 8;

/// Types that may occupy a PCAS/PMwCAS target word.
///
/// # Safety
///
/// Implementors must be 8-byte trivially-copyable values whose conversion
/// round-trips (`from_word(x.into_word()) == x`) and which guarantee that the
/// top two bits of every converted word are zero. The crate reserves those
/// bits; a payload carrying them is rejected at [`Descriptor::add`] time and
/// breaks the word protocol everywhere else.
pub unsafe trait PcasWord: Copy {
    fn into_word(self) -> u64;

    /// # Safety
    ///
    /// `word` must originate from [`PcasWord::into_word`] of the same type.
    unsafe fn from_word(word: u64) -> Self;
}

unsafe impl PcasWord for u64 {
    #[inline]
    fn into_word(self) -> u64 {
        self
    }

    #[inline]
    unsafe fn from_word(word: u64) -> Self {
        word
    }
}

unsafe impl<T> PcasWord for *mut T {
    #[inline]
    fn into_word(self) -> u64 {
        self as u64
    }

    #[inline]
    unsafe fn from_word(word: u64) -> Self {
        word as usize as *mut T
    }
}

unsafe impl<T> PcasWord for *const T {
    #[inline]
    fn into_word(self) -> u64 {
        self as u64
    }

    #[inline]
    unsafe fn from_word(word: u64) -> Self {
        word as usize as *const T
    }
}

/// Reads the stable value of a target word.
///
/// Intermediate words are resolved first: dirty words are persisted and
/// cleaned, embedded committed operations are helped to completion. The
/// returned value never has the reserved bits set.
///
/// # Safety
///
/// `addr` must point to an 8-byte-aligned word that is only mutated through
/// the operations of this crate.
pub unsafe fn pload<T: PcasWord>(addr: *mut T, order: Ordering) -> T {
    let cell = unsafe { &*(addr as *const AtomicU64) };
    unsafe { T::from_word(word::pload_word(cell, order)) }
}

/// Persistent single-word CAS.
///
/// On success the desired value is durable before the call returns. On
/// failure `expected` is updated with the current (resolved, stable) value.
///
/// # Safety
///
/// Same contract as [`pload`].
pub unsafe fn pcas<T: PcasWord>(
    addr: *mut T,
    expected: &mut T,
    desired: T,
    success: Ordering,
    failure: Ordering,
) -> bool {
    let cell = unsafe { &*(addr as *const AtomicU64) };
    let mut expected_word = (*expected).into_word();
    let ok = word::pcas_word(cell, &mut expected_word, desired.into_word(), success, failure);
    if !ok {
        *expected = unsafe { T::from_word(expected_word) };
    }
    ok
}

/// [`pcas`] with one ordering for both outcomes, weakening the failure side
/// the way `compare_exchange` callers usually want.
///
/// # Safety
///
/// Same contract as [`pload`].
pub unsafe fn pcas_ordered<T: PcasWord>(
    addr: *mut T,
    expected: &mut T,
    desired: T,
    order: Ordering,
) -> bool {
    let failure = match order {
        Ordering::AcqRel => Ordering::Acquire,
        Ordering::Release => Ordering::Relaxed,
        other => other,
    };
    unsafe { pcas(addr, expected, desired, order, failure) }
}
