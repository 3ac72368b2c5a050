//! The descriptor pool: a persistent file (or devdax device) holding one
//! descriptor per thread slot plus an application data area.
//!
//! File layout:
//!
//! ```text
//! [ header, 256 B                    ]  magic/version/parameters, validated on reopen
//! [ descriptors, (MAX_THREADS+1)x256 ]  base realigned up to the PMEM line size;
//!                                       the spare slot absorbs the shift
//! [ data area                        ]  handed to the application
//! ```
//!
//! Opening an existing pool sweeps every descriptor through its recovery path
//! before any operation can run, so a crashed process's half-done operations
//! are rolled forward or back exactly once.

use crate::descriptor::{DESC_SIZE, Descriptor};
use crate::thread_id::{self, MAX_THREADS, ThreadIdError};
use crate::{PMWCAS_CAPACITY, field};
use pmem::{PMEM_LINE_SIZE, PmemRegion, Region};
use std::io;
use std::path::Path;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;

const POOL_MAGIC: u64 = u64::from_le_bytes(*b"PMWCAS1\0");
const POOL_VERSION: u32 = 1;
const FLAG_DIRTY_BIT: u32 = 1;
const HEADER_RESERVED: usize = 256;
const LAYOUT_NAME_LEN: usize = 32;

/// Default pool file size.
pub const DEFAULT_POOL_SIZE: usize = 8 << 20;

/// Error returned when a pool cannot be opened or closed.
#[derive(Debug)]
pub enum PoolError {
    /// The file could not be created, mapped, truncated, or synced.
    Io(io::Error),
    /// The file exists but was not created by a compatible build with the
    /// same layout name and parameters.
    LayoutMismatch,
    /// The descriptor base could not be realigned within the reserved slack.
    Alignment,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Io(e) => write!(f, "pool io error: {}", e),
            PoolError::LayoutMismatch => write!(f, "pool layout mismatch"),
            PoolError::Alignment => write!(f, "descriptor area cannot be aligned"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PoolError {
    fn from(e: io::Error) -> Self {
        PoolError::Io(e)
    }
}

/// Pool header stored in the first 256 bytes of the file.
#[repr(C)]
struct PoolHeader {
    magic: u64,
    version: u32,
    flags: u32,
    max_threads: u32,
    capacity: u32,
    file_len: u64,
    layout: [u8; LAYOUT_NAME_LEN],
    _reserved: [u8; 192],
}

const _: () = assert!(size_of::<PoolHeader>() == HEADER_RESERVED);

fn build_flags() -> u32 {
    if cfg!(feature = "dirty-flag") {
        FLAG_DIRTY_BIT
    } else {
        0
    }
}

/// A mapped descriptor pool.
///
/// Dropping the pool unmaps the file without resetting any descriptor: the
/// durable state must survive so the next open can recover it.
pub struct Pool {
    region: Region,
    descs: *mut Descriptor,
    data_off: usize,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Opens the pool at `path`, creating it with [`DEFAULT_POOL_SIZE`] when
    /// it does not exist. `layout` names the application layout and is
    /// checked against the stored header on reopen.
    pub fn open(path: &Path, layout: &str) -> Result<Self, PoolError> {
        Self::open_sized(path, layout, DEFAULT_POOL_SIZE)
    }

    /// Same as [`Pool::open`] with an explicit file size for creation.
    pub fn open_sized(path: &Path, layout: &str, pool_size: usize) -> Result<Self, PoolError> {
        if layout.len() > LAYOUT_NAME_LEN {
            return Err(PoolError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "layout name too long",
            )));
        }
        let min_size = HEADER_RESERVED + (MAX_THREADS + 1) * DESC_SIZE;
        let pool_size = pool_size.max(min_size);

        let exists = path.exists() && !path.metadata().map(|m| m.len() == 0).unwrap_or(true);
        let region = if exists {
            unsafe { Region::open(path)? }
        } else {
            unsafe { Region::create(path, pool_size)? }
        };
        if region.len() < min_size {
            return Err(PoolError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "pool file smaller than the descriptor area",
            )));
        }

        let base = region.as_ptr();

        // realign the descriptor base to the PMEM line; the spare (N+1)th
        // descriptor slot absorbs the shift
        let mut descs_off = HEADER_RESERVED;
        let misalign = (base as usize + descs_off) % PMEM_LINE_SIZE;
        if misalign != 0 {
            descs_off += PMEM_LINE_SIZE - misalign;
        }
        let area_end = HEADER_RESERVED + (MAX_THREADS + 1) * DESC_SIZE;
        if descs_off + MAX_THREADS * DESC_SIZE > area_end {
            return Err(PoolError::Alignment);
        }

        let magic = unsafe { (base as *const u64).read_volatile() };
        if magic != POOL_MAGIC {
            // an all-zero header is an unformatted pool; anything else is a
            // foreign file
            let raw = unsafe { std::slice::from_raw_parts(base as *const u8, HEADER_RESERVED) };
            if raw.iter().any(|&b| b != 0) {
                return Err(PoolError::LayoutMismatch);
            }

            unsafe {
                std::ptr::write_bytes(base.add(HEADER_RESERVED), 0, area_end - HEADER_RESERVED);
            }
            let header = unsafe { &mut *(base as *mut PoolHeader) };
            header.version = POOL_VERSION;
            header.flags = build_flags();
            header.max_threads = MAX_THREADS as u32;
            header.capacity = PMWCAS_CAPACITY as u32;
            header.file_len = region.len() as u64;
            header.layout[..layout.len()].copy_from_slice(layout.as_bytes());
            unsafe { pmem::persist(base, area_end) };
            // the magic goes last so a torn creation reads as unformatted
            header.magic = POOL_MAGIC;
            unsafe { pmem::persist_obj(&header.magic as *const u64) };
        } else {
            let header = unsafe { &*(base as *const PoolHeader) };
            let mut expected_layout = [0u8; LAYOUT_NAME_LEN];
            expected_layout[..layout.len()].copy_from_slice(layout.as_bytes());
            if header.version != POOL_VERSION
                || header.flags != build_flags()
                || header.max_threads != MAX_THREADS as u32
                || header.capacity != PMWCAS_CAPACITY as u32
                || header.file_len != region.len() as u64
                || header.layout != expected_layout
            {
                return Err(PoolError::LayoutMismatch);
            }
        }

        let pool = Pool {
            descs: unsafe { base.add(descs_off) } as *mut Descriptor,
            data_off: area_end,
            region,
        };

        // recovery sweep: roll every interrupted operation forward or back
        for i in 0..MAX_THREADS {
            let desc = unsafe { &*pool.descs.add(i) };
            desc.initialize(base, pool.region.len(), (descs_off + i * DESC_SIZE) as u64);
        }
        pmem::drain();

        register(&pool, descs_off);
        Ok(pool)
    }

    /// The calling thread's descriptor. The same thread always receives the
    /// same descriptor for as long as it lives.
    pub fn get(&self) -> Result<&Descriptor, ThreadIdError> {
        let tid = thread_id::get()?;
        Ok(unsafe { &*self.descs.add(tid) })
    }

    /// Start of the application data area.
    pub fn data_ptr(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().add(self.data_off) }
    }

    /// Size of the application data area in bytes.
    pub fn data_len(&self) -> usize {
        self.region.len() - self.data_off
    }

    /// Typed pointer to the start of the data area.
    ///
    /// # Panics
    ///
    /// Panics when `T` does not fit in the data area.
    pub fn root<T>(&self) -> *mut T {
        assert!(
            size_of::<T>() <= self.data_len(),
            "root object larger than the pool data area"
        );
        self.data_ptr() as *mut T
    }

    /// Syncs the mapping and closes the pool. Descriptor state is left
    /// untouched; the next open recovers anything in flight.
    pub fn close(self) -> Result<(), PoolError> {
        self.region.sync()?;
        Ok(())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        unregister(self);
        let _ = self.region.sync();
    }
}

/// One registered pool mapping, recorded so the free-function facade can
/// resolve an embedded descriptor offset against the mapping that contains
/// the cell. This mirrors the process-global pool table libpmemobj keeps for
/// `pmemobj_direct`.
#[derive(Clone, Copy)]
struct PoolCtx {
    base: usize,
    len: usize,
    descs_off: usize,
}

static REGISTRY: RwLock<Vec<PoolCtx>> = RwLock::new(Vec::new());

fn register(pool: &Pool, descs_off: usize) {
    let mut reg = REGISTRY.write().unwrap();
    reg.push(PoolCtx {
        base: pool.region.as_ptr() as usize,
        len: pool.region.len(),
        descs_off,
    });
}

fn unregister(pool: &Pool) {
    let base = pool.region.as_ptr() as usize;
    let mut reg = REGISTRY.write().unwrap();
    reg.retain(|c| c.base != base);
}

/// Attempts to complete the committed operation whose descriptor reference
/// (`off`, `epoch`) is embedded in `cell`. Returns `true` when the redo phase
/// was run on the operation's behalf; `false` when the descriptor could not
/// be resolved or has not committed (the caller then waits for the owner).
pub(crate) fn help_embedded(cell: &AtomicU64, off: u64, epoch: u8) -> bool {
    let addr = cell.as_ptr() as usize;
    let reg = REGISTRY.read().unwrap();
    let Some(ctx) = reg
        .iter()
        .find(|c| addr >= c.base && addr < c.base + c.len)
    else {
        return false;
    };

    let off = off as usize;
    if off < ctx.descs_off || (off - ctx.descs_off) % DESC_SIZE != 0 {
        return false;
    }
    if (off - ctx.descs_off) / DESC_SIZE >= MAX_THREADS {
        return false;
    }

    let desc = unsafe { &*((ctx.base + off) as *const Descriptor) };
    desc.help_redo(field::with_desc(off as u64, epoch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{STATUS_COMPLETED, STATUS_FAILED, STATUS_SUCCEEDED};
    use std::sync::atomic::Ordering;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        std::path::PathBuf::from(format!("/tmp/pmwcas_pool_{}_{}", name, std::process::id()))
    }

    fn words(pool: &Pool) -> *mut u64 {
        pool.data_ptr() as *mut u64
    }

    #[test]
    fn test_create_and_reopen() {
        let path = tmp_path("create_reopen");

        {
            let pool = Pool::open(&path, "test").unwrap();
            assert!(pool.data_len() > 0);
            unsafe { words(&pool).write_volatile(123) };
            unsafe { pmem::persist(pool.data_ptr(), 8) };
            pool.close().unwrap();
        }
        {
            let pool = Pool::open(&path, "test").unwrap();
            assert_eq!(unsafe { words(&pool).read_volatile() }, 123);
        }

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let path = tmp_path("layout_mismatch");

        {
            let _pool = Pool::open(&path, "layout_a").unwrap();
        }
        match Pool::open(&path, "layout_b") {
            Err(PoolError::LayoutMismatch) => {}
            other => panic!("expected LayoutMismatch, got {:?}", other.map(|_| ())),
        }

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_foreign_file_rejected() {
        let path = tmp_path("foreign");
        std::fs::write(&path, vec![0xABu8; DEFAULT_POOL_SIZE]).unwrap();

        match Pool::open(&path, "test") {
            Err(PoolError::LayoutMismatch) => {}
            other => panic!("expected LayoutMismatch, got {:?}", other.map(|_| ())),
        }

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_descriptor_area_aligned() {
        let path = tmp_path("aligned");

        let pool = Pool::open(&path, "test").unwrap();
        assert_eq!(pool.descs as usize % PMEM_LINE_SIZE, 0);

        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_same_thread_same_descriptor() {
        let path = tmp_path("same_desc");

        let pool = Pool::open(&path, "test").unwrap();
        let a = pool.get().unwrap() as *const Descriptor;
        let b = pool.get().unwrap() as *const Descriptor;
        assert_eq!(a, b);

        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_distinct_threads_distinct_descriptors() {
        let path = tmp_path("distinct_desc");

        let pool = std::sync::Arc::new(Pool::open(&path, "test").unwrap());
        let mine = pool.get().unwrap() as *const Descriptor as usize;
        let theirs = {
            let pool = std::sync::Arc::clone(&pool);
            std::thread::spawn(move || pool.get().unwrap() as *const Descriptor as usize)
                .join()
                .unwrap()
        };
        assert_ne!(mine, theirs);

        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    /// Crash after install but before the verdict: reopen must roll back.
    #[test]
    fn test_recovery_rolls_back_undecided() {
        let path = tmp_path("recover_back");

        {
            let pool = Pool::open(&path, "test").unwrap();
            let w = words(&pool);
            unsafe {
                w.write_volatile(0);
                w.add(1).write_volatile(0);
                pmem::persist(w.cast(), 16);
            }

            let desc = pool.get().unwrap();
            unsafe {
                desc.add(w, 0u64, 1u64, Ordering::SeqCst).unwrap();
                desc.add(w.add(1), 0u64, 1u64, Ordering::SeqCst).unwrap();
            }
            assert!(desc.test_drive_to_install());

            let (status, count, self_ref) = desc.test_state();
            assert_eq!(status, STATUS_FAILED);
            assert_eq!(count, 2);
            assert_eq!(unsafe { w.read_volatile() }, self_ref);
            // simulated crash: the pool is dropped with the operation parked
        }
        {
            let pool = Pool::open(&path, "test").unwrap();
            let w = words(&pool);
            assert_eq!(unsafe { crate::pload(w, Ordering::SeqCst) }, 0u64);
            assert_eq!(unsafe { crate::pload(w.add(1), Ordering::SeqCst) }, 0u64);

            let (status, count, _) = pool.get().unwrap().test_state();
            assert_eq!(status, STATUS_COMPLETED);
            assert_eq!(count, 0);
        }

        std::fs::remove_file(&path).unwrap();
    }

    /// Crash after the Succeeded verdict but before redo: reopen must roll
    /// forward.
    #[test]
    fn test_recovery_rolls_forward_succeeded() {
        let path = tmp_path("recover_forward");

        {
            let pool = Pool::open(&path, "test").unwrap();
            let w = words(&pool);
            unsafe {
                w.write_volatile(0);
                w.add(1).write_volatile(0);
                pmem::persist(w.cast(), 16);
            }

            let desc = pool.get().unwrap();
            unsafe {
                desc.add(w, 0u64, 1u64, Ordering::SeqCst).unwrap();
                desc.add(w.add(1), 0u64, 1u64, Ordering::SeqCst).unwrap();
            }
            assert!(desc.test_drive_to_install());
            desc.test_commit_verdict();

            let (status, ..) = desc.test_state();
            assert_eq!(status, STATUS_SUCCEEDED);
            // simulated crash
        }
        {
            let pool = Pool::open(&path, "test").unwrap();
            let w = words(&pool);
            assert_eq!(unsafe { crate::pload(w, Ordering::SeqCst) }, 1u64);
            assert_eq!(unsafe { crate::pload(w.add(1), Ordering::SeqCst) }, 1u64);
        }

        std::fs::remove_file(&path).unwrap();
    }

    /// A reader that finds a committed descriptor embedded in a cell drives
    /// the redo phase itself instead of returning the reference or the old
    /// value.
    #[test]
    fn test_pload_helps_committed_operation() {
        let path = tmp_path("help_redo");

        let pool = Pool::open(&path, "test").unwrap();
        let w = words(&pool);
        unsafe {
            w.write_volatile(10);
            w.add(1).write_volatile(20);
            pmem::persist(w.cast(), 16);
        }

        let desc = pool.get().unwrap();
        unsafe {
            desc.add(w, 10u64, 11u64, Ordering::SeqCst).unwrap();
            desc.add(w.add(1), 20u64, 21u64, Ordering::SeqCst).unwrap();
        }
        // park the owner between the verdict and the redo phase
        assert!(desc.test_drive_to_install());
        desc.test_commit_verdict();

        // a plain read must observe the post-image
        assert_eq!(unsafe { crate::pload(w, Ordering::SeqCst) }, 11u64);
        assert_eq!(unsafe { crate::pload(w.add(1), Ordering::SeqCst) }, 21u64);

        // the owner's own redo afterwards is a no-op
        desc.test_finish();
        assert_eq!(unsafe { crate::pload(w, Ordering::SeqCst) }, 11u64);
        assert_eq!(unsafe { crate::pload(w.add(1), Ordering::SeqCst) }, 21u64);

        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }

    /// The epoch in a descriptor reference changes once the descriptor is
    /// recycled, so stale references cannot be mistaken for live ones.
    #[test]
    fn test_epoch_advances_across_operations() {
        let path = tmp_path("epoch");

        let pool = Pool::open(&path, "test").unwrap();
        let w = words(&pool);
        unsafe {
            w.write_volatile(0);
            pmem::persist(w.cast(), 8);
        }

        let desc = pool.get().unwrap();
        let (.., ref_before) = desc.test_state();
        unsafe { desc.add(w, 0u64, 1u64, Ordering::SeqCst).unwrap() };
        assert!(desc.pmwcas());
        let (.., ref_after) = desc.test_state();

        assert_ne!(ref_before, ref_after);
        assert_eq!(
            ref_before & !field::EPOCH_MASK,
            ref_after & !field::EPOCH_MASK
        );

        drop(pool);
        std::fs::remove_file(&path).unwrap();
    }
}
