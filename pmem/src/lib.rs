//! Persistent-memory regions and persist primitives.
//!
//! Two region backends are provided:
//! - [`FileRegion`]: a file on an fsdax (or ordinary) filesystem, mapped with
//!   `MAP_SYNC` when the filesystem supports it and `msync` fallback when not
//! - [`DevDaxRegion`]: a `/dev/daxN.M` character device
//!
//! Durability is reached through explicit [`flush`]/[`drain`] (CLWB/SFENCE on
//! x86_64); plain stores to a region are never assumed durable.

mod devdax;
mod file;
mod flush;

use std::io;
use std::path::Path;

#[allow(clippy::len_without_is_empty)]
pub trait PmemRegion {
    /// Raw pointer to the start of the region
    fn as_ptr(&self) -> *mut u8;
    /// Size of the region in bytes
    fn len(&self) -> usize;
}

impl PmemRegion for devdax::DevDaxRegion {
    fn as_ptr(&self) -> *mut u8 {
        devdax::DevDaxRegion::as_ptr(self)
    }

    fn len(&self) -> usize {
        devdax::DevDaxRegion::len(self)
    }
}

impl PmemRegion for file::FileRegion {
    fn as_ptr(&self) -> *mut u8 {
        file::FileRegion::as_ptr(self)
    }

    fn len(&self) -> usize {
        file::FileRegion::len(self)
    }
}

/// A region of either backend, chosen from the path: character devices map as
/// devdax, everything else as a file region.
pub enum Region {
    File(file::FileRegion),
    DevDax(devdax::DevDaxRegion),
}

impl Region {
    /// Creates (or, for devdax devices, opens) a region of at least `len`
    /// bytes at `path`.
    ///
    /// # Safety
    ///
    /// Same contracts as [`FileRegion::create`] / [`DevDaxRegion::open`].
    pub unsafe fn create(path: &Path, len: usize) -> io::Result<Self> {
        if is_char_device(path) {
            let region = unsafe { devdax::DevDaxRegion::open(path)? };
            if region.len() < len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "devdax device smaller than the requested region",
                ));
            }
            Ok(Region::DevDax(region))
        } else {
            Ok(Region::File(unsafe {
                file::FileRegion::create(path, len)?
            }))
        }
    }

    /// Opens an existing region at `path`.
    ///
    /// # Safety
    ///
    /// Same contracts as [`FileRegion::open`] / [`DevDaxRegion::open`].
    pub unsafe fn open(path: &Path) -> io::Result<Self> {
        if is_char_device(path) {
            Ok(Region::DevDax(unsafe { devdax::DevDaxRegion::open(path)? }))
        } else {
            Ok(Region::File(unsafe { file::FileRegion::open(path)? }))
        }
    }

    /// Writes the mapping back to the medium where cache flushes alone do not
    /// reach it (non-DAX file mappings).
    pub fn sync(&self) -> io::Result<()> {
        match self {
            Region::File(r) => r.sync(),
            Region::DevDax(_) => Ok(()),
        }
    }
}

impl PmemRegion for Region {
    fn as_ptr(&self) -> *mut u8 {
        match self {
            Region::File(r) => r.as_ptr(),
            Region::DevDax(r) => r.as_ptr(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Region::File(r) => r.len(),
            Region::DevDax(r) => r.len(),
        }
    }
}

fn is_char_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path)
        .map(|m| m.file_type().is_char_device())
        .unwrap_or(false)
}

pub use devdax::DevDaxRegion;
pub use file::FileRegion;
pub use flush::{
    CACHE_LINE_SIZE, FlushMethod, PMEM_LINE_SIZE, detect_flush_method, drain, flush, flush_obj,
    persist, persist_obj,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_create_reopen() {
        let pid = std::process::id();
        let path = format!("/tmp/pmem_region_{}", pid);
        let path = Path::new(&path);

        unsafe {
            let region = Region::create(path, 16384).expect("create failed");
            assert!(matches!(region, Region::File(_)));
            assert_eq!(region.len(), 16384);

            std::ptr::write_volatile(region.as_ptr() as *mut u64, 7);
            persist(region.as_ptr(), 8);
            region.sync().unwrap();
            drop(region);

            let region = Region::open(path).expect("open failed");
            assert_eq!(std::ptr::read_volatile(region.as_ptr() as *const u64), 7);
        }

        std::fs::remove_file(path).unwrap();
    }
}
