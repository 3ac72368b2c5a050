use nix::fcntl::{OFlag, open};
use nix::sys::mman::{MapFlags, MsFlags, ProtFlags, mmap, msync, munmap};
use nix::sys::stat::Mode;
use nix::unistd::{close, ftruncate};
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::ptr::NonNull;

/// A file-backed persistent memory region (fsdax or plain filesystem).
///
/// Mapping first tries `MAP_SHARED_VALIDATE | MAP_SYNC`, which on a DAX
/// filesystem makes CPU cache flushes sufficient for durability. On
/// filesystems without DAX support the kernel rejects `MAP_SYNC` and the
/// mapping falls back to `MAP_SHARED`; [`FileRegion::sync`] then provides the
/// durability point via `msync`.
pub struct FileRegion {
    ptr: NonNull<u8>,
    len: usize,
    fd: RawFd,
    dax: bool,
}

unsafe impl Send for FileRegion {}
unsafe impl Sync for FileRegion {}

impl FileRegion {
    /// Creates a new file-backed region of `len` bytes.
    ///
    /// The file is created if absent and truncated (extended with zeros) to
    /// `len`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - The path is valid and writable
    /// - No other process is accessing the file in an incompatible way
    pub unsafe fn create(path: &Path, len: usize) -> io::Result<Self> {
        let owned_fd = open(
            path,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let owned_fd = unsafe { OwnedFd::from_raw_fd(owned_fd) };

        if let Err(e) = ftruncate(&owned_fd, len as i64) {
            drop(owned_fd); // Close the fd before returning
            return Err(io::Error::from_raw_os_error(e as i32));
        }

        unsafe { Self::map(owned_fd, len) }
    }

    /// Opens an existing file-backed region; the length is taken from the
    /// file size.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - The file exists and is accessible
    /// - No other process is accessing the file in an incompatible way
    pub unsafe fn open(path: &Path) -> io::Result<Self> {
        let owned_fd = open(path, OFlag::O_RDWR, Mode::empty())
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let owned_fd = unsafe { OwnedFd::from_raw_fd(owned_fd) };

        let raw_fd = owned_fd.as_raw_fd();
        let mut stat_buf: libc::stat = unsafe { std::mem::zeroed() };
        let stat_result = unsafe { libc::fstat(raw_fd, &mut stat_buf) };
        if stat_result != 0 {
            let err = io::Error::last_os_error();
            drop(owned_fd);
            return Err(err);
        }
        let len = stat_buf.st_size as usize;

        unsafe { Self::map(owned_fd, len) }
    }

    unsafe fn map(owned_fd: OwnedFd, len: usize) -> io::Result<Self> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "length must be non-zero"))?;
        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;

        // MAP_SHARED_VALIDATE makes the kernel reject unknown flags, so a
        // failed MAP_SYNC is reported instead of silently ignored.
        let sync_flags = MapFlags::from_bits_truncate(libc::MAP_SHARED_VALIDATE)
            | MapFlags::from_bits_truncate(libc::MAP_SYNC);

        let (ptr, dax) = match unsafe { mmap(None, length, prot, sync_flags, &owned_fd, 0) } {
            Ok(p) => (p, true),
            Err(_) => {
                match unsafe { mmap(None, length, prot, MapFlags::MAP_SHARED, &owned_fd, 0) } {
                    Ok(p) => (p, false),
                    Err(e) => {
                        let err = io::Error::from_raw_os_error(e as i32);
                        drop(owned_fd); // Close the fd before returning
                        return Err(err);
                    }
                }
            }
        };

        let fd = owned_fd.into_raw_fd();

        Ok(Self {
            ptr: NonNull::new(ptr.as_ptr().cast::<u8>()).unwrap(),
            len,
            fd,
            dax,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping was established with `MAP_SYNC` (cache flushes
    /// alone reach the medium).
    pub fn is_dax(&self) -> bool {
        self.dax
    }

    /// Synchronously write the mapping back to the file.
    ///
    /// A no-op on DAX mappings; required on `MAP_SHARED` fallbacks before the
    /// region contents can be considered durable.
    pub fn sync(&self) -> io::Result<()> {
        if self.dax {
            return Ok(());
        }
        unsafe { msync(self.ptr.cast(), self.len, MsFlags::MS_SYNC) }
            .map_err(|e| io::Error::from_raw_os_error(e as i32))
    }
}

impl Drop for FileRegion {
    fn drop(&mut self) {
        unsafe {
            // Unmap the memory region
            let _ = munmap(self.ptr.cast(), self.len);
            // Close the file descriptor
            let _ = close(self.fd);
        }
    }
}
