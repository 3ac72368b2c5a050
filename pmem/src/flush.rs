use std::sync::OnceLock;

/// Size of one CPU cache line in bytes.
pub const CACHE_LINE_SIZE: usize = 64;

/// Size of the internal read/write unit of PMEM devices (Intel Optane) in bytes.
pub const PMEM_LINE_SIZE: usize = 256;

/// Cache flush methods available on x86_64
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMethod {
    /// CLWB - Cache Line Write Back (preferred, non-evicting)
    Clwb,
    /// CLFLUSHOPT - Optimized Cache Line Flush (evicting, weakly ordered)
    ClflushOpt,
    /// CLFLUSH - Cache Line Flush (evicting, strongly ordered)
    Clflush,
}

static FLUSH_METHOD: OnceLock<FlushMethod> = OnceLock::new();

/// Detect the best available cache flush method using CPUID
pub fn detect_flush_method() -> FlushMethod {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::__cpuid;

        // Check for CLWB (CPUID.07H:EBX.CLWB[bit 24])
        let cpuid_7 = __cpuid(7);
        if (cpuid_7.ebx & (1 << 24)) != 0 {
            return FlushMethod::Clwb;
        }

        // Check for CLFLUSHOPT (CPUID.07H:EBX.CLFLUSHOPT[bit 23])
        if (cpuid_7.ebx & (1 << 23)) != 0 {
            return FlushMethod::ClflushOpt;
        }

        FlushMethod::Clflush
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        FlushMethod::Clflush
    }
}

/// Get the cached flush method, detecting it on first call
fn get_flush_method() -> FlushMethod {
    *FLUSH_METHOD.get_or_init(detect_flush_method)
}

/// Flush cache lines covering the specified address range.
///
/// Scheduling only: the write-back is not guaranteed durable until the next
/// [`drain`].
///
/// # Safety
///
/// The caller must ensure that `addr` points to a valid memory range of at least `len` bytes.
/// This function assumes the memory is mapped and accessible.
#[inline]
pub unsafe fn flush(addr: *const u8, len: usize) {
    if len == 0 {
        return;
    }

    #[cfg(target_arch = "x86_64")]
    {
        let method = get_flush_method();

        // Align start address down to the cache-line boundary
        let start = (addr as usize) & !(CACHE_LINE_SIZE - 1);
        let end = (addr as usize) + len;

        let mut current = start;
        while current < end {
            let line_addr = current as *const u8;

            match method {
                FlushMethod::Clwb => unsafe {
                    std::arch::asm!(
                        "clwb [{addr}]",
                        addr = in(reg) line_addr,
                        options(nostack)
                    );
                },
                FlushMethod::ClflushOpt => unsafe {
                    std::arch::asm!(
                        "clflushopt [{addr}]",
                        addr = in(reg) line_addr,
                        options(nostack)
                    );
                },
                FlushMethod::Clflush => unsafe {
                    std::arch::asm!(
                        "clflush [{addr}]",
                        addr = in(reg) line_addr,
                        options(nostack)
                    );
                },
            }

            current += CACHE_LINE_SIZE;
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        // No portable write-back instruction; keep the compiler from reordering
        // stores past the flush point. Durability is only claimed on x86_64.
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// Execute a store fence to ensure all previously flushed lines are durable
///
/// This should be called after `flush()` to ensure persistence.
#[inline]
pub fn drain() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::asm!("sfence", options(nostack));
    }

    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Flush cache lines and execute a store fence
///
/// This is a convenience function that combines `flush()` and `drain()`.
///
/// # Safety
///
/// The caller must ensure that `addr` points to a valid memory range of at least `len` bytes.
#[inline]
pub unsafe fn persist(addr: *const u8, len: usize) {
    unsafe {
        flush(addr, len);
    }
    drain();
}

/// Flush the cache lines holding `*obj`.
///
/// # Safety
///
/// `obj` must point into mapped memory.
#[inline]
pub unsafe fn flush_obj<T>(obj: *const T) {
    unsafe {
        flush(obj.cast::<u8>(), size_of::<T>());
    }
}

/// Persist `*obj` (flush its cache lines, then drain).
///
/// # Safety
///
/// `obj` must point into mapped memory.
#[inline]
pub unsafe fn persist_obj<T>(obj: *const T) {
    unsafe {
        persist(obj.cast::<u8>(), size_of::<T>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_is_stable() {
        let method1 = detect_flush_method();
        let method2 = get_flush_method();
        let method3 = get_flush_method();
        assert_eq!(method1, method2);
        assert_eq!(method2, method3);
    }

    #[test]
    fn test_flush_zero_length() {
        // Should not panic
        unsafe {
            flush(std::ptr::null(), 0);
        }
    }

    #[test]
    fn test_persist_basic() {
        let data = vec![0u8; 256];
        unsafe {
            std::ptr::write_volatile(data.as_ptr() as *mut u8, 42);
        }

        unsafe {
            persist(data.as_ptr(), data.len());
        }

        let value = unsafe { std::ptr::read_volatile(data.as_ptr()) };
        assert_eq!(value, 42);
    }

    #[test]
    fn test_flush_unaligned() {
        let data = vec![0u8; 256];
        let unaligned_ptr = unsafe { data.as_ptr().add(7) };

        unsafe {
            flush(unaligned_ptr, 100);
        }

        drain();
    }

    #[test]
    fn test_persist_obj() {
        let word = Box::new(0xDEAD_BEEFu64);
        unsafe {
            persist_obj(&*word as *const u64);
        }
        assert_eq!(*word, 0xDEAD_BEEF);
    }
}
