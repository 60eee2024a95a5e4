//! Executable memory: the reserved cache region and the bump arenas
//! carved out of it.
//!
//! Every byte of translated code, every stub and every patch slot lives
//! inside one contiguous `mmap` reservation. That buys two properties the
//! rest of the translator depends on:
//!
//! - any cache byte can reach any other cache byte with a rel32
//!   displacement, so the mangler only has to worry about reachability of
//!   *native* addresses, and
//! - "does this PC look like a cache address" is a pair of bound checks
//!   against the region before any speculative memory read happens.
//!
//! Arenas never free. The only concession is `free_last`, which rolls
//! back exactly the most recent allocation when a translation loses the
//! insert race on the global code cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::AppPc;

/// Total virtual reservation for all executable arenas.
const REGION_SIZE: usize = 256 << 20;

/// Slab handed to a bump arena when it runs dry.
const SLAB_SIZE: usize = 64 << 10;

/// Minimum alignment of every arena allocation. Patch slots rely on it.
pub const ARENA_ALIGN: usize = 8;

/// The process-wide executable reservation.
pub struct CacheRegion {
    base: u64,
    size: usize,
    cursor: AtomicUsize,
}

// SAFETY: the cursor is the only mutable state and it is atomic.
unsafe impl Sync for CacheRegion {}

static REGION: OnceLock<CacheRegion> = OnceLock::new();

impl CacheRegion {
    /// The singleton region, mapped on first use.
    pub fn get() -> &'static CacheRegion {
        REGION.get_or_init(|| {
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    REGION_SIZE,
                    libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                panic!(
                    "failed to reserve {} MiB executable region: {}",
                    REGION_SIZE >> 20,
                    std::io::Error::last_os_error()
                );
            }
            CacheRegion {
                base: ptr as u64,
                size: REGION_SIZE,
                cursor: AtomicUsize::new(0),
            }
        })
    }

    /// Inclusive lower bound of the region.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Exclusive upper bound of the region.
    pub fn end(&self) -> u64 {
        self.base + self.size as u64
    }

    /// True if `pc` points into the executable reservation.
    pub fn contains(&self, pc: AppPc) -> bool {
        pc >= self.base && pc < self.end()
    }

    /// Carve a fresh slab. Fatal when the reservation is exhausted.
    fn carve(&self, size: usize) -> u64 {
        let offset = self.cursor.fetch_add(size, Ordering::Relaxed);
        if offset + size > self.size {
            panic!("executable region exhausted ({} MiB)", self.size >> 20);
        }
        self.base + offset as u64
    }
}

/// Record of the most recent allocation, for `free_last`.
#[derive(Clone, Copy)]
struct LastAlloc {
    slab_base: u64,
    slab_len: usize,
    cursor: usize,
}

/// A bump allocator over region slabs. Single-owner: each CPU owns its
/// fragment and block arenas, the global stub arena wraps one of these in
/// a mutex.
pub struct BumpArena {
    slab_base: u64,
    slab_len: usize,
    cursor: usize,
    last: Option<LastAlloc>,
    /// Bytes handed out, for perf reporting.
    allocated: usize,
}

impl BumpArena {
    pub fn new() -> Self {
        BumpArena {
            slab_base: 0,
            slab_len: 0,
            cursor: 0,
            last: None,
            allocated: 0,
        }
    }

    fn align_cursor(&mut self) {
        self.cursor = (self.cursor + (ARENA_ALIGN - 1)) & !(ARENA_ALIGN - 1);
    }

    /// Address of the next allocation, assuming it fits the current slab.
    /// This is the mangler's reachability estimator; it is allowed to be
    /// off by at most one slab.
    pub fn stage(&mut self) -> AppPc {
        if self.slab_len == 0 {
            self.refill(SLAB_SIZE);
        }
        self.align_cursor();
        self.slab_base + self.cursor as u64
    }

    fn refill(&mut self, at_least: usize) {
        let size = at_least.max(SLAB_SIZE);
        self.slab_base = CacheRegion::get().carve(size);
        self.slab_len = size;
        self.cursor = 0;
    }

    /// Allocate `size` bytes, 8-aligned. The memory is readable,
    /// writable and executable; it is zero until written.
    pub fn alloc(&mut self, size: usize) -> AppPc {
        self.align_cursor();
        if self.cursor + size > self.slab_len {
            self.refill(size);
        }
        self.last = Some(LastAlloc {
            slab_base: self.slab_base,
            slab_len: self.slab_len,
            cursor: self.cursor,
        });
        let addr = self.slab_base + self.cursor as u64;
        self.cursor += size;
        self.allocated += size;
        addr
    }

    /// Roll back the most recent allocation. Used when a freshly built
    /// block loses the code-cache insert race.
    pub fn free_last(&mut self) {
        if let Some(last) = self.last.take() {
            self.slab_base = last.slab_base;
            self.slab_len = last.slab_len;
            self.cursor = last.cursor;
        }
    }

    /// Abandon the current slab so the next allocation starts a fresh
    /// one. Groups a functional unit's fragments together.
    pub fn begin_unit(&mut self) {
        self.slab_len = 0;
        self.cursor = 0;
        self.last = None;
    }

    /// Total bytes handed out by this arena.
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

impl Default for BumpArena {
    fn default() -> Self {
        Self::new()
    }
}

/// The shared stub arena. Allocations are reachable from every CPU and
/// are never freed; `free_last_if` undoes an allocation only when nothing
/// was allocated after it, which is checked under the same lock.
pub struct SharedArena {
    inner: parking_lot::Mutex<BumpArena>,
}

impl SharedArena {
    pub fn new() -> Self {
        SharedArena {
            inner: parking_lot::Mutex::new(BumpArena::new()),
        }
    }

    pub fn alloc(&self, size: usize) -> AppPc {
        self.inner.lock().alloc(size)
    }

    /// Allocate and copy `bytes` into the region.
    pub fn alloc_bytes(&self, bytes: &[u8]) -> AppPc {
        let addr = self.alloc(bytes.len());
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        addr
    }

    /// Undo `addr` if and only if it is still the most recent allocation.
    pub fn free_last_if(&self, addr: AppPc) {
        let mut arena = self.inner.lock();
        if let Some(last) = arena.last {
            if last.slab_base + last.cursor as u64 == addr {
                arena.free_last();
            }
        }
    }

    pub fn allocated(&self) -> usize {
        self.inner.lock().allocated()
    }
}

impl Default for SharedArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy `bytes` to `dest`, which must be arena-owned.
pub unsafe fn write_bytes(dest: AppPc, bytes: &[u8]) {
    debug_assert!(CacheRegion::get().contains(dest));
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest as *mut u8, bytes.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_aligned_and_in_region() {
        let mut arena = BumpArena::new();
        let a = arena.alloc(13);
        let b = arena.alloc(5);
        assert_eq!(a % ARENA_ALIGN as u64, 0);
        assert_eq!(b % ARENA_ALIGN as u64, 0);
        assert!(b >= a + 13);
        assert!(CacheRegion::get().contains(a));
        assert!(CacheRegion::get().contains(b));
    }

    #[test]
    fn free_last_rolls_back_one_allocation() {
        let mut arena = BumpArena::new();
        let _keep = arena.alloc(32);
        let lost = arena.alloc(64);
        arena.free_last();
        let again = arena.alloc(16);
        assert_eq!(lost, again);
    }

    #[test]
    fn stage_predicts_next_alloc() {
        let mut arena = BumpArena::new();
        let staged = arena.stage();
        let real = arena.alloc(24);
        assert_eq!(staged, real);
    }

    #[test]
    fn shared_arena_conditional_rollback() {
        let shared = SharedArena::new();
        let a = shared.alloc(16);
        let b = shared.alloc(16);
        // a is no longer the last allocation, rollback must refuse.
        shared.free_last_if(a);
        let c = shared.alloc(16);
        assert!(c > b);
        // b rollback is also stale now.
        shared.free_last_if(b);
        let d = shared.alloc(16);
        assert!(d > c);
        shared.free_last_if(d);
        let e = shared.alloc(16);
        assert_eq!(d, e);
    }
}
