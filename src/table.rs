//! The translator's hash tables.
//!
//! Three kinds, one file: the CPU-private mirror cache (single owner, no
//! locks), the global code cache (locked or lock-free variant, both with
//! keep-previous-entry insert semantics), and the IBL table whose entry
//! layout is ABI: generated stubs index it by byte offset, so the struct
//! layout below must never change shape.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Slot claimed by an in-flight insert. Never a valid mangled address:
/// real fingerprints carry a PC in their high 48 bits.
const CLAIMED: u64 = 1;

// ---------------------------------------------------------------------------
// CPU-private cache
// ---------------------------------------------------------------------------

/// Open-addressed map owned by one CPU. Grows by rehash; mirrors entries
/// of the global cache so the IBL fast path can avoid all sharing.
pub struct CpuCache {
    slots: Vec<(u64, u64)>,
    mask: usize,
    len: usize,
}

fn hash_fingerprint(key: u64) -> usize {
    // Fibonacci scramble; the low bits of a mangled address are policy
    // bits and poorly distributed.
    (key.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 17) as usize
}

impl CpuCache {
    pub fn new() -> Self {
        let cap = 1024;
        CpuCache {
            slots: vec![(0, 0); cap],
            mask: cap - 1,
            len: 0,
        }
    }

    pub fn find(&self, key: u64) -> Option<u64> {
        let mut i = hash_fingerprint(key) & self.mask;
        loop {
            let (k, v) = self.slots[i];
            if k == key {
                return Some(v);
            }
            if k == 0 {
                return None;
            }
            i = (i + 1) & self.mask;
        }
    }

    pub fn store(&mut self, key: u64, value: u64) {
        debug_assert!(key != 0);
        if self.len * 4 >= self.slots.len() * 3 {
            self.grow();
        }
        let mut i = hash_fingerprint(key) & self.mask;
        loop {
            let (k, _) = self.slots[i];
            if k == key {
                self.slots[i].1 = value;
                return;
            }
            if k == 0 {
                self.slots[i] = (key, value);
                self.len += 1;
                return;
            }
            i = (i + 1) & self.mask;
        }
    }

    fn grow(&mut self) {
        let old = std::mem::replace(&mut self.slots, vec![(0, 0); (self.mask + 1) * 2]);
        self.mask = self.slots.len() - 1;
        self.len = 0;
        for (k, v) in old {
            if k != 0 {
                self.store(k, v);
            }
        }
    }
}

impl Default for CpuCache {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global code cache
// ---------------------------------------------------------------------------

/// Lock-free fixed-capacity table. Readers never block; writers claim a
/// slot with a CAS, publish the value, then publish the key. On x86 the
/// ordered stores make a key hit imply a visible value.
struct RcuTable {
    slots: Box<[(AtomicU64, AtomicU64)]>,
    mask: usize,
}

impl RcuTable {
    fn with_capacity(cap: usize) -> Self {
        assert!(cap.is_power_of_two());
        let mut v = Vec::with_capacity(cap);
        v.resize_with(cap, || (AtomicU64::new(0), AtomicU64::new(0)));
        RcuTable {
            slots: v.into_boxed_slice(),
            mask: cap - 1,
        }
    }

    fn load(&self, key: u64) -> Option<u64> {
        let mut i = hash_fingerprint(key) & self.mask;
        let mut probes = 0;
        loop {
            let k = self.slots[i].0.load(Ordering::Acquire);
            if k == key {
                return Some(self.slots[i].1.load(Ordering::Acquire));
            }
            if k == 0 {
                return None;
            }
            probes += 1;
            if probes > self.mask {
                return None;
            }
            i = (i + 1) & self.mask;
        }
    }

    /// Keep-previous-entry store. Returns the winning value: the given
    /// one on success, the previous occupant's on a lost race.
    fn store(&self, key: u64, value: u64) -> Result<(), u64> {
        let mut i = hash_fingerprint(key) & self.mask;
        let mut probes = 0;
        loop {
            match self.slots[i]
                .0
                .compare_exchange(0, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.slots[i].1.store(value, Ordering::Release);
                    self.slots[i].0.store(key, Ordering::Release);
                    return Ok(());
                }
                Err(existing) => {
                    if existing == key {
                        return Err(self.slots[i].1.load(Ordering::Acquire));
                    }
                    // A claimed slot with a different eventual key, or a
                    // plain collision: move on. A claim for our own key
                    // resolves by the time the loser reloads.
                    if existing == CLAIMED {
                        let k = self.wait_key(i);
                        if k == key {
                            return Err(self.slots[i].1.load(Ordering::Acquire));
                        }
                    }
                }
            }
            probes += 1;
            if probes > self.mask {
                panic!("global code cache full");
            }
            i = (i + 1) & self.mask;
        }
    }

    fn wait_key(&self, i: usize) -> u64 {
        loop {
            let k = self.slots[i].0.load(Ordering::Acquire);
            if k != CLAIMED {
                return k;
            }
            std::hint::spin_loop();
        }
    }
}

/// The process-global fingerprint map. The locked variant trades the
/// lock-free reader path for unbounded capacity.
pub enum GlobalMap {
    Locked(Mutex<HashMap<u64, u64>>),
    Rcu(RcuTableHandle),
}

pub struct RcuTableHandle(RcuTable);

impl GlobalMap {
    pub fn new(locked: bool) -> Self {
        if locked {
            GlobalMap::Locked(Mutex::new(HashMap::new()))
        } else {
            GlobalMap::Rcu(RcuTableHandle(RcuTable::with_capacity(1 << 20)))
        }
    }

    pub fn load(&self, key: u64) -> Option<u64> {
        match self {
            GlobalMap::Locked(m) => m.lock().get(&key).copied(),
            GlobalMap::Rcu(t) => t.0.load(key),
        }
    }

    /// Insert with keep-previous-entry semantics. `Ok(())` means the
    /// given value is now the entry; `Err(winner)` reports a lost race
    /// and the value every reader will observe.
    pub fn store(&self, key: u64, value: u64) -> Result<(), u64> {
        match self {
            GlobalMap::Locked(m) => {
                let mut map = m.lock();
                match map.entry(key) {
                    std::collections::hash_map::Entry::Occupied(e) => Err(*e.get()),
                    std::collections::hash_map::Entry::Vacant(e) => {
                        e.insert(value);
                        Ok(())
                    }
                }
            }
            GlobalMap::Rcu(t) => t.0.store(key, value),
        }
    }
}

// ---------------------------------------------------------------------------
// IBL table
// ---------------------------------------------------------------------------

/// Buckets in the inline-probed table. The generated hash covers a
/// 16-bit byte offset at 16 bytes per entry.
pub const IBL_BUCKETS: usize = 4096;

/// One IBL table entry. Layout is ABI: generated stubs read the mangled
/// address at offset 0 and the translated PC at offset 8.
#[repr(C)]
pub struct IblEntry {
    pub mangled_address: AtomicU64,
    pub translated_pc: AtomicU64,
}

pub const IBL_ENTRY_SIZE: usize = 16;
pub const IBL_MANGLED_OFFSET: usize = 0;
pub const IBL_TRANSLATED_OFFSET: usize = 8;

/// The hash the stubs compute inline:
/// `byteswap16(rcr(low_byte, 4, CF=0) : second_byte) << 4`, truncated to
/// 16 bits. Operates on the unmangled target so the policy bits do not
/// collapse the distribution; returns a byte offset into the table.
pub fn ibl_hash(unmangled: u64) -> u32 {
    let al = (unmangled & 0xff) as u8;
    let ah = ((unmangled >> 8) & 0xff) as u8;
    // rcr al, 4 with carry clear: a 9-bit rotate where bit 8 is zero.
    let rotated = (al >> 4) | ((al & 0x07) << 5);
    let ax = ((rotated as u16) << 8) | ah as u16;
    ax.wrapping_shl(4) as u32
}

/// The global inline-probed table. Sized with a guard zone of
/// permanently empty entries past the last bucket so the unrolled probe
/// sequence never reads out of bounds.
pub struct IblTable {
    entries: Box<[IblEntry]>,
    checks: usize,
}

impl IblTable {
    pub fn new(checks: usize) -> Self {
        let mut v = Vec::with_capacity(IBL_BUCKETS + checks);
        v.resize_with(IBL_BUCKETS + checks, || IblEntry {
            mangled_address: AtomicU64::new(0),
            translated_pc: AtomicU64::new(0),
        });
        IblTable {
            entries: v.into_boxed_slice(),
            checks,
        }
    }

    /// Base address baked into generated probe sequences.
    pub fn base_address(&self) -> u64 {
        self.entries.as_ptr() as u64
    }

    fn bucket(&self, mangled: u64) -> usize {
        let unmangled = ((mangled as i64) >> crate::policy::NUM_MANGLED_BITS) as u64;
        (ibl_hash(unmangled) as usize) / IBL_ENTRY_SIZE
    }

    /// Publish a translation into the probe window. Gives up silently
    /// when the window is full; the slow path still resolves the target,
    /// the inline probes just stop helping for this fingerprint.
    pub fn insert(&self, mangled: u64, translated: u64) {
        debug_assert!(mangled > CLAIMED);
        let start = self.bucket(mangled);
        for i in 0..self.checks {
            let entry = &self.entries[start + i];
            match entry.mangled_address.compare_exchange(
                0,
                CLAIMED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    entry.translated_pc.store(translated, Ordering::Release);
                    entry.mangled_address.store(mangled, Ordering::Release);
                    return;
                }
                Err(existing) if existing == mangled => return,
                Err(_) => continue,
            }
        }
    }

    /// What the generated probe sequence would find.
    pub fn find(&self, mangled: u64) -> Option<u64> {
        let start = self.bucket(mangled);
        for i in 0..self.checks {
            let entry = &self.entries[start + i];
            let k = entry.mangled_address.load(Ordering::Acquire);
            if k == mangled {
                return Some(entry.translated_pc.load(Ordering::Acquire));
            }
            if k == 0 {
                return None;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn ibl_entry_layout_is_abi() {
        assert_eq!(std::mem::size_of::<IblEntry>(), IBL_ENTRY_SIZE);
        assert_eq!(offset_of!(IblEntry, mangled_address), IBL_MANGLED_OFFSET);
        assert_eq!(offset_of!(IblEntry, translated_pc), IBL_TRANSLATED_OFFSET);
    }

    #[test]
    fn ibl_hash_stays_in_table() {
        for x in [0u64, 1, 0xff, 0x1234, 0xdead_beef, u64::MAX] {
            let offset = ibl_hash(x) as usize;
            assert_eq!(offset % IBL_ENTRY_SIZE, 0);
            assert!(offset / IBL_ENTRY_SIZE < IBL_BUCKETS);
        }
    }

    #[test]
    fn ibl_hash_ignores_bits_above_sixteen() {
        // Only the low two bytes of the unmangled address participate.
        assert_eq!(ibl_hash(0x1234), ibl_hash(0xffff_0000_0000_1234));
    }

    #[test]
    fn ibl_insert_find_round_trip() {
        let table = IblTable::new(4);
        let mangled = 0x40_1000u64 << 16 | 3;
        table.insert(mangled, 0x7000_0000);
        assert_eq!(table.find(mangled), Some(0x7000_0000));
        assert_eq!(table.find(mangled + (1 << 16)), None);
    }

    #[test]
    fn ibl_window_overflow_gives_up() {
        let table = IblTable::new(2);
        // Same low 16 bits of PC, different policies: same bucket.
        let a = 0x40_1000u64 << 16 | 1;
        let b = 0x40_1000u64 << 16 | 2;
        let c = 0x40_1000u64 << 16 | 3;
        table.insert(a, 10);
        table.insert(b, 20);
        table.insert(c, 30);
        assert_eq!(table.find(a), Some(10));
        assert_eq!(table.find(b), Some(20));
        assert_eq!(table.find(c), None);
    }

    #[test]
    fn global_map_keeps_previous_entry() {
        for locked in [true, false] {
            let map = GlobalMap::new(locked);
            assert!(map.store(42, 100).is_ok());
            assert_eq!(map.store(42, 200), Err(100));
            assert_eq!(map.load(42), Some(100));
            assert_eq!(map.load(43), None);
        }
    }

    #[test]
    fn cpu_cache_grows() {
        let mut cache = CpuCache::new();
        for i in 1..=5000u64 {
            cache.store(i << 16, i);
        }
        for i in 1..=5000u64 {
            assert_eq!(cache.find(i << 16), Some(i));
        }
        assert_eq!(cache.find(999_999 << 16), None);
    }
}
