//! Per-CPU and per-thread translator state.
//!
//! In kernel mode this state would be pinned to physical CPUs and
//! accessed with preemption disabled; the user-space rendition models a
//! CPU as an OS thread. `CpuState::with` hands out the equivalent of
//! the preemption-disabled handle: exclusive access to the calling
//! thread's arenas and private cache for the duration of the closure.

use std::cell::RefCell;
use std::sync::OnceLock;

use crate::alloc::{BumpArena, SharedArena};
use crate::config::Config;
use crate::table::{CpuCache, GlobalMap, IblTable};

/// State owned by one CPU: its code-cache arenas and the private mirror
/// of the global code cache.
pub struct CpuState {
    /// Executable arena for translated fragments and per-site stubs.
    pub fragment_allocator: BumpArena,
    /// Arena for basic-block metadata.
    pub block_allocator: BumpArena,
    /// Staging buffer for encoding; cleared on every translator entry.
    pub staging: Vec<u8>,
    /// CPU-private mirror of the global code cache.
    pub code_cache: CpuCache,
}

impl CpuState {
    fn new() -> Self {
        CpuState {
            fragment_allocator: BumpArena::new(),
            block_allocator: BumpArena::new(),
            staging: Vec::new(),
            code_cache: CpuCache::new(),
        }
    }

    /// Run `f` with exclusive access to this CPU's state.
    pub fn with<R>(f: impl FnOnce(&mut CpuState) -> R) -> R {
        CPU.with(|cell| f(&mut cell.borrow_mut()))
    }
}

thread_local! {
    static CPU: RefCell<CpuState> = RefCell::new(CpuState::new());
}

/// Per-thread translator state. A client extension point; the core keeps
/// nothing in it.
#[derive(Default)]
pub struct ThreadState;

impl ThreadState {
    pub fn with<R>(f: impl FnOnce(&mut ThreadState) -> R) -> R {
        THREAD.with(|cell| f(&mut cell.borrow_mut()))
    }
}

thread_local! {
    static THREAD: RefCell<ThreadState> = RefCell::new(ThreadState::default());
}

/// Notify the translator that this CPU is entering it from translated or
/// native code. Transient state from the previous entry dies here.
pub fn enter(cpu: &mut CpuState) {
    cpu.staging.clear();
}

/// Process-global translator state: the shared half of the two-tier code
/// cache, the IBL table the generated probes index, and the arena the
/// shared stubs live in. Constructed once, never reinitialised.
pub struct GlobalState {
    pub code_cache: GlobalMap,
    pub ibl_table: IblTable,
    pub stub_arena: SharedArena,
}

static GLOBAL: OnceLock<GlobalState> = OnceLock::new();

impl GlobalState {
    pub fn get() -> &'static GlobalState {
        GLOBAL.get_or_init(|| {
            let config = Config::get();
            GlobalState {
                code_cache: GlobalMap::new(config.lock_global_code_cache),
                ibl_table: IblTable::new(config.ibl_checks),
                stub_arena: SharedArena::new(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_state_is_per_thread() {
        CpuState::with(|cpu| {
            cpu.staging.push(7);
        });
        let other = std::thread::spawn(|| CpuState::with(|cpu| cpu.staging.len()))
            .join()
            .unwrap();
        assert_eq!(other, 0);
        CpuState::with(|cpu| assert_eq!(cpu.staging.len(), 1));
    }
}
