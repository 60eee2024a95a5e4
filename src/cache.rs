//! The two-tier code cache.
//!
//! Fingerprint in, translated PC out. `find_on_cpu` is the best-effort
//! CPU-private probe the IBL fast path calls; `find` is the full lookup
//! that translates on a miss and resolves insert races with
//! keep-previous-entry semantics, rolling back the loser's arena
//! allocations.

use crate::alloc::CacheRegion;
use crate::block::BasicBlock;
use crate::policy::MangledAddress;
use crate::state::{CpuState, GlobalState, ThreadState};
use crate::{detach, host, perf, stub, AppPc, BLOCK_HEADER_MAGIC, RETURN_ADDRESS_OFFSET};

/// Probe the CPU-private cache only. No insertion, no locks, no
/// translation.
pub fn find_on_cpu(cpu: &mut CpuState, addr: MangledAddress) -> Option<AppPc> {
    cpu.code_cache.find(addr.as_u64())
}

/// Seed a custom mapping into the global cache.
pub fn add(source: AppPc, dest: AppPc) {
    let _ = GlobalState::get().code_cache.store(source, dest);
}

/// Structural test for "this PC is already translated code": inside the
/// reserved region, on the return-address geometry, with the block
/// header magic where a block (or a call sentinel) would have put it.
/// The region check comes first so the header probe cannot fault.
pub fn is_code_cache_address(pc: AppPc) -> bool {
    let region = CacheRegion::get();
    if !region.contains(pc) || pc % 8 != RETURN_ADDRESS_OFFSET as u64 % 8 {
        return false;
    }
    let header = pc + 16 - RETURN_ADDRESS_OFFSET as u64;
    if !region.contains(header + 4) {
        return false;
    }
    unsafe { std::ptr::read_volatile(header as *const u32) == BLOCK_HEADER_MAGIC }
}

/// The full two-tier lookup. Returns the PC translated execution must
/// continue at; for indirect-CTI and return fingerprints that is an IBL
/// exit stub wrapping the translation.
pub fn find(cpu: &mut CpuState, thread: &mut ThreadState, addr: MangledAddress) -> AppPc {
    perf::visit_address_lookup();
    let global = GlobalState::get();
    let mut policy = addr.policy();
    let app_target = addr.unmangled();

    // Global probe under the full fingerprint.
    if let Some(translated) = global.code_cache.load(addr.as_u64()) {
        cpu.code_cache.store(addr.as_u64(), translated);
        perf::visit_address_lookup_hit();
        return translated;
    }

    // A copied return address, or any other route that lands a raw cache
    // PC here, needs no translation.
    let mut target: Option<AppPc> = None;
    if is_code_cache_address(app_target) {
        target = Some(app_target);
    }

    // Host-context resolution. In a kernel address space the host/app
    // boundary is known: a host target reached from outside host context
    // forces a detach, and the policy converts to the target's context.
    // Auto-instrumented lookups arrive with the host bit already set by
    // the mangler, so they translate instead. User space cannot place
    // the boundary; nothing is treated as host and control reaches
    // native code only through the detach table.
    let mut force_detach = false;
    if crate::config::Config::get().kernel_address_space {
        let host = host::is_host_address(app_target);
        if host {
            force_detach = !policy.is_in_host_context();
        }
        policy.set_in_host_context(host);
    } else {
        policy.set_in_host_context(false);
    }

    let base_policy = policy.base();
    let base_addr = MangledAddress::new(app_target, base_policy);

    // The property conversion may have produced a fingerprint that is
    // already translated.
    let mut base_exists = false;
    if target.is_none() && base_addr != addr {
        if let Some(translated) = global.code_cache.load(base_addr.as_u64()) {
            target = Some(translated);
            base_exists = true;
        }
    }

    // Approved escape to native code?
    if target.is_none() && policy.can_detach() {
        if let Some(detach_pc) = detach::find_detach_target(app_target) {
            perf::visit_detach();
            target = Some(detach_pc);
        }
    }
    if target.is_none() && force_detach {
        target = Some(app_target);
    }

    // Still unresolved: translate a fresh block under the base policy.
    let mut created = false;
    let mut target = match target {
        Some(t) => t,
        None => {
            if crate::config::Config::get().trace_allocate
                && addr.policy().begins_functional_unit()
            {
                cpu.fragment_allocator.begin_unit();
            }
            created = true;
            BasicBlock::translate(base_policy, cpu, thread, app_target).cache_pc_start
        }
    };

    // Publish under the base fingerprint. Exactly one translation wins;
    // a loser rolls its arena bumps back and adopts the winner.
    if !base_exists {
        match global.code_cache.store(base_addr.as_u64(), target) {
            Ok(()) => {}
            Err(winner) => {
                if created {
                    perf::visit_race_loss();
                    cpu.fragment_allocator.free_last();
                    cpu.block_allocator.free_last();
                    tracing::debug!(pc = app_target, "translation race lost");
                }
                target = winner;
            }
        }
    }
    cpu.code_cache.store(base_addr.as_u64(), target);

    // Reached through an indirect CTI or a return: the caller's stub
    // protocol needs an exit routine, published under the full
    // fingerprint with the same race discipline.
    let entry_policy = addr.policy();
    if entry_policy.is_indirect_cti_target() || entry_policy.is_return_target() {
        let exit = stub::ibl_exit_routine(target);
        let target = match global.code_cache.store(addr.as_u64(), exit) {
            Ok(()) => {
                global.ibl_table.insert(addr.as_u64(), exit);
                exit
            }
            Err(winner) => {
                global.stub_arena.free_last_if(exit);
                winner
            }
        };
        cpu.code_cache.store(addr.as_u64(), target);
        return target;
    }

    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::write_bytes;

    #[test]
    fn cache_address_check_requires_magic_and_geometry() {
        // Not in the region at all.
        assert!(!is_code_cache_address(0x40_0000));

        // In the region, aligned, magic present.
        let addr = crate::state::GlobalState::get().stub_arena.alloc(32);
        let ra = addr; // 8-aligned by the arena
        unsafe {
            write_bytes(ra + 8, &BLOCK_HEADER_MAGIC.to_le_bytes());
        }
        assert!(is_code_cache_address(ra));
        // Misaligned candidate fails before the memory probe.
        assert!(!is_code_cache_address(ra + 1));
        // Wrong magic.
        unsafe {
            write_bytes(ra + 8, &0u32.to_le_bytes());
        }
        assert!(!is_code_cache_address(ra));
    }
}
