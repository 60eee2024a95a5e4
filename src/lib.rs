//! weft: a dynamic binary translator for x86-64.
//!
//! Native code is translated lazily, one basic block at a time, into an
//! instrumented copy held in an executable code cache. Every control
//! transfer in translated code is rewritten so execution re-enters the
//! translator instead of escaping to native code: direct branches
//! hot-patch themselves on first execution (DBL), indirect branches and
//! returns look their targets up through a generated fast path (IBL).
//! Client passes instrument each block between decode and mangling; the
//! watchpoints pass is the built-in client.
//!
//! ```no_run
//! let policy = weft::register_policy(std::sync::Arc::new(
//!     weft::watchpoints::WatchpointPass::new(),
//! ));
//! weft::init();
//! let translated = weft::translate(0x40_1000, policy);
//! ```

pub mod alloc;
pub mod block;
pub mod cache;
pub mod config;
pub mod detach;
pub mod host;
pub mod init;
pub mod instr;
pub mod mangle;
pub mod perf;
pub mod policy;
pub mod register;
pub mod state;
pub mod stub;
pub mod table;
pub mod watchpoints;

use std::sync::{Arc, OnceLock, RwLock};

use block::BasicBlockState;
use instr::InstrList;
use policy::{MangledAddress, Policy};
use state::{CpuState, ThreadState};

/// A program counter: native application code or translated cache code.
pub type AppPc = u64;

/// The System V user-mode redzone stubs must preserve.
pub const REDZONE_SIZE: i32 = 128;

/// Every call in translated code is placed so its return address lies
/// this many bytes past the owning block's header magic. Must be a
/// multiple of 8 and large enough to hold a rel32 call.
pub const RETURN_ADDRESS_OFFSET: usize = 8;

/// Alignment (and size) of a hot-patchable slot; aligned 8-byte stores
/// are atomic on x86-64.
pub const HOTPATCH_ALIGN: usize = 8;

/// Magic word at `block_start - RETURN_ADDRESS_OFFSET` of every
/// translated block, used to recognise cache addresses by inspection.
pub const BLOCK_HEADER_MAGIC: u32 = 0x5446_4557; // "WEFT"

/// A client instrumentation pass, invoked once per fresh block after
/// decoding and before mangling. The pass may add, remove and reorder
/// instructions and mark them mangled; it must not touch the code cache.
pub trait InstrumentationPass: Send + Sync {
    fn instrument(&self, cpu: &mut CpuState, bb: &mut BasicBlockState, ls: &mut InstrList);
}

static PASSES: OnceLock<RwLock<Vec<Arc<dyn InstrumentationPass>>>> = OnceLock::new();

fn passes() -> &'static RwLock<Vec<Arc<dyn InstrumentationPass>>> {
    PASSES.get_or_init(|| RwLock::new(Vec::new()))
}

/// Register an instrumentation pass and mint the policy that selects
/// it. Policy id 0 is reserved for the uninstrumented null policy.
pub fn register_policy(pass: Arc<dyn InstrumentationPass>) -> Policy {
    let mut registry = passes().write().unwrap();
    registry.push(pass);
    assert!(registry.len() < 0xff, "policy identities exhausted");
    Policy::new(registry.len() as u8)
}

pub(crate) fn run_client_pass(
    policy: Policy,
    cpu: &mut CpuState,
    bb: &mut BasicBlockState,
    ls: &mut InstrList,
) {
    let id = policy.id();
    if id == 0 {
        return;
    }
    let pass = passes()
        .read()
        .unwrap()
        .get(id as usize - 1)
        .cloned()
        .unwrap_or_else(|| panic!("no instrumentation pass registered for policy {id}"));
    pass.instrument(cpu, bb, ls);
}

/// Initialise the translator. Idempotent; implied by the lookup entry
/// points, but calling it up front keeps first-translation latency out
/// of the hot path.
pub fn init() {
    init::run();
}

/// Freeze an explicit configuration and initialise.
pub fn init_with(config: config::Config) {
    config::Config::freeze(config);
    init::run();
}

/// Translate (or look up) the block at `native_pc` under `policy` and
/// return the translated entry PC.
pub fn translate(native_pc: AppPc, policy: Policy) -> AppPc {
    init::run();
    CpuState::with(|cpu| {
        state::enter(cpu);
        ThreadState::with(|thread| {
            cache::find(cpu, thread, MangledAddress::new(native_pc, policy))
        })
    })
}

/// Translate the block at `native_pc` and run it through the attach
/// thunk, forwarding one integer argument.
///
/// # Safety
///
/// `native_pc` must point at machine code that follows the C ABI for
/// one integer argument, and everything that code transitively reaches
/// must be safe to execute under translation.
pub unsafe fn translate_and_call(native_pc: AppPc, policy: Policy, arg: u64) -> u64 {
    init::run();
    let bb = CpuState::with(|cpu| {
        state::enter(cpu);
        ThreadState::with(|thread| {
            let translated = cache::find(cpu, thread, MangledAddress::new(native_pc, policy));
            block::BasicBlock {
                cache_pc_start: translated,
                native_pc,
                mangled: MangledAddress::new(native_pc, policy),
            }
        })
    });
    bb.call(arg)
}
