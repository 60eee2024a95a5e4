//! The watchpoints client end to end: tagged addresses are detected,
//! masked, and executed against the unwatched address; the carry flag
//! survives the instrumentation; watchers fire at the label points.

mod common;

use std::sync::{Arc, OnceLock};

use common::NativeFn;
use iced_x86::{Code, Instruction, MemoryOperand, Register};
use weft::instr::{Instr, InstrId, InstrList};
use weft::policy::Policy;
use weft::watchpoints::{tag_address, unwatched_address, WatchpointPass, Watcher};

fn watch_policy() -> Policy {
    static POLICY: OnceLock<Policy> = OnceLock::new();
    *POLICY.get_or_init(|| {
        weft::register_policy(Arc::new(WatchpointPass::new()))
    })
}

/// A watcher that bumps an in-cache counter cell at every watched
/// access. The counter lives in the stub arena so the inserted
/// increment can address it rip-relative.
struct CountingWatcher {
    cell: u64,
}

impl CountingWatcher {
    fn new() -> Self {
        let cell = weft::state::GlobalState::get().stub_arena.alloc(8);
        unsafe { (cell as *mut u64).write(0) };
        CountingWatcher { cell }
    }

    fn count(&self) -> u64 {
        unsafe { (self.cell as *const u64).read() }
    }

    fn bump(&self, ls: &mut InstrList, label: InstrId) {
        let mem = MemoryOperand::with_base_displ(Register::RIP, self.cell as i64);
        ls.insert_after(
            label,
            Instr::synth_mangled(Instruction::with1(Code::Inc_rm64, mem).unwrap()),
        );
    }
}

impl Watcher for CountingWatcher {
    fn visit_read(&self, ls: &mut InstrList, label: InstrId, _addr: Register) {
        self.bump(ls, label);
    }

    fn visit_write(&self, ls: &mut InstrList, label: InstrId, _addr: Register) {
        self.bump(ls, label);
    }
}

#[test]
fn tagged_store_is_masked_and_executes() {
    common::setup();
    // mov qword [rdi], 42; mov rax, [rdi]; ret
    let f = NativeFn::new(vec![
        0x48, 0xc7, 0x07, 0x2a, 0x00, 0x00, 0x00, // mov qword [rdi], 42
        0x48, 0x8b, 0x07, // mov rax, [rdi]
        0xc3, // ret
    ]);

    let cell = Box::new(0u64);
    let addr = &*cell as *const u64 as u64;
    let tagged = tag_address(addr, 5);
    assert_eq!(unwatched_address(tagged), addr);

    // Watched access: the store lands at the unwatched address.
    assert_eq!(f.call(watch_policy(), tagged), 42);
    assert_eq!(*cell, 42);

    // Unwatched access through the same translated block.
    let cell2 = Box::new(0u64);
    let addr2 = &*cell2 as *const u64 as u64;
    assert_eq!(f.call(watch_policy(), addr2), 42);
    assert_eq!(*cell2, 42);

    // The instrumented block carries the tag test and the masking
    // sequence: bt against the distinguishing bit, then the bswap pair.
    let entry = weft::translate(f.pc(), watch_policy().base());
    let text = common::disasm_cache(entry, 48);
    assert!(text.contains("bt "), "missing tag test:\n{text}");
    assert!(text.contains("bswap"), "missing mask sequence:\n{text}");
}

#[test]
fn carry_flag_survives_instrumentation() {
    common::setup();
    // xor eax, eax; stc; mov qword [rdi], 1; adc rax, 0; ret
    // Returns 1 exactly when CF still holds the pre-store value.
    let f = NativeFn::new(vec![
        0x31, 0xc0, // xor eax, eax
        0xf9, // stc
        0x48, 0xc7, 0x07, 0x01, 0x00, 0x00, 0x00, // mov qword [rdi], 1
        0x48, 0x83, 0xd0, 0x00, // adc rax, 0
        0xc3, // ret
    ]);

    let cell = Box::new(0u64);
    let tagged = tag_address(&*cell as *const u64 as u64, 1);
    assert_eq!(f.call(watch_policy(), tagged), 1);
    assert_eq!(*cell, 1);

    let cell2 = Box::new(0u64);
    assert_eq!(f.call(watch_policy(), &*cell2 as *const u64 as u64), 1);
}

#[test]
fn watcher_fires_only_on_watched_path() {
    common::setup();
    // mov qword [rdi], 7; ret
    let f = NativeFn::new(vec![
        0x48, 0xc7, 0x07, 0x07, 0x00, 0x00, 0x00, // mov qword [rdi], 7
        0xc3, // ret
    ]);

    let watcher = Arc::new(CountingWatcher::new());
    let policy = weft::register_policy(Arc::new(WatchpointPass::with_watcher(
        watcher.clone(),
    )));

    let cell = Box::new(0u64);
    let addr = &*cell as *const u64 as u64;

    assert_eq!(f.call(policy, addr), 7);
    assert_eq!(watcher.count(), 0, "unwatched access must skip the watcher");

    assert_eq!(f.call(policy, tag_address(addr, 2)), 7);
    assert_eq!(*cell, 7);
    assert_eq!(watcher.count(), 1, "watched access must hit the watcher");

    assert_eq!(f.call(policy, tag_address(addr, 2)), 7);
    assert_eq!(watcher.count(), 2);
}
