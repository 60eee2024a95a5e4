//! The basic-block builder.
//!
//! Decodes a run of native instructions up to a terminator, hands the
//! list to the client pass and then the mangler, lays the block out in
//! the owning CPU's fragment arena and emits it through the staging
//! buffer. Block layout, low to high:
//!
//! ```text
//! [DBL stub code, 8-padded][magic u32 + pad][block code ...][sentinel]
//! ```
//!
//! The translated entry PC is the first code byte, so the header magic
//! sits at `entry - RETURN_ADDRESS_OFFSET`. A block terminated by a
//! call ends with the call slot and the fall-through link slot, and the
//! sentinel repeats the magic at the allocation boundary; that is what
//! makes `*(return_address + 16 - RETURN_ADDRESS_OFFSET)` recognise a
//! cache-resident return address before the neighbouring block exists.

use iced_x86::{Code, FlowControl, Instruction};

use crate::alloc::write_bytes;
use crate::instr::{encode_list, measure_list, Instr, InstrList};
use crate::mangle::Mangler;
use crate::policy::{MangledAddress, Policy};
use crate::state::{CpuState, ThreadState};
use crate::{perf, stub, AppPc, BLOCK_HEADER_MAGIC, RETURN_ADDRESS_OFFSET};

/// Per-block state handed to the client pass. Lives in the block arena
/// for the lifetime of the block.
#[repr(C)]
pub struct BasicBlockState {
    pub native_pc: AppPc,
    /// Client scratch slot.
    pub client: u64,
}

/// A translated basic block.
#[derive(Debug, Clone, Copy)]
pub struct BasicBlock {
    /// Entry PC of the translated code.
    pub cache_pc_start: AppPc,
    /// The native PC this block translates.
    pub native_pc: AppPc,
    /// Fingerprint the block was translated under.
    pub mangled: MangledAddress,
}

/// How decoding of a block stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminator {
    /// Unconditional transfer; nothing falls through.
    Closed,
    /// Conditional branch or size limit: execution can fall through to
    /// `next_pc`.
    FallsThrough(AppPc),
    /// A call: control comes back to `next_pc`, and the block must end
    /// on the call-return geometry.
    Call(AppPc),
    /// Trap-like instruction (int3, hlt, ud2): leave it in place.
    Trap,
}

impl BasicBlock {
    /// Decode, instrument, mangle and emit the block at `native_pc`
    /// under `policy`. The caller owns insertion into the code cache.
    pub fn translate(
        policy: Policy,
        cpu: &mut CpuState,
        thread: &mut ThreadState,
        native_pc: AppPc,
    ) -> BasicBlock {
        let _ = thread;
        perf::visit_translation();
        tracing::debug!(pc = native_pc, policy = policy.bits(), "translating block");

        let (mut ls, terminator) = decode_block(native_pc);
        normalize_terminator(&mut ls, terminator);

        // Client instrumentation sees the decoded view before mangling.
        let bb_state = alloc_block_state(cpu, native_pc);
        crate::run_client_pass(policy, cpu, unsafe { &mut *bb_state }, &mut ls);

        let mut stubs = InstrList::new();
        let mut mangler = Mangler::new(cpu, policy);
        mangler.mangle(&mut ls, &mut stubs);

        // Layout: measure both lists against the staged base, allocate
        // once, then encode into staging and copy.
        let stage = cpu.fragment_allocator.stage();
        let stub_layout = measure_list(&stubs, stage);
        let stub_size = (stub_layout.total + 7) & !7;
        let code_base_offset = stub_size + RETURN_ADDRESS_OFFSET;
        let code_layout = measure_list(&ls, stage + code_base_offset as u64);
        let call_terminated = matches!(terminator, Terminator::Call(_));
        let sentinel = if call_terminated {
            RETURN_ADDRESS_OFFSET
        } else {
            0
        };
        let total = code_base_offset + code_layout.total + sentinel;

        let base = cpu.fragment_allocator.alloc(total);
        let block_start = base + code_base_offset as u64;

        let mut labels = stub_layout.labels_at(base);
        labels.extend(code_layout.labels_at(block_start));

        let mut staging = std::mem::take(&mut cpu.staging);
        staging.clear();
        encode_list(&stubs, &stub_layout, base, &labels, &mut staging);
        staging.resize(stub_size, 0xcc);
        staging.extend_from_slice(&BLOCK_HEADER_MAGIC.to_le_bytes());
        staging.resize(code_base_offset, 0xcc);
        encode_list(&ls, &code_layout, block_start, &labels, &mut staging);
        if call_terminated {
            staging.extend_from_slice(&BLOCK_HEADER_MAGIC.to_le_bytes());
            staging.resize(total, 0xcc);
        }
        debug_assert_eq!(staging.len(), total);
        unsafe { write_bytes(base, &staging) };
        cpu.staging = staging;

        BasicBlock {
            cache_pc_start: block_start,
            native_pc,
            mangled: MangledAddress::new(native_pc, policy),
        }
    }

    /// Invoke the translated block from native code, forwarding one
    /// integer argument and returning RAX. The attach thunk's return
    /// site is a registered detach point, so the block's final return
    /// re-enters native code here.
    ///
    /// # Safety
    ///
    /// The block must translate code that follows the C ABI for one
    /// integer argument.
    pub unsafe fn call(&self, arg: u64) -> u64 {
        let (entry, _ret_site) = stub::attach_thunk();
        let thunk: extern "C" fn(u64, u64) -> u64 = std::mem::transmute(entry as *const ());
        thunk(self.cache_pc_start, arg)
    }
}

fn alloc_block_state(cpu: &mut CpuState, native_pc: AppPc) -> *mut BasicBlockState {
    let addr = cpu
        .block_allocator
        .alloc(std::mem::size_of::<BasicBlockState>());
    let ptr = addr as *mut BasicBlockState;
    unsafe {
        ptr.write(BasicBlockState {
            native_pc,
            client: 0,
        });
    }
    ptr
}

/// Decode instructions until a terminator or the size limit.
fn decode_block(native_pc: AppPc) -> (InstrList, Terminator) {
    let max = crate::config::Config::get().max_block_instructions;
    let mut ls = InstrList::new();
    let mut pc = native_pc;
    loop {
        let machine = crate::instr::decode_one(pc);
        let next_pc = pc + machine.len() as u64;
        ls.append(Instr::decoded(machine, pc));

        let term = match machine.flow_control() {
            FlowControl::UnconditionalBranch | FlowControl::IndirectBranch | FlowControl::Return => {
                Some(Terminator::Closed)
            }
            FlowControl::ConditionalBranch => Some(Terminator::FallsThrough(next_pc)),
            FlowControl::Call | FlowControl::IndirectCall => Some(Terminator::Call(next_pc)),
            FlowControl::Interrupt | FlowControl::Exception => Some(Terminator::Trap),
            _ if machine.mnemonic() == iced_x86::Mnemonic::Hlt => Some(Terminator::Trap),
            _ => None,
        };
        if let Some(term) = term {
            return (ls, term);
        }
        if ls.len() >= max {
            return (ls, Terminator::FallsThrough(next_pc));
        }
        pc = next_pc;
    }
}

/// Give the terminator a uniform shape for the mangler: conditional and
/// call terminators get an explicit fall-through link jump, and the
/// rel8-only conditionals are rewritten so every patchable slot can hold
/// a rel32 CTI.
fn normalize_terminator(ls: &mut InstrList, terminator: Terminator) {
    let last = match ls.last() {
        Some(id) => id,
        None => return,
    };
    match terminator {
        Terminator::Closed => {}
        Terminator::Trap => {
            ls.get_mut(last).set_mangled();
        }
        Terminator::FallsThrough(next_pc) | Terminator::Call(next_pc) => {
            let machine = *ls.get(last).machine();
            if is_rel8_only_branch(machine.code()) {
                // jrcxz/loop have no rel32 form. Branch locally instead:
                //   jcc taken; jmp fall; taken: jmp target
                let taken_pc = machine.near_branch_target();
                let taken = ls.new_label();
                {
                    let in_mut = ls.get_mut(last);
                    in_mut.target = Some(taken);
                    in_mut.set_mangled();
                }
                ls.append(Instr::synth(link_jmp(next_pc)));
                ls.append(Instr::label(taken));
                ls.append(Instr::synth(link_jmp(taken_pc)));
            } else {
                ls.append(Instr::synth(link_jmp(next_pc)));
            }
        }
    }
}

fn is_rel8_only_branch(code: Code) -> bool {
    // A conditional branch whose widened form is itself has no rel32
    // encoding.
    matches!(
        code.as_near_branch(),
        c if c == code && matches!(
            Instruction::with_branch(code, 0).map(|i| i.flow_control()),
            Ok(FlowControl::ConditionalBranch)
        )
    )
}

fn link_jmp(target: AppPc) -> Instruction {
    Instruction::with_branch(Code::Jmp_rel32_64, target).expect("link jmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel8_only_detection() {
        assert!(is_rel8_only_branch(Code::Jrcxz_rel8_64));
        assert!(is_rel8_only_branch(Code::Loop_rel8_64_RCX));
        assert!(!is_rel8_only_branch(Code::Je_rel8_64));
        assert!(!is_rel8_only_branch(Code::Jmp_rel8_64));
        assert!(!is_rel8_only_branch(Code::Jmp_rel32_64));
    }

    #[test]
    fn decode_stops_at_terminator() {
        // mov rax, 1; ret
        let code: &[u8] = &[0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00, 0xc3];
        let (ls, term) = decode_block(code.as_ptr() as u64);
        assert_eq!(ls.len(), 2);
        assert_eq!(term, Terminator::Closed);
    }

    #[test]
    fn decode_splits_at_conditional() {
        // test rax, rax; jz +2; ret
        let code: &[u8] = &[0x48, 0x85, 0xc0, 0x74, 0x02, 0xc3];
        let (ls, term) = decode_block(code.as_ptr() as u64);
        assert_eq!(ls.len(), 2);
        assert_eq!(term, Terminator::FallsThrough(code.as_ptr() as u64 + 5));
    }
}
