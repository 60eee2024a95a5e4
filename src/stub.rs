//! Generated stubs: direct-branch patching (DBL) and indirect-branch
//! lookup (IBL).
//!
//! Two kinds of generated code live here. Operand-shaped stubs (IBL
//! pre-entries, exit stubs, per-site DBL routines) are built as
//! instruction lists and encoded into an arena. The trampolines that
//! call back into Rust (the DBL patch templates, the IBL entry routine,
//! the attach thunk) are hand-written assembly leaves emitted with
//! `dynasm!`; their register and stack discipline is part of the
//! machine-context contract below and is spelled out instruction by
//! instruction.
//!
//! Everything here is emitted into the shared stub arena (or, for
//! per-site DBL routines, the owning CPU's fragment arena) and lives for
//! the rest of the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use dynasmrt::{dynasm, DynasmApi, DynasmLabelApi, VecAssembler};
use iced_x86::{Code, Instruction, MemoryOperand, OpKind, Register};
use parking_lot::Mutex;

use crate::alloc::{write_bytes, CacheRegion};
use crate::config::Config;
use crate::instr::{encode_list, measure_list, Instr, InstrList};
use crate::mangle::{
    lea_rsp, mov_imm64, mov_load, mov_reg, mov_store, pop_reg, push_reg, stage_8byte_hot_patch,
};
use crate::policy::{MangledAddress, Policy};
use crate::state::{CpuState, GlobalState, ThreadState};
use crate::table::{IBL_MANGLED_OFFSET, IBL_TRANSLATED_OFFSET};
use crate::{
    cache, detach, host, perf, state, AppPc, BLOCK_HEADER_MAGIC, REDZONE_SIZE,
    RETURN_ADDRESS_OFFSET,
};

type Asm = VecAssembler<dynasmrt::x64::X64Relocation>;

/// Which flavour of indirect transfer a pre-entry stub serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IblEntryKind {
    Call,
    Jmp,
    Return,
}

/// Shape of an indirect CTI's target operand, the cache key for
/// pre-entry stubs: two sites with the same policy and operand shape
/// share one stub.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum OperandKey {
    Reg(Register),
    Mem {
        base: Register,
        index: Register,
        scale: u32,
        displ: i64,
        segment: Register,
    },
    RipMem(u64),
}

impl OperandKey {
    fn of(machine: &Instruction) -> OperandKey {
        match machine.op0_kind() {
            OpKind::Register => OperandKey::Reg(machine.op0_register()),
            OpKind::Memory if machine.is_ip_rel_memory_operand() => {
                OperandKey::RipMem(machine.ip_rel_memory_address())
            }
            OpKind::Memory => OperandKey::Mem {
                base: machine.memory_base(),
                index: machine.memory_index(),
                scale: machine.memory_index_scale(),
                displ: machine.memory_displacement64() as i64,
                segment: machine.segment_prefix(),
            },
            other => panic!("unmanageable indirect CTI operand kind {other:?}"),
        }
    }
}

#[derive(PartialEq, Eq, Hash)]
struct PreEntryKey {
    policy: u16,
    kind: IblEntryKind,
    operand: OperandKey,
}

struct StubCaches {
    dbl_patch: Mutex<HashMap<(usize, bool), AppPc>>,
    ibl_pre: Mutex<HashMap<PreEntryKey, AppPc>>,
    ibl_entry: Mutex<HashMap<u16, AppPc>>,
    rbl: Mutex<HashMap<u16, AppPc>>,
}

static CACHES: OnceLock<StubCaches> = OnceLock::new();

fn caches() -> &'static StubCaches {
    CACHES.get_or_init(|| StubCaches {
        dbl_patch: Mutex::new(HashMap::new()),
        ibl_pre: Mutex::new(HashMap::new()),
        ibl_entry: Mutex::new(HashMap::new()),
        rbl: Mutex::new(HashMap::new()),
    })
}

/// Encode a finished instruction list into the shared stub arena.
fn encode_into_shared(ls: &InstrList) -> AppPc {
    let layout = measure_list(ls, CacheRegion::get().base());
    let addr = GlobalState::get().stub_arena.alloc(layout.total);
    let labels = layout.labels_at(addr);
    let mut out = Vec::with_capacity(layout.total);
    encode_list(ls, &layout, addr, &labels, &mut out);
    unsafe { write_bytes(addr, &out) };
    addr
}

/// Encode a finished instruction list into a CPU's fragment arena.
fn encode_into_fragment(cpu: &mut CpuState, ls: &InstrList) -> AppPc {
    let layout = measure_list(ls, cpu.fragment_allocator.stage());
    let addr = cpu.fragment_allocator.alloc(layout.total);
    let labels = layout.labels_at(addr);
    let mut out = Vec::with_capacity(layout.total);
    encode_list(ls, &layout, addr, &labels, &mut out);
    unsafe { write_bytes(addr, &out) };
    addr
}

fn rip_mem(addr: AppPc) -> MemoryOperand {
    MemoryOperand::with_base_displ(Register::RIP, addr as i64)
}

// ---------------------------------------------------------------------------
// Flag save/restore sequences shared by the generated stubs
// ---------------------------------------------------------------------------

/// Save flags onto the stack. The caller has already pushed the original
/// RAX; the arithmetic variant clobbers AH/AL and pushes the packed
/// word, the full variant pushes the flags register.
fn emit_save_flags(ls: &mut InstrList, all: bool) {
    if all {
        ls.append(Instr::synth_mangled(Instruction::with(Code::Pushfq)));
    } else {
        ls.append(Instr::synth_mangled(Instruction::with(Code::Lahf)));
        ls.append(Instr::synth_mangled(
            Instruction::with1(Code::Seto_rm8, Register::AL).expect("seto"),
        ));
        ls.append(Instr::synth_mangled(push_reg(Register::RAX)));
    }
}

/// Undo [`emit_save_flags`]. The arithmetic variant pops through RAX,
/// recovers OF from AL and the rest from AH.
fn emit_restore_flags(ls: &mut InstrList, all: bool) {
    if all {
        ls.append(Instr::synth_mangled(Instruction::with(Code::Popfq)));
    } else {
        ls.append(Instr::synth_mangled(pop_reg(Register::RAX)));
        ls.append(Instr::synth_mangled(
            Instruction::with2(Code::Add_rm8_imm8, Register::AL, 0x7fu32).expect("add al"),
        ));
        ls.append(Instr::synth_mangled(Instruction::with(Code::Sahf)));
    }
}

// ---------------------------------------------------------------------------
// IBL pre-entry
// ---------------------------------------------------------------------------

/// Build (or fetch) the pre-entry stub for one `(policy, operand shape)`
/// pair. The stub protects the redzone, saves the argument register,
/// loads and policy-mangles the target, probes the IBL table inline and
/// either jumps straight to the cached exit stub or falls through to the
/// entry routine.
pub fn ibl_pre_entry_routine(
    _cpu: &mut CpuState,
    target_policy: Policy,
    machine: &Instruction,
    kind: IblEntryKind,
) -> AppPc {
    let key = PreEntryKey {
        policy: target_policy.bits(),
        kind,
        operand: OperandKey::of(machine),
    };
    if let Some(&pc) = caches().ibl_pre.lock().get(&key) {
        return pc;
    }

    let config = Config::get();
    let global = GlobalState::get();

    // Optional per-callsite prediction entry, probed before the table.
    // Written once: the value slot is claimed with a CAS, then the key
    // published, so a matching key always implies a valid value.
    let pred = config
        .ibl_prediction
        .then(|| global.stub_arena.alloc(16));

    let mut ls = InstrList::new();

    // Stack shift. A return overlays the redzone on the return address
    // so that popping it later also releases the protected area.
    let shift = match kind {
        IblEntryKind::Return => REDZONE_SIZE - 8,
        _ => REDZONE_SIZE,
    };
    ls.append(Instr::synth_mangled(lea_rsp(-shift)));
    ls.append(Instr::synth_mangled(push_reg(Register::RDI)));
    let mut stack_offset = shift + 8;
    if kind == IblEntryKind::Call {
        // The call into this stub pushed its return address too.
        stack_offset += 8;
    }

    // Load the indirect target into RDI.
    match (&key.operand, kind) {
        (_, IblEntryKind::Return) => {
            ls.append(Instr::synth_mangled(mov_load(
                Register::RDI,
                MemoryOperand::with_base_displ(Register::RSP, REDZONE_SIZE as i64),
            )));
        }
        (OperandKey::Reg(reg), _) => {
            if *reg != Register::RDI {
                ls.append(Instr::synth_mangled(mov_reg(Register::RDI, *reg)));
            }
        }
        (OperandKey::RipMem(addr), _) => {
            if crate::mangle::is_far_away(CacheRegion::get().base(), *addr) {
                ls.append(Instr::synth_mangled(mov_imm64(Register::RDI, *addr)));
                ls.append(Instr::synth_mangled(mov_load(
                    Register::RDI,
                    MemoryOperand::with_base(Register::RDI),
                )));
            } else {
                ls.append(Instr::synth_mangled(mov_load(Register::RDI, rip_mem(*addr))));
            }
        }
        (
            OperandKey::Mem {
                base,
                index,
                scale,
                displ,
                segment,
            },
            _,
        ) => {
            let mut displ = *displ;
            if *base == Register::RSP {
                displ += stack_offset as i64;
            }
            let mem = MemoryOperand::new(*base, *index, *scale, displ, 1, false, *segment);
            ls.append(Instr::synth_mangled(mov_load(Register::RDI, mem)));
        }
    }

    // Spill RAX (the probe cursor) and save the app's flags.
    ls.append(Instr::synth_mangled(push_reg(Register::RAX)));
    emit_save_flags(&mut ls, config.ibl_save_all_flags);

    // Reproducible hash of the unmangled target; CF is cleared so the
    // rotate matches the Rust-side ibl_hash exactly.
    ls.append(Instr::synth_mangled(Instruction::with(Code::Clc)));
    ls.append(Instr::synth_mangled(mov_reg(Register::RAX, Register::RDI)));
    ls.append(Instr::synth_mangled(
        Instruction::with2(Code::Rcr_rm8_imm8, Register::AL, 4u32).expect("rcr"),
    ));
    ls.append(Instr::synth_mangled(
        Instruction::with2(Code::Xchg_rm8_r8, Register::AH, Register::AL).expect("xchg"),
    ));
    ls.append(Instr::synth_mangled(
        Instruction::with2(Code::Shl_rm16_imm8, Register::AX, 4u32).expect("shl ax"),
    ));
    ls.append(Instr::synth_mangled(
        Instruction::with2(Code::Movzx_r32_rm16, Register::EAX, Register::AX).expect("movzx"),
    ));

    // Mangle the target with the policy, after hashing so the policy
    // bits stay out of the bucket index.
    ls.append(Instr::synth_mangled(
        Instruction::with2(
            Code::Shl_rm64_imm8,
            Register::RDI,
            crate::policy::NUM_MANGLED_BITS,
        )
        .expect("shl rdi"),
    ));
    ls.append(Instr::synth_mangled(
        Instruction::with2(Code::Or_rm16_imm16, Register::DI, target_policy.bits() as u32)
            .expect("or di"),
    ));

    let hit = ls.new_label();
    let miss = ls.new_label();

    // Prediction probe: one compare against the last resolved target.
    if let Some(pred) = pred {
        let no_pred = ls.new_label();
        ls.append(Instr::synth_mangled(
            Instruction::with2(Code::Cmp_r64_rm64, Register::RDI, rip_mem(pred)).expect("cmp"),
        ));
        ls.append(Instr::synth_branch(
            Instruction::with_branch(Code::Jne_rel32_64, 0).expect("jne"),
            no_pred,
        ));
        ls.append(Instr::synth_mangled(mov_load(
            Register::RDI,
            rip_mem(pred + 8),
        )));
        emit_restore_flags(&mut ls, config.ibl_save_all_flags);
        ls.append(Instr::synth_mangled(pop_reg(Register::RAX)));
        ls.append(Instr::synth_mangled(
            Instruction::with1(Code::Jmp_rm64, Register::RDI).expect("jmp rdi"),
        ));
        ls.append(Instr::label(no_pred));
    }

    // Zero register for empty-slot compares, then the probe cursor.
    ls.append(Instr::synth_mangled(push_reg(Register::RCX)));
    ls.append(Instr::synth_mangled(mov_imm64(
        Register::RCX,
        global.ibl_table.base_address(),
    )));
    ls.append(Instr::synth_mangled(
        Instruction::with2(Code::Add_r64_rm64, Register::RAX, Register::RCX).expect("add"),
    ));
    ls.append(Instr::synth_mangled(
        Instruction::with2(Code::Xor_r32_rm32, Register::ECX, Register::ECX).expect("xor"),
    ));

    // Unrolled probes.
    for _ in 0..config.ibl_checks {
        ls.append(Instr::synth_mangled(
            Instruction::with2(
                Code::Cmp_r64_rm64,
                Register::RDI,
                MemoryOperand::with_base_displ(Register::RAX, IBL_MANGLED_OFFSET as i64),
            )
            .expect("cmp probe"),
        ));
        ls.append(Instr::synth_branch(
            Instruction::with_branch(Code::Je_rel32_64, 0).expect("je"),
            hit,
        ));
        ls.append(Instr::synth_mangled(
            Instruction::with2(
                Code::Cmp_r64_rm64,
                Register::RCX,
                MemoryOperand::with_base_displ(Register::RAX, IBL_MANGLED_OFFSET as i64),
            )
            .expect("cmp empty"),
        ));
        ls.append(Instr::synth_branch(
            Instruction::with_branch(Code::Je_rel32_64, 0).expect("je empty"),
            miss,
        ));
        ls.append(Instr::synth_mangled(
            Instruction::with2(Code::Add_rm64_imm8, Register::RAX, 16u32).expect("add 16"),
        ));
    }

    // Fall-through and explicit misses: restore state (leaving RAX's
    // spill slot for the entry routine) and take the slow path.
    ls.append(Instr::label(miss));
    ls.append(Instr::synth_mangled(pop_reg(Register::RCX)));
    emit_restore_flags(&mut ls, config.ibl_save_all_flags);
    ls.append(Instr::synth_mangled(
        Instruction::with_branch(Code::Jmp_rel32_64, ibl_entry_routine(target_policy))
            .expect("jmp entry"),
    ));

    // Hit: dispatch through the stored exit stub.
    ls.append(Instr::label(hit));
    ls.append(Instr::synth_mangled(mov_load(
        Register::RCX,
        MemoryOperand::with_base_displ(Register::RAX, IBL_TRANSLATED_OFFSET as i64),
    )));
    if let Some(pred) = pred {
        let skip = ls.new_label();
        ls.append(Instr::synth_mangled(
            Instruction::with2(Code::Xor_r32_rm32, Register::EAX, Register::EAX).expect("xor"),
        ));
        let mut cmpxchg =
            Instruction::with2(Code::Cmpxchg_rm64_r64, rip_mem(pred + 8), Register::RCX)
                .expect("cmpxchg");
        cmpxchg.set_has_lock_prefix(true);
        ls.append(Instr::synth_mangled(cmpxchg));
        ls.append(Instr::synth_branch(
            Instruction::with_branch(Code::Jne_rel32_64, 0).expect("jne"),
            skip,
        ));
        ls.append(Instr::synth_mangled(mov_store(rip_mem(pred), Register::RDI)));
        ls.append(Instr::label(skip));
    }
    ls.append(Instr::synth_mangled(mov_reg(Register::RDI, Register::RCX)));
    ls.append(Instr::synth_mangled(pop_reg(Register::RCX)));
    emit_restore_flags(&mut ls, config.ibl_save_all_flags);
    ls.append(Instr::synth_mangled(pop_reg(Register::RAX)));
    ls.append(Instr::synth_mangled(
        Instruction::with1(Code::Jmp_rm64, Register::RDI).expect("jmp rdi"),
    ));

    let addr = encode_into_shared(&ls);

    let mut cache = caches().ibl_pre.lock();
    *cache.entry(key).or_insert(addr)
}

// ---------------------------------------------------------------------------
// IBL entry routine (hand-written leaf)
// ---------------------------------------------------------------------------

/// Rust side of the IBL fast path: probe the calling CPU's private
/// cache for the full fingerprint.
pub extern "C" fn weft_ibl_find_on_cpu(mangled: u64) -> u64 {
    CpuState::with(|cpu| {
        perf::visit_address_lookup_cpu();
        match cache::find_on_cpu(cpu, MangledAddress::from_u64(mangled)) {
            Some(pc) => {
                perf::visit_address_lookup_cpu_hit();
                pc
            }
            None => 0,
        }
    })
}

/// Rust side of the IBL slow path: the full two-tier lookup, translating
/// on a miss. Returns the exit-stub address for the fingerprint.
pub extern "C" fn weft_ibl_find_slow(mangled: u64) -> u64 {
    perf::visit_ibl_slow();
    CpuState::with(|cpu| {
        state::enter(cpu);
        host::enter_private_stack();
        let pc = ThreadState::with(|thread| {
            cache::find(cpu, thread, MangledAddress::from_u64(mangled))
        });
        host::exit_private_stack();
        pc
    })
}

/// The IBL entry routine for one policy. Entered by a pre-entry miss
/// with the stack holding `[saved rax][saved rdi][shifted redzone]` and
/// the mangled target in RDI. Saves the full machine state, consults the
/// CPU-private cache and then the global cache, and jumps to the
/// returned exit stub.
pub fn ibl_entry_routine(target_policy: Policy) -> AppPc {
    let key = target_policy.bits();
    if let Some(&pc) = caches().ibl_entry.lock().get(&key) {
        return pc;
    }

    let config = Config::get();
    let xmm_count: u8 = if config.track_xmm_regs { 16 } else { 2 };
    let xmm_bytes = xmm_count as i32 * 16;

    let find_cpu = weft_ibl_find_on_cpu as extern "C" fn(u64) -> u64 as usize as i64;
    let find_slow = weft_ibl_find_slow as extern "C" fn(u64) -> u64 as usize as i64;

    let mut ops = Asm::new(0);
    dynasm!(ops
        ; .arch x64
        // App flags survive the Rust calls; direction flag must be clear
        // for the ABI.
        ; pushfq
        ; cld
        ; push rcx
        ; push rdx
        ; push rbx
        ; push rbp
        ; push rsi
        ; push r8
        ; push r9
        ; push r10
        ; push r11
        ; push r12
        ; push r13
        ; push r14
        ; push r15
        ; sub rsp, xmm_bytes
    );
    for i in 0..xmm_count {
        dynasm!(ops ; .arch x64 ; movups [rsp + i as i32 * 16], Rx(i));
    }
    dynasm!(ops
        ; .arch x64
        // Frame for the calls; the slot at rbp-8 keeps the mangled
        // target across the fast-path call.
        ; mov rbp, rsp
        ; sub rsp, 8
        ; mov [rsp], rdi
        ; and rsp, -16
        ; mov rax, QWORD find_cpu
        ; call rax
        ; test rax, rax
        ; jnz >done
        ; mov rdi, [rbp - 8]
        ; mov rax, QWORD find_slow
        ; call rax
        ; done:
        ; mov rsp, rbp
    );
    for i in 0..xmm_count {
        dynasm!(ops ; .arch x64 ; movups Rx(i), [rsp + i as i32 * 16]);
    }
    dynasm!(ops
        ; .arch x64
        ; add rsp, xmm_bytes
        ; pop r15
        ; pop r14
        ; pop r13
        ; pop r12
        ; pop r11
        ; pop r10
        ; pop r9
        ; pop r8
        ; pop rsi
        ; pop rbp
        ; pop rbx
        ; pop rdx
        ; pop rcx
        ; popfq
        // The result is an exit stub; it unwinds the rdi spill and the
        // redzone shift itself.
        ; mov rdi, rax
        ; pop rax
        ; jmp rdi
    );
    let code = ops.finalize().expect("ibl entry assembly");
    let addr = GlobalState::get().stub_arena.alloc_bytes(&code);

    let mut cache = caches().ibl_entry.lock();
    *cache.entry(key).or_insert(addr)
}

// ---------------------------------------------------------------------------
// IBL exit stubs
// ---------------------------------------------------------------------------

/// Generate the one-shot exit stub for a translated (or detach) target:
/// restore the spilled argument register and the redzone, then jump.
pub fn ibl_exit_routine(target_pc: AppPc) -> AppPc {
    perf::visit_ibl_exit();
    let mut ls = InstrList::new();
    ls.append(Instr::synth_mangled(pop_reg(Register::RDI)));
    ls.append(Instr::synth_mangled(lea_rsp(REDZONE_SIZE)));
    if crate::mangle::is_far_away(CacheRegion::get().base(), target_pc) {
        // Native detach target out of rel32 range: jump through a slot.
        let slot = GlobalState::get().stub_arena.alloc(8);
        unsafe { write_bytes(slot, &target_pc.to_le_bytes()) };
        ls.append(Instr::synth_mangled(
            Instruction::with1(Code::Jmp_rm64, rip_mem(slot)).expect("far exit"),
        ));
    } else {
        ls.append(Instr::synth_mangled(
            Instruction::with_branch(Code::Jmp_rel32_64, target_pc).expect("exit jmp"),
        ));
    }
    encode_into_shared(&ls)
}

// ---------------------------------------------------------------------------
// Return fast path
// ---------------------------------------------------------------------------

/// The return-lookup routine: recognise a return address that points
/// back into the code cache by its block-header geometry and return
/// natively, bypassing the IBL. Anything else unwinds and takes the
/// normal return pre-entry. The region bound checks come first, so the
/// header probe never touches unmapped memory.
pub fn rbl_entry_routine(cpu: &mut CpuState, target_policy: Policy) -> AppPc {
    let key = target_policy.bits();
    if let Some(&pc) = caches().rbl.lock().get(&key) {
        return pc;
    }

    let region = CacheRegion::get();
    let ret_instr = Instruction::with(Code::Retnq);
    let pre_entry = {
        // The slow continuation re-enters through the ordinary return
        // pre-entry with the original stack.
        let machine = ret_instr;
        ibl_pre_entry_routine(cpu, target_policy, &machine, IblEntryKind::Return)
    };

    let mut ls = InstrList::new();
    let miss = ls.new_label();

    ls.append(Instr::synth_mangled(lea_rsp(-(REDZONE_SIZE - 8))));
    ls.append(Instr::synth_mangled(push_reg(Register::RDI)));
    ls.append(Instr::synth_mangled(mov_load(
        Register::RDI,
        MemoryOperand::with_base_displ(Register::RSP, REDZONE_SIZE as i64),
    )));
    ls.append(Instr::synth_mangled(push_reg(Register::RCX)));

    // In-region?
    ls.append(Instr::synth_mangled(mov_imm64(Register::RCX, region.base())));
    ls.append(Instr::synth_mangled(
        Instruction::with2(Code::Cmp_r64_rm64, Register::RDI, Register::RCX).expect("cmp"),
    ));
    ls.append(Instr::synth_branch(
        Instruction::with_branch(Code::Jb_rel32_64, 0).expect("jb"),
        miss,
    ));
    ls.append(Instr::synth_mangled(mov_imm64(Register::RCX, region.end())));
    ls.append(Instr::synth_mangled(
        Instruction::with2(Code::Cmp_r64_rm64, Register::RDI, Register::RCX).expect("cmp"),
    ));
    ls.append(Instr::synth_branch(
        Instruction::with_branch(Code::Jae_rel32_64, 0).expect("jae"),
        miss,
    ));

    // Call-return geometry: the address must sit on a slot boundary.
    ls.append(Instr::synth_mangled(
        Instruction::with2(Code::Test_rm8_imm8, Register::DIL, 7u32).expect("test"),
    ));
    ls.append(Instr::synth_branch(
        Instruction::with_branch(Code::Jne_rel32_64, 0).expect("jne"),
        miss,
    ));

    // Header magic just past the link slot.
    ls.append(Instr::synth_mangled(
        Instruction::with2(
            Code::Cmp_rm32_imm32,
            MemoryOperand::with_base_displ(
                Register::RDI,
                16 - RETURN_ADDRESS_OFFSET as i64,
            ),
            BLOCK_HEADER_MAGIC,
        )
        .expect("cmp magic"),
    ));
    ls.append(Instr::synth_branch(
        Instruction::with_branch(Code::Jne_rel32_64, 0).expect("jne"),
        miss,
    ));

    // Fast path: the return address is translated code. Unwind and
    // return natively; the ret both pops the address and releases the
    // overlaid redzone shift.
    ls.append(Instr::synth_mangled(pop_reg(Register::RCX)));
    ls.append(Instr::synth_mangled(pop_reg(Register::RDI)));
    ls.append(Instr::synth_mangled(lea_rsp(REDZONE_SIZE - 8)));
    ls.append(Instr::synth_mangled(ret_instr));

    // Slow path: restore the original entry state and take the IBL.
    ls.append(Instr::label(miss));
    ls.append(Instr::synth_mangled(pop_reg(Register::RCX)));
    ls.append(Instr::synth_mangled(pop_reg(Register::RDI)));
    ls.append(Instr::synth_mangled(lea_rsp(REDZONE_SIZE - 8)));
    ls.append(Instr::synth_mangled(
        Instruction::with_branch(Code::Jmp_rel32_64, pre_entry).expect("jmp pre"),
    ));

    let addr = encode_into_shared(&ls);
    let mut cache = caches().rbl.lock();
    *cache.entry(key).or_insert(addr)
}

// ---------------------------------------------------------------------------
// DBL: direct-branch patch machinery
// ---------------------------------------------------------------------------

/// Direct CTI opcodes the DBL can patch, indexed by the id baked into
/// each patch template.
const DBL_CODES: &[Code] = &[
    Code::Call_rel32_64,
    Code::Jmp_rel32_64,
    Code::Jo_rel32_64,
    Code::Jno_rel32_64,
    Code::Jb_rel32_64,
    Code::Jae_rel32_64,
    Code::Je_rel32_64,
    Code::Jne_rel32_64,
    Code::Jbe_rel32_64,
    Code::Ja_rel32_64,
    Code::Js_rel32_64,
    Code::Jns_rel32_64,
    Code::Jp_rel32_64,
    Code::Jnp_rel32_64,
    Code::Jl_rel32_64,
    Code::Jge_rel32_64,
    Code::Jle_rel32_64,
    Code::Jg_rel32_64,
];

fn dbl_code_index(code: Code) -> usize {
    DBL_CODES
        .iter()
        .position(|&c| c == code)
        .unwrap_or_else(|| panic!("unmanageable direct CTI opcode {code:?}"))
}

/// Machine context the DBL patch templates hand to the patcher. Field
/// order mirrors the template's push sequence exactly: saved GPRs, then
/// flags, the mangled target, and the return address into the patch
/// tail, from low stack addresses to high.
#[repr(C)]
pub struct DirectPatchContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub flags: u64,
    pub target_address: u64,
    pub return_address_into_patch_tail: u64,
}

/// First-execution patcher for a direct CTI. Translates the mangled
/// target, locates the 8-byte slot by decoding the stub's tail jump,
/// stages the resolved CTI and publishes it with one aligned store.
pub extern "C" fn weft_dbl_patch(ctx: *mut DirectPatchContext, code_index: u32) {
    let (mangled, ret_pc) = unsafe {
        let ctx = &*ctx;
        (
            MangledAddress::from_u64(ctx.target_address),
            ctx.return_address_into_patch_tail,
        )
    };
    assert!(
        CacheRegion::get().contains(ret_pc),
        "patch tail outside the code cache: {ret_pc:#x}"
    );

    let target_pc = CpuState::with(|cpu| {
        state::enter(cpu);
        if let Some(pc) = cpu.code_cache.find(mangled.base().as_u64()) {
            pc
        } else {
            ThreadState::with(|thread| cache::find(cpu, thread, mangled))
        }
    });

    // The stub tail ends with a jump back to the patchable slot.
    let mut pc = ret_pc;
    let mut slot = None;
    for _ in 0..8 {
        let m = crate::instr::decode_one(pc);
        if matches!(m.code(), Code::Jmp_rel32_64 | Code::Jmp_rel8_64) {
            slot = Some(m.near_branch_target());
            break;
        }
        pc += m.len() as u64;
    }
    let slot = slot.unwrap_or_else(|| panic!("no patch tail jump after {ret_pc:#x}"));
    assert_eq!(slot % crate::HOTPATCH_ALIGN as u64, 0, "unaligned patch slot");

    let code = DBL_CODES[code_index as usize];
    let cti = Instruction::with_branch(code, target_pc).expect("patched cti");
    let offset = if code == Code::Call_rel32_64 {
        RETURN_ADDRESS_OFFSET - 5
    } else {
        0
    };
    let payload = stage_8byte_hot_patch(&cti, slot, offset);

    perf::visit_dbl_patch();
    unsafe { (*(slot as *const AtomicU64)).store(payload, Ordering::Release) };
    tracing::trace!(slot, target = target_pc, "direct branch patched");
}

/// The patch template for one opcode: a hand-written leaf that captures
/// the machine context, calls [`weft_dbl_patch`], and resumes at the
/// patch tail, which re-executes the now-resolved slot.
fn dbl_patch_template(code_index: usize, xmm_safe: bool) -> AppPc {
    let key = (code_index, xmm_safe);
    if let Some(&pc) = caches().dbl_patch.lock().get(&key) {
        return pc;
    }

    let patcher =
        weft_dbl_patch as extern "C" fn(*mut DirectPatchContext, u32) as usize as i64;
    let xmm_bytes: i32 = 16 * 16;

    let mut ops = Asm::new(0);
    // On entry the stack is [mangled target][return into patch tail].
    dynasm!(ops
        ; .arch x64
        ; pushfq
        ; cld
        ; push rax
        ; push rcx
        ; push rdx
        ; push rbx
        ; push rbp
        ; push rsi
        ; push rdi
        ; push r8
        ; push r9
        ; push r10
        ; push r11
        ; push r12
        ; push r13
        ; push r14
        ; push r15
    );
    if xmm_safe {
        dynasm!(ops ; .arch x64 ; sub rsp, xmm_bytes);
        for i in 0..16u8 {
            dynasm!(ops ; .arch x64 ; movups [rsp + i as i32 * 16], Rx(i));
        }
    }
    let ctx_offset: i32 = if xmm_safe { xmm_bytes } else { 0 };
    dynasm!(ops
        ; .arch x64
        // arg0: the machine context (above any xmm spill area).
        ; lea rdi, [rsp + ctx_offset]
        ; mov esi, code_index as i32
        ; mov rbp, rsp
        ; and rsp, -16
        ; mov rax, QWORD patcher
        ; call rax
        ; mov rsp, rbp
    );
    if xmm_safe {
        for i in 0..16u8 {
            dynasm!(ops ; .arch x64 ; movups Rx(i), [rsp + i as i32 * 16]);
        }
        dynasm!(ops ; .arch x64 ; add rsp, xmm_bytes);
    }
    dynasm!(ops
        ; .arch x64
        ; pop r15
        ; pop r14
        ; pop r13
        ; pop r12
        ; pop r11
        ; pop r10
        ; pop r9
        ; pop r8
        ; pop rdi
        ; pop rsi
        ; pop rbp
        ; pop rbx
        ; pop rdx
        ; pop rcx
        ; pop rax
        ; popfq
        // Drop the mangled target and return into the patch tail. LEA
        // keeps the just-restored flags intact; the re-executed slot may
        // be a conditional branch.
        ; lea rsp, [rsp + 8]
        ; ret
    );
    let code = ops.finalize().expect("dbl template assembly");
    let addr = GlobalState::get().stub_arena.alloc_bytes(&code);

    let mut cache = caches().dbl_patch.lock();
    *cache.entry(key).or_insert(addr)
}

/// Build the per-site DBL routine: store the policy-mangled target in a
/// fresh stack slot under the tail's return address, then tail-call the
/// opcode's patch template.
pub fn dbl_entry_routine(
    cpu: &mut CpuState,
    widened_code: Code,
    am: MangledAddress,
) -> AppPc {
    let config = Config::get();
    let template = dbl_patch_template(dbl_code_index(widened_code), !config.track_xmm_regs);

    let mut ls = InstrList::new();
    ls.append(Instr::synth_mangled(lea_rsp(-8)));
    ls.append(Instr::synth_mangled(push_reg(Register::RAX)));
    ls.append(Instr::synth_mangled(mov_imm64(Register::RAX, am.as_u64())));
    ls.append(Instr::synth_mangled(mov_store(
        MemoryOperand::with_base_displ(Register::RSP, 8),
        Register::RAX,
    )));
    ls.append(Instr::synth_mangled(pop_reg(Register::RAX)));
    ls.append(Instr::synth_mangled(
        Instruction::with_branch(Code::Jmp_rel32_64, template).expect("jmp template"),
    ));
    encode_into_fragment(cpu, &ls)
}

// ---------------------------------------------------------------------------
// Attach thunk
// ---------------------------------------------------------------------------

static THUNK: OnceLock<(AppPc, AppPc)> = OnceLock::new();

/// The native-to-translated call thunk. Returns `(entry, return_site)`;
/// the return site is registered as a detach point, so the translated
/// callee's final return leaves the cache here instead of translating
/// the harness.
pub fn attach_thunk() -> (AppPc, AppPc) {
    *THUNK.get_or_init(|| {
        let mut ops = Asm::new(0);
        dynasm!(ops
            ; .arch x64
            ; push rbp
            ; mov rbp, rsp
            // arg0 = translated entry, arg1 = forwarded argument.
            ; mov rax, rdi
            ; mov rdi, rsi
            ; call rax
        );
        let ret_site = ops.offset().0;
        dynasm!(ops
            ; .arch x64
            ; pop rbp
            ; ret
        );
        let code = ops.finalize().expect("attach thunk assembly");
        let base = GlobalState::get().stub_arena.alloc_bytes(&code);
        let ret_pc = base + ret_site as u64;
        detach::add_detach_point(ret_pc, ret_pc);
        (base, ret_pc)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn patch_context_layout_matches_push_order() {
        // The template pushes flags, then rax..r15; r15 lands lowest.
        assert_eq!(offset_of!(DirectPatchContext, r15), 0);
        assert_eq!(offset_of!(DirectPatchContext, rax), 14 * 8);
        assert_eq!(offset_of!(DirectPatchContext, flags), 15 * 8);
        assert_eq!(offset_of!(DirectPatchContext, target_address), 16 * 8);
        assert_eq!(
            offset_of!(DirectPatchContext, return_address_into_patch_tail),
            17 * 8
        );
        assert_eq!(std::mem::size_of::<DirectPatchContext>(), 18 * 8);
    }

    #[test]
    fn dbl_codes_cover_conditions() {
        assert_eq!(dbl_code_index(Code::Call_rel32_64), 0);
        assert_eq!(dbl_code_index(Code::Jmp_rel32_64), 1);
        // Every short conditional widens into the table.
        for short in [Code::Je_rel8_64, Code::Jne_rel8_64, Code::Jg_rel8_64] {
            let widened = short.as_near_branch();
            assert!(DBL_CODES.contains(&widened));
        }
    }
}
