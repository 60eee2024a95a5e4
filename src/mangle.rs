//! The instruction mangler.
//!
//! Runs over a freshly decoded (and client-instrumented) block in two
//! passes. Pass 1 rewrites every control-transfer instruction so control
//! re-enters the translator instead of escaping to native code, and
//! rewrites rip-relative references the cache cannot reach. Pass 2
//! aligns every hot-patchable instruction on an 8-byte boundary and pads
//! its slot, which is what makes the later single-store patches atomic.
//!
//! The carry-flag tracker at the bottom is shared with the watchpoints
//! pass; it decides where the carry flag must be preserved around
//! injected `bt` tests.

use iced_x86::{
    Code, FlowControl, Instruction, MemoryOperand, Mnemonic, OpKind, Register, RflagsBits,
};

use crate::instr::{encoded_size, Instr, InstrId, InstrList, INSTR_DELAY_BEGIN, INSTR_DELAY_END};
use crate::policy::{Inherit, MangledAddress, Policy};
use crate::register::{gpr_index, gpr_scaled, RegScale, RegisterManager};
use crate::state::CpuState;
use crate::{host, stub, AppPc, HOTPATCH_ALIGN, REDZONE_SIZE, RETURN_ADDRESS_OFFSET};

/// True when `target` cannot be reached from `from` with a rel32
/// displacement. A displacement of exactly `i32::MAX` still encodes.
pub fn is_far_away(from: AppPc, target: AppPc) -> bool {
    let diff = from.wrapping_sub(target) as i64;
    diff.unsigned_abs() > i32::MAX as u64
}

/// Where to place injected padding relative to an anchor instruction.
enum Inject {
    Before(InstrId),
    After(InstrId),
}

pub struct Mangler<'a> {
    /// Policy of the block being mangled.
    policy: Policy,
    /// Address the next fragment allocation will land at, used to decide
    /// rel32 reachability before the block's final address is known.
    estimator: AppPc,
    cpu: &'a mut CpuState,
}

impl<'a> Mangler<'a> {
    pub fn new(cpu: &'a mut CpuState, policy: Policy) -> Self {
        let estimator = cpu.fragment_allocator.stage();
        Mangler {
            policy,
            estimator,
            cpu,
        }
    }

    pub fn estimator(&self) -> AppPc {
        self.estimator
    }

    /// Mangle a block. CTI rewrites may append trampoline code to
    /// `stubs`, which the builder lays out ahead of the block header.
    pub fn mangle(&mut self, ls: &mut InstrList, stubs: &mut InstrList) {
        self.rewrite_pass(ls, stubs);
        self.align_pass(ls);
    }

    // -----------------------------------------------------------------
    // Pass 1: per-instruction rewrites
    // -----------------------------------------------------------------

    fn rewrite_pass(&mut self, ls: &mut InstrList, stubs: &mut InstrList) {
        let translate_far = crate::config::Config::get().translate_far_addresses;
        for id in ls.ids() {
            let in_ref = ls.get(id);
            if !in_ref.is_machine() {
                continue;
            }
            let mangled = in_ref.is_mangled();
            let synthesized = in_ref.pc == 0;
            let mnemonic = in_ref.machine().mnemonic();

            if in_ref.is_cti() {
                if !mangled {
                    self.mangle_cti(ls, stubs, id);
                }
            } else if mnemonic == Mnemonic::Cli {
                if !(synthesized || mangled) {
                    self.mangle_cli(ls, id);
                }
            } else if mnemonic == Mnemonic::Sti {
                if !(synthesized || mangled) {
                    self.mangle_sti(ls, id);
                }
            } else if matches!(mnemonic, Mnemonic::Bsf | Mnemonic::Bsr) && !mangled {
                self.mangle_bit_scan(ls, id);
            } else if translate_far {
                if mnemonic == Mnemonic::Lea {
                    self.mangle_lea(ls, id);
                } else {
                    self.mangle_far_memory_refs(ls, id);
                }
            }
        }
    }

    fn mangle_cti(&mut self, ls: &mut InstrList, stubs: &mut InstrList, id: InstrId) {
        let in_ref = ls.get(id);
        let machine = *in_ref.machine();

        // Branches to labels inside the block are already resolved.
        if in_ref.target.is_some() {
            return;
        }

        if matches!(machine.code(), Code::Iretq | Code::Iretd | Code::Iretw) {
            ls.get_mut(id).set_mangled();
            return;
        }

        let block_policy = self.policy;
        let override_policy = in_ref.policy;

        if in_ref.is_return() {
            if machine.op_count() > 0 && machine.op0_kind() != OpKind::Register {
                panic!(
                    "unmanageable return with stack release at {:#x}",
                    in_ref.pc
                );
            }
            let target_policy = override_policy
                .unwrap_or(block_policy)
                .inherit(Inherit::Return);
            ls.get_mut(id).policy = Some(target_policy);
            self.mangle_indirect_cti(ls, id, target_policy, stub::IblEntryKind::Return);
            return;
        }

        let inherit = if in_ref.is_call() {
            Inherit::Call
        } else {
            Inherit::Jmp
        };
        let mut target_policy = override_policy.unwrap_or(block_policy).inherit(inherit);

        if ls.get(id).is_direct_cti() {
            let target_pc = machine.near_branch_target();
            self.mangle_direct_cti(ls, stubs, id, target_pc, target_policy);
        } else {
            target_policy.set_indirect_cti_target(true);
            if target_policy.is_host_auto_instrumented() {
                target_policy.set_in_host_context(true);
            }
            ls.get_mut(id).policy = Some(target_policy);
            let kind = if ls.get(id).is_call() {
                stub::IblEntryKind::Call
            } else {
                stub::IblEntryKind::Jmp
            };
            self.mangle_indirect_cti(ls, id, target_policy, kind);
        }
    }

    /// Rewrite a direct CTI: point it at a known translation or detach
    /// target when possible, otherwise give it a hot-patchable slot
    /// backed by a DBL stub.
    fn mangle_direct_cti(
        &mut self,
        ls: &mut InstrList,
        stubs: &mut InstrList,
        id: InstrId,
        target_pc: AppPc,
        mut target_policy: Policy,
    ) {
        let mut am = MangledAddress::new(target_pc, target_policy);
        let is_call = ls.get(id).is_call();
        let is_terminal = ls.next(id).is_none();
        let config = crate::config::Config::get();

        // Already translated under this fingerprint's base form.
        let mut detach_target = self.cpu.code_cache.find(am.base().as_u64());

        // A direct branch into the cache itself needs no translation.
        if detach_target.is_none() && crate::alloc::CacheRegion::get().contains(target_pc) {
            detach_target = Some(target_pc);
        }

        // First detach check, before any context conversion.
        if detach_target.is_none() && target_policy.can_detach() {
            detach_target = crate::detach::find_detach_target(target_pc);
        }

        // Host-code handling: auto-instrument when the policy allows it,
        // otherwise detach.
        if detach_target.is_none()
            && !self.policy.is_in_host_context()
            && host::is_host_address(target_pc)
        {
            if self.policy.is_host_auto_instrumented() {
                target_policy.set_in_host_context(true);
                am = MangledAddress::new(target_pc, target_policy);
            } else {
                detach_target = Some(target_pc);
            }
        }

        ls.get_mut(id).policy = Some(target_policy);

        // Second detach check, in the possibly-converted context.
        if detach_target.is_none() && target_policy.can_detach() {
            detach_target = crate::detach::find_detach_target(target_pc);
        }

        if let Some(detach_pc) = detach_target {
            crate::perf::visit_detach();
            let in_mut = ls.get_mut(id);
            if is_far_away(self.estimator, detach_pc) {
                // Out of rel32 range: go through an allocated PC slot.
                if !in_mut.is_call() && in_mut.machine().flow_control()
                    != FlowControl::UnconditionalBranch
                {
                    panic!(
                        "unmanageable far conditional branch to detach target {detach_pc:#x}"
                    );
                }
                let slot = self.cpu.fragment_allocator.alloc(8);
                unsafe { crate::alloc::write_bytes(slot, &detach_pc.to_le_bytes()) };
                let code = if in_mut.is_call() {
                    Code::Call_rm64
                } else {
                    Code::Jmp_rm64
                };
                let mem = MemoryOperand::with_base_displ(Register::RIP, slot as i64);
                let machine = Instruction::with1(code, mem).expect("indirect detach cti");
                in_mut.body = crate::instr::InstrBody::Machine(machine);
                in_mut.set_mangled();
            } else {
                in_mut.widen_if_cti();
                in_mut.machine_mut().set_near_branch64(detach_pc);
                in_mut.set_mangled();
            }
            if !config.direct_return && (is_terminal || is_call) {
                ls.get_mut(id).set_patchable();
            }
            return;
        }

        // Unresolved target: emit the DBL stub and turn the CTI into a
        // patchable jump to it. The original opcode survives inside the
        // per-site routine, which the patcher uses to recreate the CTI
        // once the target is translated.
        let in_mut = ls.get_mut(id);
        in_mut.widen_if_cti();
        let widened_code = in_mut.machine().code().as_near_branch();
        let routine = stub::dbl_entry_routine(self.cpu, widened_code, am);

        let stub_label = ls.new_label();
        let slot_label = ls.new_label();
        stubs.append(Instr::label(stub_label));
        if !is_call {
            // Calls implicitly own their stack slot; everything else must
            // not clobber the redzone across the patcher call.
            stubs.append(Instr::synth_mangled(lea_rsp(-REDZONE_SIZE)));
        }
        stubs.append(Instr::synth_mangled(
            Instruction::with_branch(Code::Call_rel32_64, routine).expect("stub call"),
        ));
        if !is_call {
            stubs.append(Instr::synth_mangled(lea_rsp(REDZONE_SIZE)));
        }
        // The patcher finds the slot to patch by decoding this jump.
        stubs.append(Instr::synth_branch(
            Instruction::with_branch(Code::Jmp_rel32_64, 0).expect("stub jmp"),
            slot_label,
        ));

        ls.insert_before(id, Instr::label(slot_label));
        let in_mut = ls.get_mut(id);
        in_mut.body = crate::instr::InstrBody::Machine(
            Instruction::with_branch(Code::Jmp_rel32_64, 0).expect("slot jmp"),
        );
        in_mut.target = Some(stub_label);
        in_mut.set_mangled();
        in_mut.set_patchable();
    }

    /// Rewrite an indirect CTI (including RET) into a transfer to the
    /// matching IBL routine.
    fn mangle_indirect_cti(
        &mut self,
        ls: &mut InstrList,
        id: InstrId,
        target_policy: Policy,
        kind: stub::IblEntryKind,
    ) {
        let config = crate::config::Config::get();
        let machine = *ls.get(id).machine();

        if kind == stub::IblEntryKind::Return {
            if config.direct_return || self.policy.return_address_is_in_code_cache() {
                ls.get_mut(id).set_mangled();
                return;
            }
            let routine = if config.return_fast_path {
                stub::rbl_entry_routine(self.cpu, target_policy)
            } else {
                stub::ibl_pre_entry_routine(self.cpu, target_policy, &machine, kind)
            };
            let in_mut = ls.get_mut(id);
            in_mut.body = crate::instr::InstrBody::Machine(
                Instruction::with_branch(Code::Jmp_rel32_64, routine).expect("ret jmp"),
            );
            in_mut.set_mangled();
            return;
        }

        let routine = stub::ibl_pre_entry_routine(self.cpu, target_policy, &machine, kind);
        let in_mut = ls.get_mut(id);
        if kind == stub::IblEntryKind::Call {
            in_mut.body = crate::instr::InstrBody::Machine(
                Instruction::with_branch(Code::Call_rel32_64, routine).expect("ibl call"),
            );
            in_mut.set_mangled();
            // The return address must satisfy the cache-address geometry.
            in_mut.set_patchable();
        } else {
            in_mut.body = crate::instr::InstrBody::Machine(
                Instruction::with_branch(Code::Jmp_rel32_64, routine).expect("ibl jmp"),
            );
            in_mut.set_mangled();
        }
    }

    /// Reserved hook: clients may interpose on interrupt-flag clears.
    fn mangle_cli(&mut self, _ls: &mut InstrList, _id: InstrId) {}

    /// Reserved hook: clients may interpose on interrupt-flag sets.
    fn mangle_sti(&mut self, _ls: &mut InstrList, _id: InstrId) {}

    /// `lea reg, [rip+disp]` of an unreachable address is really a
    /// constant load; materialise the constant.
    fn mangle_lea(&mut self, ls: &mut InstrList, id: InstrId) {
        let machine = *ls.get(id).machine();
        if !machine.is_ip_rel_memory_operand() {
            return;
        }
        let target = machine.ip_rel_memory_address();
        if !is_far_away(self.estimator, target) {
            return;
        }
        let dest = machine.op0_register();
        let mov = Instruction::with2(Code::Mov_r64_imm64, dest, target).expect("lea rewrite");
        let in_mut = ls.get_mut(id);
        in_mut.body = crate::instr::InstrBody::Machine(mov);
        in_mut.set_mangled();
    }

    /// Rewrite a rip-relative memory reference whose target is out of
    /// rel32 range of the cache: load the absolute address into a dead
    /// (or spilled) register and go through it.
    fn mangle_far_memory_refs(&mut self, ls: &mut InstrList, id: InstrId) {
        let machine = *ls.get(id).machine();
        if !machine.is_ip_rel_memory_operand() {
            return;
        }
        let addr = machine.ip_rel_memory_address();
        if !is_far_away(self.estimator, addr) {
            return;
        }

        // Peephole: prefer a register the surrounding code is about to
        // overwrite anyway.
        let mut rm = RegisterManager::new();
        rm.revive_all();
        if let Some(next) = ls.next(id) {
            if ls.get(next).is_machine() {
                rm.visit(ls.get(next).machine());
            }
        }
        rm.visit(&machine);
        let dead_reg = rm.get_zombie();

        let mut rm = RegisterManager::new();
        rm.kill_all();
        rm.revive_used(&machine);
        if let Some(r) = dead_reg {
            rm.revive(r);
        }
        let spill_reg = rm
            .get_zombie()
            .expect("no spillable register for far memory reference");

        match machine.mnemonic() {
            Mnemonic::Push => {
                return self.mangle_far_memory_push(ls, id, dead_reg, spill_reg, addr)
            }
            Mnemonic::Pop => return self.mangle_far_memory_pop(ls, id, dead_reg, spill_reg, addr),
            _ => {}
        }

        let first;
        let mut last = None;
        let used_reg;
        if let Some(dead) = dead_reg {
            used_reg = dead;
            first = ls.insert_before(id, Instr::synth_mangled(mov_imm64(dead, addr)));
        } else {
            used_reg = spill_reg;
            let spill = ls.insert_before(id, Instr::synth_mangled(push_reg(spill_reg)));
            first = ls.insert_before(spill, Instr::synth_mangled(lea_rsp(-REDZONE_SIZE)));
            ls.insert_before(id, Instr::synth_mangled(mov_imm64(spill_reg, addr)));
            let pop = ls.insert_after(id, Instr::synth_mangled(pop_reg(spill_reg)));
            last = Some(ls.insert_after(pop, Instr::synth_mangled(lea_rsp(REDZONE_SIZE))));
        }

        let in_mut = ls.get_mut(id);
        redirect_memory_operand(in_mut.machine_mut(), used_reg);
        propagate_delay_region(ls, id, Some(first), last);
    }

    /// `push [far]` operates on the slot it creates, so the generic
    /// save/restore is illegal. The stack slot must hold the loaded
    /// value when the sequence completes.
    fn mangle_far_memory_push(
        &mut self,
        ls: &mut InstrList,
        id: InstrId,
        dead_reg: Option<Register>,
        spill_reg: Register,
        addr: u64,
    ) {
        let first;
        let mut last = None;
        if let Some(dead) = dead_reg {
            first = ls.insert_before(id, Instr::synth_mangled(mov_imm64(dead, addr)));
            let in_mut = ls.get_mut(id);
            let push = Instruction::with1(Code::Push_rm64, MemoryOperand::with_base(dead))
                .expect("far push");
            in_mut.body = crate::instr::InstrBody::Machine(push);
            in_mut.set_mangled();
        } else {
            first = ls.insert_before(id, Instr::synth_mangled(lea_rsp(-8)));
            ls.insert_before(id, Instr::synth_mangled(push_reg(spill_reg)));
            ls.insert_before(id, Instr::synth_mangled(mov_imm64(spill_reg, addr)));
            ls.insert_before(
                id,
                Instr::synth_mangled(mov_load(spill_reg, MemoryOperand::with_base(spill_reg))),
            );
            let in_mut = ls.get_mut(id);
            let store = mov_store(
                MemoryOperand::with_base_displ(Register::RSP, 8),
                spill_reg,
            );
            in_mut.body = crate::instr::InstrBody::Machine(store);
            in_mut.set_mangled();
            last = Some(ls.insert_after(id, Instr::synth_mangled(pop_reg(spill_reg))));
        }
        propagate_delay_region(ls, id, Some(first), last);
    }

    /// `pop [far]`: the value leaves the stack before the store happens.
    fn mangle_far_memory_pop(
        &mut self,
        ls: &mut InstrList,
        id: InstrId,
        dead_reg: Option<Register>,
        spill_reg: Register,
        addr: u64,
    ) {
        let first;
        let last;
        if let Some(dead) = dead_reg {
            first = ls.insert_before(id, Instr::synth_mangled(pop_reg(dead)));
            ls.insert_before(id, Instr::synth_mangled(push_reg(spill_reg)));
            ls.insert_before(id, Instr::synth_mangled(mov_imm64(spill_reg, addr)));
            let in_mut = ls.get_mut(id);
            in_mut.body = crate::instr::InstrBody::Machine(mov_store(
                MemoryOperand::with_base(spill_reg),
                dead,
            ));
            in_mut.set_mangled();
            last = Some(ls.insert_after(id, Instr::synth_mangled(pop_reg(spill_reg))));
        } else {
            // No dead register: spill two and address the original slot
            // through the shifted stack pointer.
            let mut rm = RegisterManager::new();
            rm.kill_all();
            let machine = *ls.get(id).machine();
            rm.revive_used(&machine);
            rm.revive(spill_reg);
            let value_reg = rm
                .get_zombie()
                .expect("no second spill register for far pop");

            first = ls.insert_before(id, Instr::synth_mangled(push_reg(value_reg)));
            ls.insert_before(id, Instr::synth_mangled(push_reg(spill_reg)));
            ls.insert_before(id, Instr::synth_mangled(mov_imm64(spill_reg, addr)));
            ls.insert_before(
                id,
                Instr::synth_mangled(mov_load(
                    value_reg,
                    MemoryOperand::with_base_displ(Register::RSP, 16),
                )),
            );
            let in_mut = ls.get_mut(id);
            in_mut.body = crate::instr::InstrBody::Machine(mov_store(
                MemoryOperand::with_base(spill_reg),
                value_reg,
            ));
            in_mut.set_mangled();
            let a = ls.insert_after(id, Instr::synth_mangled(pop_reg(spill_reg)));
            let b = ls.insert_after(a, Instr::synth_mangled(pop_reg(value_reg)));
            last = Some(ls.insert_after(b, Instr::synth_mangled(lea_rsp(8))));
        }
        propagate_delay_region(ls, id, Some(first), last);
    }

    /// Bit scans leave the destination undefined on zero input; the
    /// kernel expects all-ones there, and tag tests on partially defined
    /// registers misfire, so force `~0` whenever ZF comes out set.
    fn mangle_bit_scan(&mut self, ls: &mut InstrList, id: InstrId) {
        let machine = *ls.get(id).machine();
        let dest = machine.op0_register();
        let dest_bytes = dest.size();
        let scale = RegScale::from_bytes(dest_bytes);

        let mut rm = RegisterManager::new();
        rm.kill_all();
        rm.revive_used(&machine);
        let spill64 = rm.get_zombie().expect("no spill register for bit scan");
        let index = gpr_index(spill64).unwrap();
        let spill_scaled = gpr_scaled(index, scale);

        let (mov_undef, cmov) = match scale {
            RegScale::Word => (
                Instruction::with2(Code::Mov_r16_imm16, spill_scaled, 0xffffu32)
                    .expect("bit scan imm"),
                Instruction::with2(Code::Cmove_r16_rm16, dest, spill_scaled)
                    .expect("bit scan cmov"),
            ),
            RegScale::Dword => (
                Instruction::with2(Code::Mov_r32_imm32, spill_scaled, 0xffff_ffffu32)
                    .expect("bit scan imm"),
                Instruction::with2(Code::Cmove_r32_rm32, dest, spill_scaled)
                    .expect("bit scan cmov"),
            ),
            RegScale::Qword => (
                Instruction::with2(Code::Mov_r64_imm64, spill_scaled, u64::MAX)
                    .expect("bit scan imm"),
                Instruction::with2(Code::Cmove_r64_rm64, dest, spill_scaled)
                    .expect("bit scan cmov"),
            ),
            RegScale::Byte => panic!("byte-width bit scan at {:#x}", ls.get(id).pc),
        };

        ls.get_mut(id).set_mangled();
        let a = ls.insert_after(id, Instr::synth_mangled(push_reg(spill64)));
        let b = ls.insert_after(a, Instr::synth_mangled(mov_undef));
        let c = ls.insert_after(b, Instr::synth_mangled(cmov));
        ls.insert_after(c, Instr::synth_mangled(pop_reg(spill64)));
    }

    // -----------------------------------------------------------------
    // Pass 2: hot-patch alignment
    // -----------------------------------------------------------------

    /// Walk the block keeping a running byte offset and pad every
    /// patchable instruction into its own 8-byte-aligned slot. Calls are
    /// additionally placed so their return address lands at the slot
    /// boundary, which is what the cache-address geometry checks.
    fn align_pass(&mut self, ls: &mut InstrList) {
        let mut align: usize = 0;
        for id in ls.ids() {
            let in_ref = ls.get(id);
            let size = encoded_size(in_ref, self.estimator + align as u64);
            if in_ref.is_patchable() {
                assert!(size <= HOTPATCH_ALIGN, "patchable slot overflow: {size}");
                let mut pad = align.wrapping_neg() & (HOTPATCH_ALIGN - 1);
                if in_ref.is_call() {
                    assert!(size <= RETURN_ADDRESS_OFFSET);
                    pad += RETURN_ADDRESS_OFFSET - size;
                }
                // Padding goes before the slot label when one precedes
                // the instruction, so the label keeps naming the slot.
                let anchor = match ls.prev(id) {
                    Some(p) if ls.get(p).is_label() => Inject::Before(p),
                    Some(p) => Inject::After(p),
                    None => Inject::Before(id),
                };
                inject_mangled_nops(ls, anchor, pad);
                align += pad + size;
                let tail_pad = align.wrapping_neg() & (HOTPATCH_ALIGN - 1);
                inject_mangled_nops(ls, Inject::After(id), tail_pad);
                align += tail_pad;
            } else {
                align += size;
            }
        }
    }
}

/// Inject the equivalent of `num` bytes of NOPs: real NOPs up to three
/// bytes, a short jump over trap bytes beyond that so long pads cost one
/// branch instead of a NOP slide.
fn inject_mangled_nops(ls: &mut InstrList, anchor: Inject, num: usize) {
    if num == 0 {
        return;
    }
    let bytes = nop_fill(num);
    let id = match anchor {
        Inject::Before(at) => ls.insert_before(at, Instr::bytes(bytes)),
        Inject::After(at) => ls.insert_after(at, Instr::bytes(bytes)),
    };
    if let Inject::After(at) = anchor {
        // Keep delay regions intact across the split.
        if ls.get(at).ends_delay_region() {
            ls.get_mut(at).flags &= !INSTR_DELAY_END;
            ls.get_mut(id).flags |= INSTR_DELAY_END;
        }
    }
}

/// The byte pattern for `num` bytes of padding.
pub(crate) fn nop_fill(num: usize) -> Vec<u8> {
    match num {
        0 => Vec::new(),
        1 => vec![0x90],
        2 => vec![0x66, 0x90],
        3 => vec![0x0f, 0x1f, 0x00],
        n => {
            // jmp short over n-2 bytes of ud2, with a one-byte nop when
            // the span is odd so the fill still decodes linearly.
            let mut v = Vec::with_capacity(n);
            v.push(0xeb);
            v.push((n - 2) as u8);
            let fill = n - 2;
            for _ in 0..fill / 2 {
                v.extend_from_slice(&[0x0f, 0x0b]);
            }
            if fill % 2 == 1 {
                v.push(0x90);
            }
            v
        }
    }
}

/// Stage an 8-byte hot patch: `offset` pad bytes, the encoded CTI as if
/// it sat at `slot + offset`, then pad to the slot boundary. The result
/// is the payload for one aligned atomic store.
pub fn stage_8byte_hot_patch(cti: &Instruction, slot: AppPc, offset: usize) -> u64 {
    let mut staged = Vec::with_capacity(HOTPATCH_ALIGN);
    staged.extend_from_slice(&nop_fill(offset));
    let instr = Instr::synth(*cti);
    crate::instr::encode_into(&instr, slot + offset as u64, None, &mut staged);
    assert!(
        staged.len() <= HOTPATCH_ALIGN,
        "hot patch payload overflow: {} bytes",
        staged.len()
    );
    let tail = HOTPATCH_ALIGN - staged.len();
    staged.extend_from_slice(&nop_fill(tail));
    u64::from_le_bytes(staged.try_into().unwrap())
}

/// Move `first`/`last` to carry the delay-region bounds of `id` after a
/// rewrite turned one instruction into a sequence.
fn propagate_delay_region(
    ls: &mut InstrList,
    id: InstrId,
    first: Option<InstrId>,
    last: Option<InstrId>,
) {
    if ls.get(id).begins_delay_region() {
        if let Some(first) = first {
            ls.get_mut(id).flags &= !INSTR_DELAY_BEGIN;
            ls.get_mut(first).flags |= INSTR_DELAY_BEGIN;
        }
    }
    if ls.get(id).ends_delay_region() {
        if let Some(last) = last {
            ls.get_mut(id).flags &= !INSTR_DELAY_END;
            ls.get_mut(last).flags |= INSTR_DELAY_END;
        }
    }
}

// ---------------------------------------------------------------------------
// Small instruction builders shared with the stub generator
// ---------------------------------------------------------------------------

pub(crate) fn lea_rsp(disp: i32) -> Instruction {
    let mem = MemoryOperand::with_base_displ(Register::RSP, disp as i64);
    Instruction::with2(Code::Lea_r64_m, Register::RSP, mem).expect("lea rsp")
}

pub(crate) fn push_reg(reg: Register) -> Instruction {
    Instruction::with1(Code::Push_r64, reg).expect("push")
}

pub(crate) fn pop_reg(reg: Register) -> Instruction {
    Instruction::with1(Code::Pop_r64, reg).expect("pop")
}

pub(crate) fn mov_imm64(reg: Register, imm: u64) -> Instruction {
    Instruction::with2(Code::Mov_r64_imm64, reg, imm).expect("mov imm64")
}

pub(crate) fn mov_load(reg: Register, mem: MemoryOperand) -> Instruction {
    Instruction::with2(Code::Mov_r64_rm64, reg, mem).expect("mov load")
}

pub(crate) fn mov_store(mem: MemoryOperand, reg: Register) -> Instruction {
    Instruction::with2(Code::Mov_rm64_r64, mem, reg).expect("mov store")
}

pub(crate) fn mov_reg(dst: Register, src: Register) -> Instruction {
    Instruction::with2(Code::Mov_r64_rm64, dst, src).expect("mov reg")
}

/// Replace an instruction's memory operand with `[reg]`, dropping the
/// rip-relative form.
fn redirect_memory_operand(machine: &mut Instruction, reg: Register) {
    machine.set_memory_base(reg);
    machine.set_memory_index(Register::None);
    machine.set_memory_index_scale(1);
    machine.set_memory_displacement64(0);
    machine.set_memory_displ_size(0);
}

// ---------------------------------------------------------------------------
// Carry-flag tracking
// ---------------------------------------------------------------------------

/// Whether the carry flag must be rescued around instrumentation that
/// clobbers it. Exactly one of the flags is ever set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CarryFlagState {
    pub restore_before: bool,
    pub restore_after: bool,
}

/// One step of the three-state carry tracker. Scanned against each
/// instruction with `next_reads_cf` carrying state between steps; the
/// watchpoints pass walks a block backwards with it.
pub fn track_carry_flag(instr: &Instr, next_reads_cf: &mut bool) -> CarryFlagState {
    if instr.is_return() {
        *next_reads_cf = false;
        return CarryFlagState {
            restore_before: false,
            restore_after: false,
        };
    }
    if instr.is_cti() {
        *next_reads_cf = true;
        return CarryFlagState {
            restore_before: true,
            restore_after: false,
        };
    }
    let machine = instr.machine();
    if machine.rflags_read() & RflagsBits::CF != 0 {
        *next_reads_cf = true;
        CarryFlagState {
            restore_before: true,
            restore_after: false,
        }
    } else if machine.rflags_modified() & RflagsBits::CF != 0 {
        *next_reads_cf = false;
        CarryFlagState {
            restore_before: false,
            restore_after: false,
        }
    } else {
        CarryFlagState {
            restore_before: false,
            restore_after: *next_reads_cf,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn far_away_edges() {
        let base = 0x1_0000_0000u64;
        assert!(!is_far_away(base, base + i32::MAX as u64));
        assert!(is_far_away(base, base + i32::MAX as u64 + 1));
        assert!(!is_far_away(base + i32::MAX as u64, base));
        assert!(is_far_away(base, base.wrapping_sub(0x8000_0001)));
    }

    #[test]
    fn nop_fill_shapes() {
        assert_eq!(nop_fill(1), vec![0x90]);
        assert_eq!(nop_fill(2), vec![0x66, 0x90]);
        assert_eq!(nop_fill(3), vec![0x0f, 0x1f, 0x00]);
        let five = nop_fill(5);
        assert_eq!(five, vec![0xeb, 3, 0x0f, 0x0b, 0x90]);
        let six = nop_fill(6);
        assert_eq!(six, vec![0xeb, 4, 0x0f, 0x0b, 0x0f, 0x0b]);
    }

    #[test]
    fn staged_patch_places_call_return_at_slot_end() {
        let slot = 0x1000u64;
        let call = Instruction::with_branch(Code::Call_rel32_64, 0x9000).unwrap();
        let offset = RETURN_ADDRESS_OFFSET - 5;
        let payload = stage_8byte_hot_patch(&call, slot, offset);
        let bytes = payload.to_le_bytes();
        // Three pad bytes then the call opcode; the call ends exactly at
        // the slot boundary so the pushed return address is slot + 8.
        assert_eq!(&bytes[..3], &nop_fill(3)[..]);
        assert_eq!(bytes[3], 0xe8);
        let disp = i32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(slot as i64 + 8 + disp as i64, 0x9000);
    }

    #[test]
    fn staged_patch_pads_short_ctis() {
        let slot = 0x2000u64;
        let jmp = Instruction::with_branch(Code::Jmp_rel32_64, 0x8000).unwrap();
        let payload = stage_8byte_hot_patch(&jmp, slot, 0);
        let bytes = payload.to_le_bytes();
        assert_eq!(bytes[0], 0xe9);
        assert_eq!(&bytes[5..8], &nop_fill(3)[..]);
    }

    #[test]
    fn carry_tracker_transitions() {
        use iced_x86::{Decoder, DecoderOptions};
        let mut next_reads = false;

        // ret: nothing propagates.
        let ret = Instr::synth(Instruction::with(Code::Retnq));
        let st = track_carry_flag(&ret, &mut next_reads);
        assert_eq!(st, CarryFlagState::default());
        assert!(!next_reads);

        // jmp (a CTI): conservative restore-before.
        let jmp = Instr::synth(Instruction::with_branch(Code::Jmp_rel32_64, 0).unwrap());
        let st = track_carry_flag(&jmp, &mut next_reads);
        assert!(st.restore_before && !st.restore_after);
        assert!(next_reads);

        // adc reads CF.
        let bytes = [0x11, 0xd8]; // adc eax, ebx
        let adc = Instr::decoded(
            Decoder::with_ip(64, &bytes, 0, DecoderOptions::NONE).decode(),
            0x1,
        );
        next_reads = false;
        let st = track_carry_flag(&adc, &mut next_reads);
        assert!(st.restore_before);
        assert!(next_reads);

        // add writes CF without reading it.
        let bytes = [0x01, 0xd8]; // add eax, ebx
        let add = Instr::decoded(
            Decoder::with_ip(64, &bytes, 0, DecoderOptions::NONE).decode(),
            0x1,
        );
        let st = track_carry_flag(&add, &mut next_reads);
        assert_eq!(st, CarryFlagState::default());
        assert!(!next_reads);

        // mov neither reads nor writes CF: inherits.
        let mov = Instr::synth(mov_reg(Register::RAX, Register::RBX));
        next_reads = true;
        let st = track_carry_flag(&mov, &mut next_reads);
        assert!(!st.restore_before && st.restore_after);
    }
}
