//! The watchpoints instrumentation pass.
//!
//! The representative client: every candidate memory operand gets a tag
//! test on its effective address. Watched (tagged) addresses divert
//! through client-owned label points where a [`Watcher`] attaches its
//! read/write visitors, then execute against the masked (unwatched)
//! address. The pass leans on the mangler's carry-flag tracker and the
//! register manager's liveness queries to avoid spills, and guarantees
//! balanced stack discipline on every path through the instrumented
//! region.
//!
//! Address scheme (user mode): watched addresses carry bit 48 plus a
//! 15-bit watchpoint index in the bits above it; masking the high 16
//! bits recovers the canonical address. Kernel polarity inverts both
//! the tag test and the mask fill.

use std::sync::Arc;

use iced_x86::{
    Code, Instruction, InstructionInfoFactory, MemoryOperand, Mnemonic, OpAccess, OpKind,
    Register,
};

use crate::block::BasicBlockState;
use crate::config::Config;
use crate::instr::{Instr, InstrId, InstrList};
use crate::mangle::{
    lea_rsp, mov_reg, pop_reg, push_reg, track_carry_flag, CarryFlagState,
};
use crate::register::{gpr_index, gpr_scaled, is_high_gpr, RegScale, RegisterManager};
use crate::state::CpuState;
use crate::{AppPc, InstrumentationPass, REDZONE_SIZE};

/// Bit that distinguishes watched from unwatched addresses.
pub const DISTINGUISHING_BIT_OFFSET: u32 = 48;

/// High-order bits masked off to recover the unwatched address.
pub const NUM_HIGH_ORDER_BITS: u32 = 16;

const ADDRESS_MASK: u64 = (1 << DISTINGUISHING_BIT_OFFSET) - 1;

/// Tag an address as watched, with a client-chosen watchpoint index.
pub fn tag_address(addr: AppPc, index: u16) -> AppPc {
    let tagged = addr | 1 << DISTINGUISHING_BIT_OFFSET | (index as u64) << 49;
    if Config::get().kernel_address_space {
        // Kernel polarity: the tag bit is cleared on watched addresses.
        !(!addr | 1 << DISTINGUISHING_BIT_OFFSET) | (index as u64) << 49
    } else {
        tagged
    }
}

/// Strip the watchpoint tag.
pub fn unwatched_address(addr: AppPc) -> AppPc {
    if Config::get().kernel_address_space {
        addr | !ADDRESS_MASK
    } else {
        addr & ADDRESS_MASK
    }
}

/// The watchpoint index of a tagged address.
pub fn watchpoint_index(addr: AppPc) -> u16 {
    (addr >> 49) as u16 & 0x7fff
}

/// Client hooks bound at the pass's label points. The address register
/// holds the still-tagged effective address when the hook's insertion
/// point executes.
pub trait Watcher: Send + Sync {
    fn visit_read(&self, ls: &mut InstrList, label: InstrId, addr: Register);
    fn visit_write(&self, ls: &mut InstrList, label: InstrId, addr: Register);
}

/// The pass itself. Register one per policy via
/// [`crate::register_policy`].
pub struct WatchpointPass {
    watcher: Option<Arc<dyn Watcher>>,
}

impl WatchpointPass {
    pub fn new() -> Self {
        WatchpointPass { watcher: None }
    }

    pub fn with_watcher(watcher: Arc<dyn Watcher>) -> Self {
        WatchpointPass {
            watcher: Some(watcher),
        }
    }
}

impl Default for WatchpointPass {
    fn default() -> Self {
        Self::new()
    }
}

/// One discovered memory operand and how it may be rewritten.
struct Candidate {
    /// The operand can be redirected through a scratch register.
    can_replace: bool,
    is_write: bool,
}

/// Register acquisition for one instrumented instruction: `live` tracks
/// block liveness (zombies are free), `used` tracks the instruction's
/// own registers and prior claims (spills must avoid both).
struct Tracker {
    live: RegisterManager,
    used: RegisterManager,
}

impl Tracker {
    fn get_zombie(&mut self, scale: RegScale) -> Option<Register> {
        loop {
            let reg = self.live.get_zombie()?;
            if self.used.is_dead(reg) {
                self.used.revive(reg);
                let i = gpr_index(reg).unwrap();
                return Some(gpr_scaled(i, scale));
            }
        }
    }

    fn get_spill(&mut self, scale: RegScale) -> Option<Register> {
        let reg = self.used.get_zombie()?;
        self.live.revive(reg);
        let i = gpr_index(reg).unwrap();
        Some(gpr_scaled(i, scale))
    }
}

impl InstrumentationPass for WatchpointPass {
    fn instrument(&self, _cpu: &mut CpuState, _bb: &mut BasicBlockState, ls: &mut InstrList) {
        let config = Config::get();
        let ids = ls.ids();

        // Backward scans: carry-flag needs and register liveness at each
        // instruction.
        let mut carry = vec![CarryFlagState::default(); ids.len()];
        let mut next_reads_cf = true;
        let mut live = vec![RegisterManager::new(); ids.len()];
        let mut rm = RegisterManager::new();
        for (i, &id) in ids.iter().enumerate().rev() {
            let instr = ls.get(id);
            if instr.is_machine() {
                carry[i] = track_carry_flag(instr, &mut next_reads_cf);
            }
            live[i] = rm.clone();
            if instr.is_machine() {
                rm.visit(instr.machine());
            }
        }

        for (i, &id) in ids.iter().enumerate() {
            let instr = ls.get(id);
            if !instr.is_machine() || instr.is_mangled() || instr.is_cti() {
                continue;
            }
            let machine = *instr.machine();
            let Some(candidate) = find_memory_operand(&machine, config) else {
                continue;
            };

            let mut tracker = Tracker {
                live: live[i].clone(),
                used: {
                    let mut used = RegisterManager::new();
                    used.kill_all();
                    used.revive_used(&machine);
                    used
                },
            };

            let target = if machine.mnemonic() == Mnemonic::Push {
                // PUSH from watched memory touches the slot it creates;
                // emulate it with a load so the operand becomes
                // replaceable.
                rewrite_push(ls, id, &mut tracker)
            } else {
                id
            };
            let candidate = if machine.mnemonic() == Mnemonic::Push {
                Candidate {
                    can_replace: true,
                    is_write: false,
                }
            } else {
                candidate
            };

            self.visit_operand(ls, target, &candidate, &mut tracker, carry[i], config);
        }
    }
}

impl WatchpointPass {
    /// Wrap one memory operand in the tag test. Everything inserted
    /// before the `before` label runs ahead of the instruction; the
    /// restores inserted before `after` run behind it. Spills are
    /// balanced: each push gets exactly one pop, in reverse order.
    fn visit_operand(
        &self,
        ls: &mut InstrList,
        id: InstrId,
        candidate: &Candidate,
        tracker: &mut Tracker,
        carry: CarryFlagState,
        config: &Config,
    ) {
        let machine = *ls.get(id).machine();
        let before_label = ls.new_label();
        let after_label = ls.new_label();
        let before = ls.insert_before(id, Instr::label(before_label));
        let after = ls.insert_after(id, Instr::label(after_label));

        // Carry-flag rescue, when the surrounding code still needs it.
        let mut spilled_cf = false;
        let cf_reg = if carry.restore_before || carry.restore_after {
            let reg = tracker.get_zombie(RegScale::Byte).or_else(|| {
                spilled_cf = true;
                tracker.get_spill(RegScale::Byte)
            });
            let reg = reg.expect("no register for carry flag save");
            if spilled_cf {
                let full = gpr_scaled(gpr_index(reg).unwrap(), RegScale::Qword);
                ls.insert_before(before, Instr::synth_mangled(push_reg(full)));
            }
            ls.insert_before(
                before,
                Instr::synth_mangled(
                    Instruction::with1(Code::Setb_rm8, reg).expect("setb"),
                ),
            );
            Some(reg)
        } else {
            None
        };

        // Scratch register for the effective address, 16-bit capable so
        // the mask can be stored through its word form.
        let mut spilled_op = false;
        let addr16 = tracker
            .get_zombie(RegScale::Word)
            .or_else(|| {
                spilled_op = true;
                tracker.get_spill(RegScale::Word)
            })
            .expect("no register for watched address");
        let idx = gpr_index(addr16).unwrap();
        let addr = gpr_scaled(idx, RegScale::Qword);
        if spilled_op {
            ls.insert_before(before, Instr::synth_mangled(push_reg(addr)));
        }

        // The effective address; XLAT may only carry the tag in its base.
        let ea = if machine.mnemonic() == Mnemonic::Xlatb
            || gpr_index(machine.memory_index()).is_none()
        {
            MemoryOperand::with_base(machine.memory_base())
        } else {
            MemoryOperand::new(
                machine.memory_base(),
                machine.memory_index(),
                machine.memory_index_scale(),
                machine.memory_displacement64() as i64,
                1,
                false,
                Register::None,
            )
        };
        ls.insert_before(
            before,
            Instr::synth_mangled(
                Instruction::with2(Code::Lea_r64_m, addr, ea).expect("lea ea"),
            ),
        );
        ls.insert_before(
            before,
            Instr::synth_mangled(
                Instruction::with2(Code::Bt_rm64_imm8, addr, DISTINGUISHING_BIT_OFFSET)
                    .expect("bt"),
            ),
        );

        // Which register must end up holding the unwatched address.
        let base = machine.memory_base();
        let masked = if candidate.can_replace { addr } else { base };
        if !candidate.can_replace {
            assert!(
                gpr_index(base).is_some(),
                "implicit watched operand without a base register"
            );
            // Save the original base on both paths so the write-back
            // after the instruction is path-independent. MOV leaves the
            // BT carry untouched.
            ls.insert_before(before, Instr::synth_mangled(mov_reg(addr, base)));
        }

        // Skip the watched-path work when the tag bit says unwatched.
        let not_watched = ls.new_label();
        let skip_code = if config.kernel_address_space {
            Code::Jb_rel32_64
        } else {
            Code::Jae_rel32_64
        };
        ls.insert_before(
            before,
            Instr::synth_branch(
                Instruction::with_branch(skip_code, 0).expect("skip jcc"),
                not_watched,
            ),
        );

        // Client attachment point: the tagged effective address is in
        // `addr` on both operand shapes.
        let client_label = ls.new_label();
        let label = ls.insert_before(before, Instr::label(client_label));
        if let Some(watcher) = &self.watcher {
            if candidate.is_write {
                watcher.visit_write(ls, label, addr);
            } else {
                watcher.visit_read(ls, label, addr);
            }
        }

        // Mask the high-order bits: byte-reverse, store the fill through
        // the 16-bit form, reverse back.
        let masked64 = gpr_scaled(gpr_index(masked).unwrap(), RegScale::Qword);
        let masked16 = gpr_scaled(gpr_index(masked).unwrap(), RegScale::Word);
        let fill: u32 = if config.kernel_address_space { 0xffff } else { 0 };
        ls.insert_before(
            before,
            Instr::synth_mangled(
                Instruction::with1(Code::Bswap_r64, masked64).expect("bswap"),
            ),
        );
        ls.insert_before(
            before,
            Instr::synth_mangled(
                Instruction::with2(Code::Mov_r16_imm16, masked16, fill).expect("mov mask"),
            ),
        );
        ls.insert_before(
            before,
            Instr::synth_mangled(
                Instruction::with1(Code::Bswap_r64, masked64).expect("bswap"),
            ),
        );
        ls.insert_before(before, Instr::label(not_watched));

        // Restore the carry flag before the instruction consumes it.
        if carry.restore_before {
            let cf = cf_reg.unwrap();
            ls.insert_before(
                before,
                Instr::synth_mangled(
                    Instruction::with2(Code::Shr_rm8_imm8, cf, 1u32).expect("shr cf"),
                ),
            );
        }

        // Redirect the operand through the computed address.
        if candidate.can_replace {
            let in_mut = ls.get_mut(id);
            let m = in_mut.machine_mut();
            m.set_memory_base(addr);
            m.set_memory_index(Register::None);
            m.set_memory_index_scale(1);
            m.set_memory_displacement64(0);
            m.set_memory_displ_size(0);
        }

        // Post-instruction restores, reverse order of the saves.
        if !candidate.can_replace {
            ls.insert_before(after, Instr::synth_mangled(mov_reg(base, addr)));
        }
        if spilled_op {
            ls.insert_before(after, Instr::synth_mangled(pop_reg(addr)));
        }
        if carry.restore_after {
            let cf = cf_reg.unwrap();
            ls.insert_before(
                after,
                Instr::synth_mangled(
                    Instruction::with2(Code::Shr_rm8_imm8, cf, 1u32).expect("shr cf"),
                ),
            );
        }
        if spilled_cf {
            let cf = cf_reg.unwrap();
            let full = gpr_scaled(gpr_index(cf).unwrap(), RegScale::Qword);
            ls.insert_before(after, Instr::synth_mangled(pop_reg(full)));
        }
    }
}

/// Replace `push [mem]` with a load into a scratch register and a push
/// of the register, returning the id of the load (which then carries
/// the instrumentable operand).
fn rewrite_push(ls: &mut InstrList, id: InstrId, tracker: &mut Tracker) -> InstrId {
    let machine = *ls.get(id).machine();
    let mem = MemoryOperand::new(
        machine.memory_base(),
        machine.memory_index(),
        machine.memory_index_scale(),
        machine.memory_displacement64() as i64,
        1,
        false,
        machine.segment_prefix(),
    );
    if let Some(reg) = tracker.get_zombie(RegScale::Qword) {
        let load = ls.insert_before(
            id,
            Instr::synth(
                Instruction::with2(Code::Mov_r64_rm64, reg, mem).expect("push load"),
            ),
        );
        ls.insert_before(id, Instr::synth_mangled(push_reg(reg)));
        ls.get_mut(load).pc = ls.get(id).pc;
        ls.remove(id);
        load
    } else {
        let reg = tracker
            .get_spill(RegScale::Qword)
            .expect("no spill register for push emulation");
        ls.insert_before(id, Instr::synth_mangled(lea_rsp(-8)));
        ls.insert_before(id, Instr::synth_mangled(push_reg(reg)));
        let load = ls.insert_before(
            id,
            Instr::synth(
                Instruction::with2(Code::Mov_r64_rm64, reg, mem).expect("push load"),
            ),
        );
        ls.insert_before(
            id,
            Instr::synth_mangled(crate::mangle::mov_store(
                MemoryOperand::with_base_displ(Register::RSP, 8),
                reg,
            )),
        );
        ls.insert_before(id, Instr::synth_mangled(pop_reg(reg)));
        ls.get_mut(load).pc = ls.get(id).pc;
        ls.remove(id);
        load
    }
}

/// Decide whether an instruction's memory operand is a watchpoint
/// candidate and how it may be rewritten.
fn find_memory_operand(machine: &Instruction, config: &Config) -> Option<Candidate> {
    let mut has_mem = false;
    for i in 0..machine.op_count() {
        if machine.op_kind(i) == OpKind::Memory {
            has_mem = true;
        }
    }
    if !has_mem || machine.is_ip_rel_memory_operand() {
        return None;
    }
    // Segmented addresses are generally not linear addresses.
    if matches!(machine.segment_prefix(), Register::FS | Register::GS) {
        return None;
    }

    let base = machine.memory_base();
    let index = machine.memory_index();
    let base_idx = gpr_index(base);
    let index_idx = gpr_index(index);
    if base_idx.is_none() && index_idx.is_none() {
        return None;
    }
    // The stack pointer never carries a watched address; implicit
    // stack operands (push/pop/call/ret) are excluded with it.
    if base == Register::RSP || index == Register::RSP {
        return None;
    }
    if config.wp_ignore_frame_pointer && (base == Register::RBP || index == Register::RBP) {
        return None;
    }
    // Only 64-bit addressing can hold a tag.
    if base != Register::None && base.size() != 8 {
        return None;
    }

    let num_regs = base_idx.is_some() as u32 + index_idx.is_some() as u32;

    let can_replace = if machine.mnemonic() == Mnemonic::Xlatb {
        // XLAT's operand is implicit; only RBX may carry the tag.
        false
    } else if base_idx.is_none() {
        // Index-only operands have no base to write back through.
        true
    } else if matches!(
        machine.mnemonic(),
        Mnemonic::Mov | Mnemonic::Add | Mnemonic::Sub | Mnemonic::Inc | Mnemonic::Dec
    ) {
        true
    } else if num_regs == 2 {
        true
    } else if is_high_gpr(base) || is_high_gpr(index) {
        true
    } else {
        machine.memory_displacement64() != 0 || machine.memory_index_scale() > 1
    };

    let mut factory = InstructionInfoFactory::new();
    let info = factory.info(machine);
    let is_write = info.used_memory().iter().any(|m| {
        matches!(
            m.access(),
            OpAccess::Write | OpAccess::ReadWrite | OpAccess::CondWrite | OpAccess::ReadCondWrite
        )
    });

    Some(Candidate {
        can_replace,
        is_write,
    })
}

// ---------------------------------------------------------------------------
// Bounds watcher: a small real client of the label hooks
// ---------------------------------------------------------------------------

/// Rust side of the bounds report. The generated leaf passes the tagged
/// address straight through.
pub extern "C" fn weft_wp_report(addr: u64, is_write: u64) {
    tracing::warn!(
        addr,
        index = watchpoint_index(addr),
        is_write = is_write != 0,
        "watched access"
    );
}

/// A watcher that reports every watched access through the module
/// logger, the minimal bounds-checking client.
pub struct BoundsWatcher {
    leaf: AppPc,
}

impl BoundsWatcher {
    pub fn new() -> Self {
        BoundsWatcher {
            leaf: report_leaf(),
        }
    }

    fn emit_call(&self, ls: &mut InstrList, label: InstrId, addr: Register, is_write: bool) {
        // The leaf preserves every register and the flags; only the two
        // argument registers need staging here.
        let mut at = ls.insert_after(label, Instr::synth_mangled(lea_rsp(-REDZONE_SIZE)));
        at = ls.insert_after(at, Instr::synth_mangled(push_reg(Register::RDI)));
        at = ls.insert_after(at, Instr::synth_mangled(push_reg(Register::RSI)));
        if addr != Register::RDI {
            at = ls.insert_after(at, Instr::synth_mangled(mov_reg(Register::RDI, addr)));
        }
        at = ls.insert_after(
            at,
            Instr::synth_mangled(
                Instruction::with2(
                    Code::Mov_r32_imm32,
                    Register::ESI,
                    if is_write { 1u32 } else { 0u32 },
                )
                .expect("mov esi"),
            ),
        );
        at = ls.insert_after(
            at,
            Instr::synth_mangled(
                Instruction::with_branch(Code::Call_rel32_64, self.leaf).expect("call leaf"),
            ),
        );
        at = ls.insert_after(at, Instr::synth_mangled(pop_reg(Register::RSI)));
        at = ls.insert_after(at, Instr::synth_mangled(pop_reg(Register::RDI)));
        ls.insert_after(at, Instr::synth_mangled(lea_rsp(REDZONE_SIZE)));
    }
}

impl Default for BoundsWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Watcher for BoundsWatcher {
    fn visit_read(&self, ls: &mut InstrList, label: InstrId, addr: Register) {
        self.emit_call(ls, label, addr, false);
    }

    fn visit_write(&self, ls: &mut InstrList, label: InstrId, addr: Register) {
        self.emit_call(ls, label, addr, true);
    }
}

/// The report leaf: save everything, call [`weft_wp_report`], restore.
fn report_leaf() -> AppPc {
    use dynasmrt::{dynasm, DynasmApi};
    static LEAF: std::sync::OnceLock<AppPc> = std::sync::OnceLock::new();
    *LEAF.get_or_init(|| {
        let report = weft_wp_report as extern "C" fn(u64, u64) as usize as i64;
        let mut ops =
            dynasmrt::VecAssembler::<dynasmrt::x64::X64Relocation>::new(0);
        dynasm!(ops
            ; .arch x64
            ; pushfq
            ; cld
            ; push rax
            ; push rcx
            ; push rdx
            ; push rbp
            ; push r8
            ; push r9
            ; push r10
            ; push r11
            ; mov rbp, rsp
            ; and rsp, -16
            ; mov rax, QWORD report
            ; call rax
            ; mov rsp, rbp
            ; pop r11
            ; pop r10
            ; pop r9
            ; pop r8
            ; pop rbp
            ; pop rdx
            ; pop rcx
            ; pop rax
            ; popfq
            ; ret
        );
        let code = ops.finalize().expect("report leaf assembly");
        crate::state::GlobalState::get().stub_arena.alloc_bytes(&code)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions};

    fn decode(bytes: &[u8]) -> Instruction {
        Decoder::with_ip(64, bytes, 0x1000, DecoderOptions::NONE).decode()
    }

    #[test]
    fn tagging_round_trip() {
        let addr = 0x7f12_3456_7890u64;
        let tagged = tag_address(addr, 0x123);
        assert_ne!(tagged, addr);
        assert_eq!(unwatched_address(tagged), addr);
        assert_eq!(watchpoint_index(tagged), 0x123);
    }

    #[test]
    fn candidate_classification() {
        let config = Config::default();

        // mov rax, [rbx]: simple mnemonic, replaceable.
        let c = find_memory_operand(&decode(&[0x48, 0x8b, 0x03]), &config).unwrap();
        assert!(c.can_replace);
        assert!(!c.is_write);

        // mov [rbx], rax: a write.
        let c = find_memory_operand(&decode(&[0x48, 0x89, 0x03]), &config).unwrap();
        assert!(c.is_write);

        // cmpxchg [rcx+rdx], rax: two registers, replaceable.
        let c = find_memory_operand(&decode(&[0x48, 0x0f, 0xb1, 0x04, 0x11]), &config).unwrap();
        assert!(c.can_replace);

        // or [r8], rax: high register, replaceable.
        let c = find_memory_operand(&decode(&[0x49, 0x09, 0x00]), &config).unwrap();
        assert!(c.can_replace);

        // push [rsp+8]: stack operands are never candidates.
        assert!(find_memory_operand(&decode(&[0xff, 0x74, 0x24, 0x08]), &config).is_none());

        // mov rax, fs:[0x10]: segmented, skipped.
        assert!(find_memory_operand(
            &decode(&[0x64, 0x48, 0x8b, 0x04, 0x25, 0x10, 0x00, 0x00, 0x00]),
            &config
        )
        .is_none());

        // mov eax, [ebx] (32-bit addressing) cannot hold a tag.
        assert!(find_memory_operand(&decode(&[0x67, 0x8b, 0x03]), &config).is_none());
    }

    #[test]
    fn frame_pointer_exclusion_is_config_driven() {
        // or [rbp+0x10], rax: single low register with displacement.
        let bytes = [0x48, 0x09, 0x45, 0x10];
        let mut config = Config::default();
        assert!(find_memory_operand(&decode(&bytes), &config).is_some());
        config.wp_ignore_frame_pointer = true;
        assert!(find_memory_operand(&decode(&bytes), &config).is_none());
    }
}
