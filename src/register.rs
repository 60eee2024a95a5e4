//! Register liveness bookkeeping.
//!
//! The manager tracks the sixteen general-purpose registers and the
//! sixteen XMM registers as live or dead. The mangler and the
//! watchpoints pass use it to find "zombies": dead registers they can
//! clobber without spilling. RSP is never handed out.

use iced_x86::{Instruction, InstructionInfoFactory, OpAccess, Register};

/// Operand scale for register acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegScale {
    Byte,
    Word,
    Dword,
    Qword,
}

impl RegScale {
    pub fn from_bytes(bytes: usize) -> RegScale {
        match bytes {
            1 => RegScale::Byte,
            2 => RegScale::Word,
            4 => RegScale::Dword,
            8 => RegScale::Qword,
            other => panic!("no register scale for {other}-byte operand"),
        }
    }
}

const GPR64: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

const GPR32: [Register; 16] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESP,
    Register::EBP,
    Register::ESI,
    Register::EDI,
    Register::R8D,
    Register::R9D,
    Register::R10D,
    Register::R11D,
    Register::R12D,
    Register::R13D,
    Register::R14D,
    Register::R15D,
];

const GPR16: [Register; 16] = [
    Register::AX,
    Register::CX,
    Register::DX,
    Register::BX,
    Register::SP,
    Register::BP,
    Register::SI,
    Register::DI,
    Register::R8W,
    Register::R9W,
    Register::R10W,
    Register::R11W,
    Register::R12W,
    Register::R13W,
    Register::R14W,
    Register::R15W,
];

const GPR8: [Register; 16] = [
    Register::AL,
    Register::CL,
    Register::DL,
    Register::BL,
    Register::SPL,
    Register::BPL,
    Register::SIL,
    Register::DIL,
    Register::R8L,
    Register::R9L,
    Register::R10L,
    Register::R11L,
    Register::R12L,
    Register::R13L,
    Register::R14L,
    Register::R15L,
];

const RSP_INDEX: usize = 4;

/// Index of a general-purpose register in RAX..R15 order, for any width
/// form of it. AH/CH/DH/BH map to their containing register.
pub fn gpr_index(reg: Register) -> Option<usize> {
    let full = reg.full_register();
    GPR64.iter().position(|&r| r == full)
}

/// The `scale`-wide form of the general-purpose register at `index`.
pub fn gpr_scaled(index: usize, scale: RegScale) -> Register {
    match scale {
        RegScale::Byte => GPR8[index],
        RegScale::Word => GPR16[index],
        RegScale::Dword => GPR32[index],
        RegScale::Qword => GPR64[index],
    }
}

/// True for R8..R15 in any width form. These are never implicit operands
/// of an instruction, so an operand using one can be rewritten freely.
pub fn is_high_gpr(reg: Register) -> bool {
    matches!(gpr_index(reg), Some(i) if i >= 8)
}

fn xmm_index(reg: Register) -> Option<usize> {
    let n = reg as u32;
    let base = Register::XMM0 as u32;
    if (base..base + 16).contains(&n) {
        Some((n - base) as usize)
    } else {
        None
    }
}

/// Live/dead state over the register file. Fresh managers consider every
/// register live (unavailable); `kill` marks dead, `revive` marks live,
/// and the zombie getters claim a dead register and hand it back.
#[derive(Clone)]
pub struct RegisterManager {
    live_gpr: u16,
    live_xmm: u16,
}

impl RegisterManager {
    pub fn new() -> Self {
        RegisterManager {
            live_gpr: 0xffff,
            live_xmm: 0xffff,
        }
    }

    pub fn kill_all(&mut self) {
        self.live_gpr = 0;
        self.live_xmm = 0;
    }

    pub fn revive_all(&mut self) {
        self.live_gpr = 0xffff;
        self.live_xmm = 0xffff;
    }

    pub fn revive_all_xmm(&mut self) {
        self.live_xmm = 0xffff;
    }

    pub fn kill(&mut self, reg: Register) {
        if let Some(i) = gpr_index(reg) {
            self.live_gpr &= !(1 << i);
        } else if let Some(i) = xmm_index(reg) {
            self.live_xmm &= !(1 << i);
        }
    }

    pub fn revive(&mut self, reg: Register) {
        if let Some(i) = gpr_index(reg) {
            self.live_gpr |= 1 << i;
        } else if let Some(i) = xmm_index(reg) {
            self.live_xmm |= 1 << i;
        }
    }

    pub fn is_live(&self, reg: Register) -> bool {
        if let Some(i) = gpr_index(reg) {
            self.live_gpr & (1 << i) != 0
        } else if let Some(i) = xmm_index(reg) {
            self.live_xmm & (1 << i) != 0
        } else {
            true
        }
    }

    pub fn is_dead(&self, reg: Register) -> bool {
        !self.is_live(reg)
    }

    /// Kill the registers named by a memory operand (base and index).
    pub fn kill_mem_operand(&mut self, instr: &Instruction) {
        if instr.memory_base() != Register::None {
            self.kill(instr.memory_base());
        }
        if instr.memory_index() != Register::None {
            self.kill(instr.memory_index());
        }
    }

    /// Revive every register the instruction touches.
    pub fn revive_used(&mut self, instr: &Instruction) {
        let mut factory = InstructionInfoFactory::new();
        for used in factory.info(instr).used_registers() {
            self.revive(used.register());
        }
    }

    /// Update liveness across `instr`: registers it writes die, then
    /// registers it reads come back to life. Writes narrower than 32
    /// bits merge with the old value, so they count as reads.
    pub fn visit(&mut self, instr: &Instruction) {
        let mut factory = InstructionInfoFactory::new();
        let info = factory.info(instr);
        for used in info.used_registers() {
            if used.access() == OpAccess::Write && used.register().size() >= 4 {
                self.kill(used.register());
            }
        }
        for used in info.used_registers() {
            match used.access() {
                OpAccess::Read
                | OpAccess::CondRead
                | OpAccess::ReadWrite
                | OpAccess::ReadCondWrite
                | OpAccess::CondWrite => self.revive(used.register()),
                OpAccess::Write if used.register().size() < 4 => self.revive(used.register()),
                _ => {}
            }
        }
    }

    /// Claim a dead general-purpose register, 64-bit form. Never RSP.
    pub fn get_zombie(&mut self) -> Option<Register> {
        for i in 0..16 {
            if i == RSP_INDEX {
                continue;
            }
            if self.live_gpr & (1 << i) == 0 {
                self.live_gpr |= 1 << i;
                return Some(GPR64[i]);
            }
        }
        None
    }

    /// Claim a dead general-purpose register in the given width form.
    pub fn get_zombie_scaled(&mut self, scale: RegScale) -> Option<Register> {
        let reg = self.get_zombie()?;
        let i = gpr_index(reg).unwrap();
        Some(gpr_scaled(i, scale))
    }

    /// Claim a dead XMM register.
    pub fn get_zombie_xmm(&mut self) -> Option<Register> {
        for i in 0..16 {
            if self.live_xmm & (1 << i) == 0 {
                self.live_xmm |= 1 << i;
                return Some(Register::XMM0 + i as u32);
            }
        }
        None
    }
}

impl Default for RegisterManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::Code;

    #[test]
    fn scaling_round_trips() {
        for i in 0..16 {
            for scale in [RegScale::Byte, RegScale::Word, RegScale::Dword, RegScale::Qword] {
                let scaled = gpr_scaled(i, scale);
                assert_eq!(gpr_index(scaled), Some(i), "index {i} scale {scale:?}");
            }
        }
        assert_eq!(gpr_index(Register::AH), Some(0));
        assert_eq!(gpr_index(Register::BH), Some(3));
        assert_eq!(gpr_index(Register::XMM3), None);
    }

    #[test]
    fn zombies_never_include_rsp() {
        let mut rm = RegisterManager::new();
        rm.kill_all();
        let mut seen = Vec::new();
        while let Some(r) = rm.get_zombie() {
            seen.push(r);
        }
        assert_eq!(seen.len(), 15);
        assert!(!seen.contains(&Register::RSP));
    }

    #[test]
    fn zombie_claims_are_not_repeated() {
        let mut rm = RegisterManager::new();
        rm.kill(Register::RBX);
        rm.kill(Register::R12);
        let a = rm.get_zombie().unwrap();
        let b = rm.get_zombie().unwrap();
        assert_ne!(a, b);
        assert!(rm.get_zombie().is_none());
    }

    #[test]
    fn visit_kills_pure_writes_and_revives_reads() {
        // mov rbx, rcx: rbx dies as a destination, rcx is read.
        let instr =
            Instruction::with2(Code::Mov_r64_rm64, Register::RBX, Register::RCX).unwrap();
        let mut rm = RegisterManager::new();
        rm.revive_all();
        rm.visit(&instr);
        assert!(rm.is_dead(Register::RBX));
        assert!(rm.is_live(Register::RCX));
    }

    #[test]
    fn mem_operand_registers_enumerate_via_zombies() {
        use iced_x86::MemoryOperand;
        // mov rax, [rbx + rcx*2 + 8]
        let mem = MemoryOperand::new(Register::RBX, Register::RCX, 2, 8, 1, false, Register::None);
        let instr = Instruction::with2(Code::Mov_r64_rm64, Register::RAX, mem).unwrap();
        let mut rm = RegisterManager::new();
        rm.kill_mem_operand(&instr);
        let mut regs = Vec::new();
        while let Some(r) = rm.get_zombie() {
            regs.push(r);
        }
        assert_eq!(regs.len(), 2);
        assert!(regs.contains(&Register::RBX));
        assert!(regs.contains(&Register::RCX));
    }
}
