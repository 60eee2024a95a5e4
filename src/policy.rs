//! Instrumentation policies and mangled addresses.
//!
//! A policy is a stable identity (which client pass instruments blocks
//! translated under it) plus a bag of boolean properties that travel with
//! control transfers. The policy bits are packed into the low 16 bits of
//! a mangled address, the fingerprint the code cache is keyed by; the
//! other 48 bits are the native PC shifted left, which an arithmetic
//! shift right recovers losslessly for canonical x86-64 addresses.

use crate::AppPc;

/// Number of policy bits packed into a mangled address.
pub const NUM_MANGLED_BITS: u32 = 16;

const ID_MASK: u16 = 0x00ff;

const IN_HOST_CONTEXT: u16 = 1 << 8;
const HOST_AUTO_INSTRUMENT: u16 = 1 << 9;
const RETURN_TARGET: u16 = 1 << 10;
const INDIRECT_CTI_TARGET: u16 = 1 << 11;
const RETURN_ADDRESS_IN_CODE_CACHE: u16 = 1 << 12;
const BEGINS_FUNCTIONAL_UNIT: u16 = 1 << 13;

/// Properties that describe how a particular lookup was reached rather
/// than how its target must be translated. Stripping them yields the
/// base policy, under which per-policy variants share one translation.
const EPHEMERAL: u16 =
    RETURN_TARGET | INDIRECT_CTI_TARGET | RETURN_ADDRESS_IN_CODE_CACHE | BEGINS_FUNCTIONAL_UNIT;

/// How a policy crosses a control-transfer edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inherit {
    Call,
    Return,
    Jmp,
}

/// An instrumentation policy: identity plus properties, packed in 16
/// bits so it rides inside a [`MangledAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Policy(u16);

impl Policy {
    /// The null policy: no client pass, no properties.
    pub const NULL: Policy = Policy(0);

    pub fn new(id: u8) -> Self {
        Policy(id as u16)
    }

    pub fn from_bits(bits: u16) -> Self {
        Policy(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    /// The registered pass identity.
    pub fn id(self) -> u8 {
        (self.0 & ID_MASK) as u8
    }

    /// Strip the ephemeral properties.
    pub fn base(self) -> Policy {
        Policy(self.0 & !EPHEMERAL)
    }

    fn get(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    fn put(&mut self, bit: u16, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub fn is_in_host_context(self) -> bool {
        self.get(IN_HOST_CONTEXT)
    }

    pub fn set_in_host_context(&mut self, v: bool) {
        self.put(IN_HOST_CONTEXT, v)
    }

    pub fn is_host_auto_instrumented(self) -> bool {
        self.get(HOST_AUTO_INSTRUMENT)
    }

    pub fn set_host_auto_instrument(&mut self, v: bool) {
        self.put(HOST_AUTO_INSTRUMENT, v)
    }

    pub fn is_return_target(self) -> bool {
        self.get(RETURN_TARGET)
    }

    pub fn set_return_target(&mut self, v: bool) {
        self.put(RETURN_TARGET, v)
    }

    pub fn is_indirect_cti_target(self) -> bool {
        self.get(INDIRECT_CTI_TARGET)
    }

    pub fn set_indirect_cti_target(&mut self, v: bool) {
        self.put(INDIRECT_CTI_TARGET, v)
    }

    pub fn return_address_is_in_code_cache(self) -> bool {
        self.get(RETURN_ADDRESS_IN_CODE_CACHE)
    }

    pub fn set_return_address_in_code_cache(&mut self, v: bool) {
        self.put(RETURN_ADDRESS_IN_CODE_CACHE, v)
    }

    pub fn begins_functional_unit(self) -> bool {
        self.get(BEGINS_FUNCTIONAL_UNIT)
    }

    pub fn set_begins_functional_unit(&mut self, v: bool) {
        self.put(BEGINS_FUNCTIONAL_UNIT, v)
    }

    /// Whether lookups under this policy may consult the detach table.
    /// Host context never detaches again; everything else may.
    pub fn can_detach(self) -> bool {
        !self.is_in_host_context()
    }

    /// Derive the policy of a CTI target from the policy of the block
    /// containing the CTI. Deterministic, rule-based:
    ///
    /// - CALL propagates host-auto-instrument and records that the
    ///   return address now lives in the code cache.
    /// - RET leaves host context, is a return target, and forgets the
    ///   indirect/auto properties; returns never auto-instrument host
    ///   code even when the block's policy would.
    /// - JMP propagates the base properties unchanged.
    pub fn inherit(self, how: Inherit) -> Policy {
        let mut p = Policy(self.0 & (ID_MASK | IN_HOST_CONTEXT | HOST_AUTO_INSTRUMENT));
        match how {
            Inherit::Call => {
                p.set_return_address_in_code_cache(true);
            }
            Inherit::Return => {
                p.set_in_host_context(false);
                p.set_host_auto_instrument(false);
                p.set_return_target(true);
            }
            Inherit::Jmp => {}
        }
        p
    }
}

/// A native program counter bundled with the policy its translation must
/// honour. The code cache's fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MangledAddress(u64);

impl MangledAddress {
    pub fn new(pc: AppPc, policy: Policy) -> Self {
        MangledAddress((pc << NUM_MANGLED_BITS) | policy.bits() as u64)
    }

    pub fn from_u64(raw: u64) -> Self {
        MangledAddress(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Recover the native PC. Arithmetic shift, so canonical kernel
    /// addresses (high bits set) survive the round trip too.
    pub fn unmangled(self) -> AppPc {
        ((self.0 as i64) >> NUM_MANGLED_BITS) as u64
    }

    pub fn policy(self) -> Policy {
        Policy::from_bits(self.0 as u16)
    }

    /// Same PC under the base form of the policy.
    pub fn base(self) -> MangledAddress {
        MangledAddress::new(self.unmangled(), self.policy().base())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangle_round_trips() {
        let mut policy = Policy::new(7);
        policy.set_return_target(true);
        for pc in [0x40_1000u64, 0x7fff_ffff_f000, 0xffff_8000_0123_4560] {
            let m = MangledAddress::new(pc, policy);
            assert_eq!(m.unmangled(), pc);
            assert_eq!(m.policy(), policy);
        }
    }

    #[test]
    fn base_strips_ephemeral_properties_only() {
        let mut policy = Policy::new(3);
        policy.set_in_host_context(true);
        policy.set_host_auto_instrument(true);
        policy.set_return_target(true);
        policy.set_indirect_cti_target(true);
        policy.set_return_address_in_code_cache(true);
        policy.set_begins_functional_unit(true);

        let base = policy.base();
        assert_eq!(base.id(), 3);
        assert!(base.is_in_host_context());
        assert!(base.is_host_auto_instrumented());
        assert!(!base.is_return_target());
        assert!(!base.is_indirect_cti_target());
        assert!(!base.return_address_is_in_code_cache());
        assert!(!base.begins_functional_unit());

        let m = MangledAddress::new(0x1234_5678, policy);
        assert_eq!(m.base().policy(), base);
        assert_eq!(m.base().unmangled(), 0x1234_5678);
    }

    #[test]
    fn call_inheritance() {
        let mut policy = Policy::new(1);
        policy.set_host_auto_instrument(true);
        policy.set_return_target(true);

        let target = policy.inherit(Inherit::Call);
        assert_eq!(target.id(), 1);
        assert!(target.is_host_auto_instrumented());
        assert!(target.return_address_is_in_code_cache());
        assert!(!target.is_return_target());
    }

    #[test]
    fn return_inheritance() {
        let mut policy = Policy::new(1);
        policy.set_in_host_context(true);
        policy.set_host_auto_instrument(true);

        let target = policy.inherit(Inherit::Return);
        assert!(!target.is_in_host_context());
        assert!(!target.is_host_auto_instrumented());
        assert!(target.is_return_target());
        assert!(!target.is_indirect_cti_target());
    }
}
