//! Indirect control transfers through the IBL: register-target jumps
//! and calls, shared pre-entry stubs, and per-policy variants sharing
//! one translation.

mod common;

use common::{const_fn, NativeFn};
use weft::policy::{MangledAddress, Policy};

fn mov_rax_rdi_jmp_rax() -> NativeFn {
    NativeFn::new(vec![
        0x48, 0x89, 0xf8, // mov rax, rdi
        0xff, 0xe0, // jmp rax
    ])
}

#[test]
fn indirect_jmp_reaches_translated_target() {
    common::setup();
    let f = mov_rax_rdi_jmp_rax();
    let h9 = const_fn(9);
    let h23 = const_fn(23);

    assert_eq!(f.call(Policy::NULL, h9.pc()), 9);
    // Same pre-entry stub, different runtime target.
    assert_eq!(f.call(Policy::NULL, h23.pc()), 23);
    // Warm path through the inline probes.
    assert_eq!(f.call(Policy::NULL, h9.pc()), 9);
    assert_eq!(f.call(Policy::NULL, h23.pc()), 23);
}

#[test]
fn indirect_call_returns_through_link_slot() {
    common::setup();
    // mov rax, rdi; call rax; add rax, 1; ret
    let f = NativeFn::new(vec![
        0x48, 0x89, 0xf8, // mov rax, rdi
        0xff, 0xd0, // call rax
        0x48, 0x83, 0xc0, 0x01, // add rax, 1
        0xc3, // ret
    ]);
    let h = const_fn(41);
    assert_eq!(f.call(Policy::NULL, h.pc()), 42);
    assert_eq!(f.call(Policy::NULL, h.pc()), 42);
}

#[test]
fn policy_variants_share_the_base_translation() {
    common::setup();
    let h = const_fn(7);

    // Translate once under the plain policy, then ask for the same
    // target as an indirect-branch target. The variant entry must be an
    // exit stub, distinct from the block, while the block itself is
    // shared.
    let base = weft::translate(h.pc(), Policy::NULL);

    let mut variant = Policy::NULL;
    variant.set_indirect_cti_target(true);
    let wrapped = weft::translate(h.pc(), variant);
    assert_ne!(wrapped, base);

    let global = &weft::state::GlobalState::get().code_cache;
    let base_key = MangledAddress::new(h.pc(), Policy::NULL);
    let variant_key = MangledAddress::new(h.pc(), variant);
    assert_eq!(global.load(base_key.as_u64()), Some(base));
    assert_eq!(global.load(variant_key.as_u64()), Some(wrapped));
    // The variant's base form resolves to the shared block.
    assert_eq!(variant_key.base().as_u64(), base_key.as_u64());

    // Repeated lookups are stable (invariant: one translation per base
    // fingerprint).
    assert_eq!(weft::translate(h.pc(), Policy::NULL), base);
    assert_eq!(weft::translate(h.pc(), variant), wrapped);
}
