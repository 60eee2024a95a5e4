//! Host-context resolution in a kernel address space: targets outside
//! the registered module ranges either force a detach (the policy was
//! not in host context and does not auto-instrument) or translate under
//! host context (auto-instrumented lookups arrive with the host bit set
//! by the mangler).
//!
//! Single test function: the cases share the module registry and the
//! global cache, so their order matters.

mod common;

use common::NativeFn;
use weft::policy::{MangledAddress, Policy};

/// A genuine host routine: native code outside every registered module.
extern "C" fn host_add(x: u64) -> u64 {
    x + 9
}

/// `mov rax, rdi; mov rdi, 33; call rax; add rax, 1; ret`
fn call_through_rax() -> NativeFn {
    NativeFn::new(vec![
        0x48, 0x89, 0xf8, // mov rax, rdi
        0x48, 0xc7, 0xc7, 0x21, 0x00, 0x00, 0x00, // mov rdi, 33
        0xff, 0xd0, // call rax
        0x48, 0x83, 0xc0, 0x01, // add rax, 1
        0xc3, // ret
    ])
}

#[test]
fn host_targets_detach_or_auto_instrument() {
    weft::init_with(weft::config::Config {
        kernel_address_space: true,
        ..weft::config::Config::default()
    });
    let region = weft::alloc::CacheRegion::get();
    let global = &weft::state::GlobalState::get().code_cache;
    let host_pc = host_add as extern "C" fn(u64) -> u64 as usize as u64;

    // Registered modules are the instrumented app; everything else,
    // including host_add and the harness, is host code.
    let f_plain = call_through_rax();
    let f_auto = call_through_rax();
    let (start, end) = f_plain.range();
    weft::host::notify_module_load("app-plain", start, end);
    let (start, end) = f_auto.range();
    weft::host::notify_module_load("app-auto", start, end);

    // A host target looked up outside host context forces a detach: the
    // lookup yields the raw native PC and builds nothing.
    let h1 = common::const_fn(1);
    assert_eq!(weft::translate(h1.pc(), Policy::NULL), h1.pc());

    // The same lookup already in host context translates normally.
    let h2 = common::const_fn(2);
    let mut in_host = Policy::NULL;
    in_host.set_in_host_context(true);
    let t2 = weft::translate(h2.pc(), in_host);
    assert_ne!(t2, h2.pc());
    assert!(region.contains(t2));

    // End to end, no auto-instrumentation: the app block's indirect call
    // detaches into host_add, which runs natively and returns into the
    // cache through the link slot.
    assert_eq!(f_plain.call(Policy::NULL, host_pc), 43);
    assert_eq!(f_plain.call(Policy::NULL, host_pc), 43);

    // The detach outcome is recorded under the host-context base form
    // of the fingerprint: the raw native PC, not a translation.
    let mut plain_base = Policy::NULL;
    plain_base.set_in_host_context(true);
    let plain_key = MangledAddress::new(host_pc, plain_base);
    assert_eq!(global.load(plain_key.as_u64()), Some(host_pc));

    // With host-auto-instrument set, the mangler converts the target
    // policy into host context and the same call translates host_add
    // into the cache instead of detaching.
    let mut auto = Policy::NULL;
    auto.set_host_auto_instrument(true);
    assert_eq!(f_auto.call(auto, host_pc), 43);
    assert_eq!(f_auto.call(auto, host_pc), 43);

    let mut auto_base = auto;
    auto_base.set_in_host_context(true);
    let auto_key = MangledAddress::new(host_pc, auto_base);
    let translated_host = global
        .load(auto_key.as_u64())
        .expect("auto-instrumented host target must be translated");
    assert_ne!(translated_host, host_pc);
    assert!(region.contains(translated_host));
}
