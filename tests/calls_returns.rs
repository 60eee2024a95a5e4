//! Calls and returns: the return-address geometry, the cache-resident
//! return fast path, and the IBL table hit path for the final detach.
//!
//! Single test function: the assertions compare perf-counter deltas,
//! which only mean something when nothing else translates concurrently.

mod common;

use common::NativeFn;
use weft::policy::Policy;

#[test]
fn call_and_return_through_the_cache() {
    common::setup();
    // caller: call callee; add rax, 1; ret
    // callee: mov rax, 41; ret
    let f = NativeFn::new(vec![
        0xe8, 0x07, 0x00, 0x00, 0x00, // call +7
        0x48, 0x83, 0xc0, 0x01, // add rax, 1
        0xc3, // ret
        0x90, 0x90, // pad
        0x48, 0xc7, 0xc0, 0x29, 0x00, 0x00, 0x00, // callee: mov rax, 41
        0xc3, // ret
    ]);

    assert_eq!(f.call(Policy::NULL, 0), 42);

    // The callee's return address points at the caller's link slot; the
    // block sentinel makes the return fast path recognise it, so the
    // inner return never reaches the IBL slow path again. The outer
    // return resolves through the IBL table once its exit stub exists.
    let warm = weft::perf::read("IBL_SLOW_ENTRIES");
    assert_eq!(f.call(Policy::NULL, 0), 42);
    let after_second = weft::perf::read("IBL_SLOW_ENTRIES");
    assert_eq!(f.call(Policy::NULL, 0), 42);
    let after_third = weft::perf::read("IBL_SLOW_ENTRIES");

    // By the third call every lookup is served by patched slots, the
    // return fast path, or the inline IBL probes.
    assert_eq!(after_third, after_second, "warm calls must avoid the slow path");
    assert!(after_second <= warm + 1);

    // The caller block ends with the call-return geometry: a block
    // header magic sits eight bytes past the call's return address.
    let entry = weft::translate(f.pc(), Policy::NULL);
    let (call_ip, _) = common::find_code(entry, 32, iced_x86::Code::Call_rel32_64)
        .expect("patched call in caller block");
    let ret_addr = call_ip + 5;
    assert_eq!(ret_addr % 8, 0, "return address must land on the slot boundary");
    assert!(weft::cache::is_code_cache_address(ret_addr));
}
