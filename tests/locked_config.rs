//! The alternative configuration surface in one binary: mutex-guarded
//! global cache, full-flags IBL save, conservative XMM handling, and
//! returns through the IBL instead of the return fast path.

mod common;

use weft::policy::Policy;

#[test]
fn translation_works_under_the_locked_configuration() {
    weft::init_with(weft::config::Config {
        lock_global_code_cache: true,
        ibl_save_all_flags: true,
        track_xmm_regs: true,
        return_fast_path: false,
        ..weft::config::Config::default()
    });

    // Conditional edges.
    let f = common::jz_fn();
    assert_eq!(f.call(Policy::NULL, 0), 1);
    assert_eq!(f.call(Policy::NULL, 3), 0);

    // Calls and returns run entirely through the IBL return path.
    let g = common::NativeFn::new(vec![
        0xe8, 0x07, 0x00, 0x00, 0x00, // call +7
        0x48, 0x83, 0xc0, 0x01, // add rax, 1
        0xc3, // ret
        0x90, 0x90, // pad
        0x48, 0xc7, 0xc0, 0x29, 0x00, 0x00, 0x00, // callee: mov rax, 41
        0xc3, // ret
    ]);
    assert_eq!(g.call(Policy::NULL, 0), 42);
    assert_eq!(g.call(Policy::NULL, 0), 42);

    // Indirect transfer under full-flag save.
    let j = common::NativeFn::new(vec![0x48, 0x89, 0xf8, 0xff, 0xe0]); // mov rax, rdi; jmp rax
    let h = common::const_fn(17);
    assert_eq!(j.call(Policy::NULL, h.pc()), 17);
    assert_eq!(j.call(Policy::NULL, h.pc()), 17);
}
