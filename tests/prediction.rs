//! IBL prediction stubs: with the per-callsite prediction cache on,
//! indirect transfers still resolve correctly, warm and cold, and a
//! changed runtime target does not get misdirected by the prediction.

mod common;

use weft::policy::Policy;

#[test]
fn prediction_cache_resolves_and_never_misdirects() {
    weft::init_with(weft::config::Config {
        ibl_prediction: true,
        ..weft::config::Config::default()
    });

    // mov rax, rdi; jmp rax
    let f = common::NativeFn::new(vec![0x48, 0x89, 0xf8, 0xff, 0xe0]);
    let h9 = common::const_fn(9);
    let h23 = common::const_fn(23);

    // Cold, then warm through the prediction entry.
    assert_eq!(f.call(Policy::NULL, h9.pc()), 9);
    assert_eq!(f.call(Policy::NULL, h9.pc()), 9);
    assert_eq!(f.call(Policy::NULL, h9.pc()), 9);

    // A different runtime target must fall past the prediction and
    // still resolve correctly.
    assert_eq!(f.call(Policy::NULL, h23.pc()), 23);
    assert_eq!(f.call(Policy::NULL, h9.pc()), 9);
    assert_eq!(f.call(Policy::NULL, h23.pc()), 23);
}
