//! ENABLE_DIRECT_RETURN: returns stay unmangled and ride the native
//! return predictor. Return addresses pushed by translated calls point
//! into the cache, so native returns land back in translated code.

mod common;

use weft::policy::Policy;

#[test]
fn unmangled_returns_still_flow_through_the_cache() {
    weft::init_with(weft::config::Config {
        direct_return: true,
        ..weft::config::Config::default()
    });

    let f = common::jz_fn();
    assert_eq!(f.call(Policy::NULL, 0), 1);
    assert_eq!(f.call(Policy::NULL, 1), 0);

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
}
