//! Translation-path benchmarks: warm fingerprint lookup and full
//! translated execution through the attach thunk.

use std::sync::OnceLock;

use weft::policy::Policy;

fn main() {
    divan::main();
}

/// `test rdi, rdi; jz taken; mov rax, 0; ret; taken: mov rax, 1; ret`
fn branchy_code() -> &'static Vec<u8> {
    static CODE: OnceLock<Vec<u8>> = OnceLock::new();
    CODE.get_or_init(|| {
        let mut code = vec![
            0x48, 0x85, 0xff, 0x74, 0x08, 0x48, 0xc7, 0xc0, 0x00, 0x00, 0x00, 0x00, 0xc3,
            0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00, 0xc3,
        ];
        // Decoder window slack.
        code.extend_from_slice(&[0u8; 16]);
        code
    })
}

fn setup() -> u64 {
    static READY: OnceLock<u64> = OnceLock::new();
    *READY.get_or_init(|| {
        weft::init_with(weft::config::Config::default());
        let pc = branchy_code().as_ptr() as u64;
        // Warm both edges so the benches measure steady state.
        unsafe {
            weft::translate_and_call(pc, Policy::NULL, 0);
            weft::translate_and_call(pc, Policy::NULL, 1);
        }
        pc
    })
}

#[divan::bench]
fn warm_lookup(bencher: divan::Bencher) {
    let pc = setup();
    bencher.bench(|| weft::translate(divan::black_box(pc), Policy::NULL));
}

#[divan::bench]
fn warm_translated_call(bencher: divan::Bencher) {
    let pc = setup();
    bencher.bench(|| unsafe {
        weft::translate_and_call(divan::black_box(pc), Policy::NULL, 1)
    });
}
