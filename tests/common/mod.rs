#![allow(dead_code)]

use std::fmt::Write;
use std::sync::OnceLock;

use iced_x86::{Code, Decoder, DecoderOptions, Instruction};

/// Freeze the default configuration and initialise the translator once
/// per test binary.
pub fn setup() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        weft::init_with(weft::config::Config::default());
    });
}

/// Read translated code out of the cache.
pub fn read_cache(pc: u64, len: usize) -> Vec<u8> {
    assert!(weft::alloc::CacheRegion::get().contains(pc));
    unsafe { std::slice::from_raw_parts(pc as *const u8, len) }.to_vec()
}

/// Decode up to `max` instructions of translated code, with their
/// addresses.
pub fn decode_cache(pc: u64, max: usize) -> Vec<(u64, Instruction)> {
    let bytes = read_cache(pc, 15 * max);
    let mut decoder = Decoder::with_ip(64, &bytes, pc, DecoderOptions::NONE);
    let mut out = Vec::new();
    while decoder.can_decode() && out.len() < max {
        let ip = decoder.ip();
        let instr = decoder.decode();
        if instr.code() == Code::INVALID {
            break;
        }
        out.push((ip, instr));
    }
    out
}

/// Find the first decoded instruction with the given code.
pub fn find_code(pc: u64, max: usize, code: Code) -> Option<(u64, Instruction)> {
    decode_cache(pc, max).into_iter().find(|(_, i)| i.code() == code)
}

/// Disassembly text of translated code, for structural assertions.
pub fn disasm_cache(pc: u64, max: usize) -> String {
    use yaxpeax_arch::{Decoder as _, LengthedInstruction, U8Reader};
    use yaxpeax_x86::amd64::InstDecoder;

    let bytes = read_cache(pc, 15 * max);
    let decoder = InstDecoder::default();
    let mut reader = U8Reader::new(&bytes);
    let mut out = String::new();
    let mut offset = 0usize;
    for _ in 0..max {
        match decoder.decode(&mut reader) {
            Ok(inst) => {
                writeln!(out, "{offset:06x}  {inst}").unwrap();
                offset += inst.len().to_const() as usize;
            }
            Err(_) => break,
        }
    }
    out
}

/// A native function image held in heap memory. The bytes are decoded
/// by the translator; only the translated copy ever executes, so the
/// backing storage needs no execute permission.
pub struct NativeFn {
    bytes: Vec<u8>,
}

impl NativeFn {
    pub fn new(mut bytes: Vec<u8>) -> Self {
        // Slack for the decoder's fixed 15-byte window at the last
        // instruction.
        bytes.extend_from_slice(&[0u8; 16]);
        NativeFn { bytes }
    }

    pub fn pc(&self) -> u64 {
        self.bytes.as_ptr() as u64
    }

    pub fn pc_at(&self, offset: usize) -> u64 {
        self.pc() + offset as u64
    }

    /// Exact byte range of the image, for module registration.
    pub fn range(&self) -> (u64, u64) {
        (self.pc(), self.pc() + self.bytes.len() as u64)
    }

    /// Translate under `policy` and run through the attach thunk.
    pub fn call(&self, policy: weft::policy::Policy, arg: u64) -> u64 {
        unsafe { weft::translate_and_call(self.pc(), policy, arg) }
    }
}

/// `test rdi, rdi; jz taken; mov rax, 0; ret; taken: mov rax, 1; ret`
pub fn jz_fn() -> NativeFn {
    NativeFn::new(vec![
        0x48, 0x85, 0xff, // test rdi, rdi
        0x74, 0x08, // jz +8
        0x48, 0xc7, 0xc0, 0x00, 0x00, 0x00, 0x00, // mov rax, 0
        0xc3, // ret
        0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00, // mov rax, 1
        0xc3, // ret
    ])
}

/// `mov rax, value; ret`
pub fn const_fn(value: u32) -> NativeFn {
    let mut bytes = vec![0x48, 0xc7, 0xc0];
    bytes.extend_from_slice(&value.to_le_bytes());
    bytes.push(0xc3);
    NativeFn::new(bytes)
}
