//! Runtime-frozen configuration.
//!
//! The translator's tunables are read once from `WEFT_*` environment
//! variables the first time [`Config::get`] is called (usually from
//! [`crate::init`]) and never change afterwards. Generated stubs bake
//! configuration values into their code, so flipping a variable after
//! init would desynchronise the generated code from the Rust side.

use std::sync::OnceLock;

/// Number of inline hash-table probes emitted into every IBL pre-entry
/// stub before it falls through to the slow path.
pub const DEFAULT_IBL_CHECKS: usize = 4;

/// Translator configuration. Every field has a matching `WEFT_*`
/// environment variable, named after the field.
#[derive(Debug, Clone)]
pub struct Config {
    /// Protect the global code cache with a mutex instead of the
    /// lock-free CAS table.
    pub lock_global_code_cache: bool,
    /// Emit a per-callsite prediction probe into IBL pre-entry stubs.
    pub ibl_prediction: bool,
    /// Save every XMM register across the IBL entry routine instead of
    /// only the ABI return registers.
    pub track_xmm_regs: bool,
    /// Rewrite rip-relative references that are out of rel32 range of
    /// the code cache.
    pub translate_far_addresses: bool,
    /// Leave RET instructions unmangled and trust the return predictor.
    pub direct_return: bool,
    /// Save the full flags word (pushfq) in IBL pre-entry stubs instead
    /// of the arithmetic flags only.
    pub ibl_save_all_flags: bool,
    /// Inline IBL probe count.
    pub ibl_checks: usize,
    /// Start a fresh fragment slab for every block whose policy begins a
    /// functional unit.
    pub trace_allocate: bool,
    /// Generate the user-mode return fast path that recognises
    /// cache-resident return addresses without entering the IBL.
    pub return_fast_path: bool,
    /// Watchpoints: refuse to treat RBP-based operands as candidates.
    pub wp_ignore_frame_pointer: bool,
    /// Watchpoints: kernel address-space polarity (tag bit clear means
    /// watched, mask fills with ones instead of zeroes).
    pub kernel_address_space: bool,
    /// Maximum number of instructions decoded into one basic block.
    pub max_block_instructions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            lock_global_code_cache: false,
            ibl_prediction: false,
            track_xmm_regs: false,
            translate_far_addresses: true,
            direct_return: false,
            ibl_save_all_flags: false,
            ibl_checks: DEFAULT_IBL_CHECKS,
            trace_allocate: false,
            return_fast_path: true,
            wp_ignore_frame_pointer: false,
            kernel_address_space: false,
            max_block_instructions: 128,
        }
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => panic!("invalid {name}={other:?}; expected a boolean"),
        },
        Err(std::env::VarError::NotPresent) => default,
        Err(std::env::VarError::NotUnicode(_)) => {
            panic!("{name} must be valid UTF-8")
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .unwrap_or_else(|_| panic!("invalid {name}={v:?}; expected an integer")),
        Err(_) => default,
    }
}

impl Config {
    /// Build a configuration from the environment without freezing it.
    pub fn from_env() -> Self {
        let d = Config::default();
        Config {
            lock_global_code_cache: env_flag(
                "WEFT_LOCK_GLOBAL_CODE_CACHE",
                d.lock_global_code_cache,
            ),
            ibl_prediction: env_flag("WEFT_IBL_PREDICTION", d.ibl_prediction),
            track_xmm_regs: env_flag("WEFT_TRACK_XMM", d.track_xmm_regs),
            translate_far_addresses: env_flag("WEFT_TRANSLATE_FAR", d.translate_far_addresses),
            direct_return: env_flag("WEFT_DIRECT_RETURN", d.direct_return),
            ibl_save_all_flags: env_flag("WEFT_IBL_SAVE_ALL_FLAGS", d.ibl_save_all_flags),
            ibl_checks: env_usize("WEFT_IBL_CHECKS", d.ibl_checks).clamp(1, 32),
            trace_allocate: env_flag("WEFT_TRACE_ALLOCATE", d.trace_allocate),
            return_fast_path: env_flag("WEFT_RETURN_FAST_PATH", d.return_fast_path),
            wp_ignore_frame_pointer: env_flag(
                "WEFT_WP_IGNORE_FRAME_POINTER",
                d.wp_ignore_frame_pointer,
            ),
            kernel_address_space: env_flag("WEFT_KERNEL_ADDRESS_SPACE", d.kernel_address_space),
            max_block_instructions: env_usize("WEFT_MAX_BLOCK_INSTRUCTIONS", 128).clamp(1, 4096),
        }
    }

    /// The frozen process-wide configuration.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Config::from_env)
    }

    /// Freeze an explicit configuration. Returns the frozen value, which
    /// is the given one unless another caller froze a configuration
    /// first.
    pub fn freeze(config: Config) -> &'static Config {
        let _ = CONFIG.set(config);
        CONFIG.get().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert!(!c.lock_global_code_cache);
        assert!(c.translate_far_addresses);
        assert!(c.return_fast_path);
        assert_eq!(c.ibl_checks, DEFAULT_IBL_CHECKS);
    }

    #[test]
    fn env_flag_parses() {
        std::env::set_var("WEFT_TEST_FLAG_A", "1");
        assert!(env_flag("WEFT_TEST_FLAG_A", false));
        std::env::set_var("WEFT_TEST_FLAG_A", "off");
        assert!(!env_flag("WEFT_TEST_FLAG_A", true));
        assert!(env_flag("WEFT_TEST_FLAG_MISSING", true));
    }
}
