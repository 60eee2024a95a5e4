//! Translation performance counters.
//!
//! Cheap relaxed counters bumped from the hot paths and dumped through
//! the logger on demand. The test suite also reads them to assert path
//! choices (for example that a cache-resident return never reached the
//! IBL slow path).

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident / $bump:ident;)*) => {
        $(
            $(#[$doc])*
            static $name: AtomicU64 = AtomicU64::new(0);

            pub fn $bump() {
                $name.fetch_add(1, Ordering::Relaxed);
            }
        )*

        /// Snapshot of every counter, in declaration order.
        pub fn snapshot() -> Vec<(&'static str, u64)> {
            vec![$((stringify!($name), $name.load(Ordering::Relaxed)),)*]
        }
    };
}

counters! {
    /// Full code-cache lookups.
    ADDRESS_LOOKUPS / visit_address_lookup;
    /// Full lookups answered by the global cache.
    ADDRESS_LOOKUP_HITS / visit_address_lookup_hit;
    /// CPU-private lookups.
    CPU_LOOKUPS / visit_address_lookup_cpu;
    /// CPU-private lookups that hit.
    CPU_LOOKUP_HITS / visit_address_lookup_cpu_hit;
    /// Basic blocks translated.
    TRANSLATIONS / visit_translation;
    /// Translations discarded after losing the insert race.
    RACE_LOSSES / visit_race_loss;
    /// Direct-branch slots hot-patched.
    DBL_PATCHES / visit_dbl_patch;
    /// IBL slow-path entries.
    IBL_SLOW_ENTRIES / visit_ibl_slow;
    /// Lookups resolved through the detach table.
    DETACH_HITS / visit_detach;
    /// IBL exit stubs generated.
    IBL_EXITS / visit_ibl_exit;
}

/// Read one counter by its static name. Test helper.
pub fn read(name: &str) -> u64 {
    snapshot()
        .into_iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| v)
        .unwrap_or_else(|| panic!("unknown perf counter {name:?}"))
}

/// Emit every counter through the logger.
pub fn report() {
    for (name, value) in snapshot() {
        tracing::info!(counter = name, value, "perf");
    }
}
