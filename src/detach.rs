//! The detach table: approved "leave the code cache" targets.
//!
//! Translation normally never lets control escape to native code. The
//! exceptions are registered here: host library routines the client
//! wants called natively, wrappers, and the return sites of attach
//! thunks. A CTI whose target resolves through this table is pointed at
//! the detach target instead of a translation.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::AppPc;

static DETACH: OnceLock<RwLock<HashMap<AppPc, AppPc>>> = OnceLock::new();

fn table() -> &'static RwLock<HashMap<AppPc, AppPc>> {
    DETACH.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Approve `native` as a detach point resolving to `target`. Most
/// entries map an address to itself; a wrapper maps the wrapped routine
/// to the wrapper.
pub fn add_detach_point(native: AppPc, target: AppPc) {
    table().write().insert(native, target);
}

/// The detach target for `pc`, if `pc` is an approved detach point.
pub fn find_detach_target(pc: AppPc) -> Option<AppPc> {
    table().read().get(&pc).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_round_trip() {
        add_detach_point(0x1000, 0x2000);
        add_detach_point(0x3000, 0x3000);
        assert_eq!(find_detach_target(0x1000), Some(0x2000));
        assert_eq!(find_detach_target(0x3000), Some(0x3000));
        assert_eq!(find_detach_target(0x4000), None);
    }
}
