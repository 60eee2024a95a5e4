//! Host integration.
//!
//! In kernel mode this layer would hook module load notifiers, per-CPU
//! state, the IDT and a relay logging channel. The user-space rendition
//! keeps the same narrow surface: a module-range registry that answers
//! `is_host_address`, logging through `tracing`, and private-stack
//! markers that are no-ops outside the kernel.

use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::AppPc;

/// A loaded module's executable text range.
#[derive(Debug, Clone)]
pub struct ModuleRange {
    pub name: String,
    pub start: AppPc,
    pub end: AppPc,
}

static MODULES: OnceLock<RwLock<Vec<ModuleRange>>> = OnceLock::new();

fn modules() -> &'static RwLock<Vec<ModuleRange>> {
    MODULES.get_or_init(|| RwLock::new(Vec::new()))
}

/// Module load notification: `start..end` is instrumented code.
pub fn notify_module_load(name: &str, start: AppPc, end: AppPc) {
    tracing::info!(module = name, start, end, "module load");
    modules().write().push(ModuleRange {
        name: name.to_string(),
        start,
        end,
    });
}

/// Module unload notification. Unknown modules are ignored silently.
pub fn notify_module_unload(name: &str) {
    let mut mods = modules().write();
    let before = mods.len();
    mods.retain(|m| m.name != name);
    if mods.len() != before {
        tracing::info!(module = name, "module unload");
    }
}

/// True when `pc` lies outside every registered instrumented module,
/// i.e. in host code. With no modules registered the host/app boundary
/// is unknowable and nothing is treated as host.
pub fn is_host_address(pc: AppPc) -> bool {
    let mods = modules().read();
    if mods.is_empty() {
        return false;
    }
    !mods.iter().any(|m| pc >= m.start && pc < m.end)
}

/// Kernel-only: switch to the CPU's private stack before deep
/// translator work. The user-space stack is already private to the
/// thread, so these are markers only.
pub fn enter_private_stack() {}

pub fn exit_private_stack() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_query_tracks_module_ranges() {
        assert!(!is_host_address(0x5000));
        notify_module_load("wp-host-test", 0x10_0000, 0x11_0000);
        assert!(!is_host_address(0x10_8000));
        assert!(is_host_address(0x5000));
        notify_module_unload("wp-host-test");
    }
}
