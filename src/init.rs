//! Deterministic initialisation.
//!
//! Every init unit names its prerequisites and a topological pass runs
//! them exactly once, in a deterministic order that cannot depend on
//! link order or on which entry point happened to run first.

use std::sync::OnceLock;

struct InitUnit {
    name: &'static str,
    prereqs: &'static [&'static str],
    run: fn(),
}

fn units() -> Vec<InitUnit> {
    vec![
        InitUnit {
            name: "config",
            prereqs: &[],
            run: || {
                let _ = crate::config::Config::get();
            },
        },
        InitUnit {
            name: "cache-region",
            prereqs: &["config"],
            run: || {
                let region = crate::alloc::CacheRegion::get();
                tracing::info!(base = region.base(), end = region.end(), "cache region");
            },
        },
        InitUnit {
            name: "global-state",
            prereqs: &["config", "cache-region"],
            run: || {
                let _ = crate::state::GlobalState::get();
            },
        },
        InitUnit {
            name: "attach-thunk",
            prereqs: &["global-state"],
            run: || {
                let _ = crate::stub::attach_thunk();
            },
        },
    ]
}

static INIT: OnceLock<()> = OnceLock::new();

/// Run every init unit once, prerequisites first.
pub fn run() {
    INIT.get_or_init(|| {
        let units = units();
        let mut done: Vec<&'static str> = Vec::new();
        let mut pending: Vec<&InitUnit> = units.iter().collect();
        while !pending.is_empty() {
            let before = pending.len();
            pending.retain(|unit| {
                if unit.prereqs.iter().all(|p| done.contains(p)) {
                    (unit.run)();
                    done.push(unit.name);
                    false
                } else {
                    true
                }
            });
            if pending.len() == before {
                let stuck: Vec<_> = pending.iter().map(|u| u.name).collect();
                panic!("init dependency cycle through {stuck:?}");
            }
        }
        tracing::info!(order = ?done, "translator initialised");
    });
}
