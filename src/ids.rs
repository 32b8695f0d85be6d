//! Process-wide (thread-local) monotonic identity generators.
//!
//! `Dep`, `Observer` and `Watcher` each need a stable, creation-ordered id. Vue's reactivity
//! core keeps one counter per concept; we do the same so that scheduler ordering (which only
//! cares about watcher ids) doesn't accidentally depend on dep or observer ids too.

use std::cell::Cell;

macro_rules! id_counter {
    ($name:ident, $fn_name:ident) => {
        thread_local! {
            static $name: Cell<u64> = const { Cell::new(0) };
        }

        pub(crate) fn $fn_name() -> u64 {
            $name.with(|c| {
                let id = c.get();
                c.set(id + 1);
                id
            })
        }
    };
}

id_counter!(NEXT_DEP_ID, next_dep_id);
id_counter!(NEXT_OBSERVER_ID, next_observer_id);
id_counter!(NEXT_TRACKER_ID, next_tracker_id);
