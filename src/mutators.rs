//! Public reactive mutators: `set`, `del`, and `define_reactive`.
//!
//! Each guards a precondition and falls back to a diagnostic plus a sensible default rather than
//! panicking, so a misuse from a `user` tracker's perspective is recoverable.

use crate::diagnostics::warn;
use crate::value::{observe, Value};

/// Adds or replaces `key` on `target`, returning the value that was set.
///
/// Guard order:
/// 1. `target` is a primitive or `Null`: warns, returns `value` unchanged (nothing to attach to).
/// 2. `target` is frozen (`!target.is_extensible()`): warns, returns `value` unchanged — a
///    structural violation per the container value model, not merely a root-data refusal.
/// 3. `target` is a `List` and `key` parses as an index: routes through the intercepted list
///    mutators so the write goes through the same shape-notification path as `push`/`splice`.
/// 4. `key` already exists on a `Map`: a plain reactive write (`set_existing`), no shape change.
/// 5. `target` has no observer at all (never wrapped by `observe`): a plain, non-reactive
///    insert — nothing to notify.
/// 6. `target`'s observer has `vm_count > 0`: refuses to add a new key to a root data object at
///    runtime and warns, since properties added this way would never have been proxied in the
///    first place.
/// 7. Otherwise: a genuinely new key on a plain observed map — installs a dep for it and
///    notifies the map's shape dep so anything iterating `keys()` re-evaluates.
pub fn set(target: &Value, key: &str, value: Value) -> Value {
    if target.as_list().is_none() && target.as_map().is_none() {
        warn(
            "cannot set a property on a non-object value",
            Some(key),
        );
        return value;
    }

    if !target.is_extensible() {
        warn("cannot set a property on a frozen value", Some(key));
        return value;
    }

    if let Some(list) = target.as_list() {
        if let Ok(index) = key.parse::<usize>() {
            list.set_index(index, value.clone());
            return value;
        }
        warn(
            "cannot set a non-numeric key on a sequence",
            Some(key),
        );
        return value;
    }

    let map = target.as_map().expect("checked above");

    if map.has(key) {
        map.set_existing(key, value.clone(), false);
        return value;
    }

    let Some(obs) = target.observer() else {
        map.entries_insert_plain(key, value.clone());
        return value;
    };

    if obs.vm_count.get() > 0 {
        warn(
            "cannot add a new reactive property to a root data object at runtime; declare it upfront",
            Some(key),
        );
        return value;
    }

    map.insert_reactive(key, value.clone(), false);
    obs.dep.notify();
    value
}

/// Removes `key` from `target`, notifying the shape dep if a reactive key was actually removed.
///
/// Mirrors `set`'s guard order: non-objects and missing keys are no-ops (the latter silently,
/// since deleting an absent key is not an error); a frozen target or `vm_count > 0` refuses the
/// removal and warns.
pub fn del(target: &Value, key: &str) {
    if !target.is_extensible() {
        warn("cannot delete a property from a frozen value", Some(key));
        return;
    }

    if let Some(list) = target.as_list() {
        if let Ok(index) = key.parse::<usize>() {
            list.remove_index(index);
        } else {
            warn("cannot delete a non-numeric key from a sequence", Some(key));
        }
        return;
    }

    let Some(map) = target.as_map() else {
        warn("cannot delete a property from a non-object value", Some(key));
        return;
    };

    if !map.has(key) {
        return;
    }

    if let Some(obs) = target.observer() {
        if obs.vm_count.get() > 0 {
            warn(
                "cannot delete a reactive property from a root data object at runtime",
                Some(key),
            );
            return;
        }
    }

    let shape_dep = target.observer().map(|o| o.dep.clone());
    map.remove(key);
    if let Some(dep) = shape_dep {
        dep.notify();
    }
}

/// Defines a new reactive accessor for `key` on `target` ahead of time, e.g. while assembling a
/// component's initial data before it becomes root data. Unlike `set`, this never refuses on
/// `vm_count` and never notifies — there is nothing watching yet. `shallow` skips observing
/// `value` itself, for callers that already know it holds no nested containers worth walking.
pub fn define_reactive(target: &Value, key: &str, value: Value, shallow: bool) {
    let Some(map) = target.as_map() else {
        warn(
            "cannot define a reactive property on a non-map value",
            Some(key),
        );
        return;
    };
    if !shallow {
        observe(&value, false);
    }
    map.insert_reactive(key, value, true);
}
