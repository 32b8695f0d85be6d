//! `Watcher`: the tracker that evaluates an expression, records what it touched, and reacts to
//! change notifications.
//!
//! Each watcher keeps its currently-held dep set, diffs it against a fresh set collected during
//! the next evaluation, and unsubscribes from whatever it no longer reads.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use crate::dep::{pop_target, push_target, Dep, TargetGuard, TrackerLike};
use crate::diagnostics::handle_error;
use crate::ids::next_tracker_id;
use crate::scheduler::queue_watcher;

/// Opaque identity for whatever owns a tracker (a component instance, in a layer above this
/// crate). This crate never interprets it beyond equality/display for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostId(pub u64);

/// Values a `Watcher` can evaluate to. Implemented for [`crate::Value`] (the dynamic container
/// model) and for a handful of plain Rust types so trackers can also watch ordinary typed
/// expressions without going through `Value` at all.
pub trait TrackedValue: Clone + 'static {
    /// Used instead of a blanket `PartialEq` bound so that reference types (`Value::List`/`Map`)
    /// can define "equal" as "same underlying allocation" while still supporting a NaN-style
    /// self-inequality guard for numbers.
    fn values_equal(a: &Self, b: &Self) -> bool;

    /// Whether equal-by-`values_equal` instances might still have been mutated in place, and so
    /// should always fire the tracker's callback.
    fn is_reference_type(&self) -> bool {
        false
    }

    /// Deep-traversal hook for `Watcher { deep: true }`. No-op for value types that have no
    /// nested structure to subscribe to.
    fn deep_traverse(&self, _seen: &mut HashSet<u64>) {}
}

macro_rules! impl_tracked_value_for_plain_eq {
    ($($t:ty),* $(,)?) => {
        $(
            impl TrackedValue for $t {
                fn values_equal(a: &Self, b: &Self) -> bool {
                    a == b
                }
            }
        )*
    };
}

impl_tracked_value_for_plain_eq!(bool, i32, i64, u32, u64, usize, String, ());

impl TrackedValue for f64 {
    fn values_equal(a: &Self, b: &Self) -> bool {
        a == b || (a.is_nan() && b.is_nan())
    }
}

impl<T: TrackedValue> TrackedValue for Option<T> {
    fn values_equal(a: &Self, b: &Self) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(x), Some(y)) => T::values_equal(x, y),
            _ => false,
        }
    }
    fn is_reference_type(&self) -> bool {
        self.as_ref().map(T::is_reference_type).unwrap_or(false)
    }
}

/// Construction options for a [`Watcher`].
#[derive(Default)]
pub struct WatcherOptions {
    /// Traverse the evaluated result and subscribe to every reachable sub-property.
    pub deep: bool,
    /// Route panics from the getter/callback through `handle_error` instead of propagating.
    pub user: bool,
    /// Defer evaluation until `.evaluate()` is called, caching the result until a dep fires.
    pub lazy: bool,
    /// Run synchronously on notification rather than going through the scheduler.
    pub sync: bool,
    /// Marks this as the collaborator's render tracker (informational only; this crate does not
    /// branch on it beyond exposing it via `Watcher::is_render`).
    pub is_render: bool,
    /// Invoked immediately before the scheduler calls `run()`.
    pub before: Option<Box<dyn Fn()>>,
}

type Getter<T> = Box<dyn FnMut() -> T>;
type Callback<T> = Box<dyn FnMut(&T, &T)>;

/// An evaluator that records its reads and reacts to writes.
pub struct Watcher<T: TrackedValue> {
    id: u64,
    host: HostId,
    getter: RefCell<Getter<T>>,
    cb: RefCell<Option<Callback<T>>>,
    value: RefCell<Option<T>>,
    deep: bool,
    user: bool,
    lazy: Cell<bool>,
    sync: bool,
    is_render: bool,
    dirty: Cell<bool>,
    active: Cell<bool>,
    deps: RefCell<Vec<Rc<Dep>>>,
    dep_ids: RefCell<HashSet<u64>>,
    new_deps: RefCell<Vec<Rc<Dep>>>,
    new_dep_ids: RefCell<HashSet<u64>>,
    before: Option<Box<dyn Fn()>>,
    self_weak: RefCell<Weak<Watcher<T>>>,
}

impl<T: TrackedValue> Watcher<T> {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(host: HostId, getter: impl FnMut() -> T + 'static, options: WatcherOptions) -> Rc<Self> {
        Self::with_callback(host, getter, None, options)
    }

    pub fn with_callback(
        host: HostId,
        getter: impl FnMut() -> T + 'static,
        cb: Option<Callback<T>>,
        options: WatcherOptions,
    ) -> Rc<Self> {
        let id = next_tracker_id();
        let watcher = Rc::new_cyclic(|weak: &Weak<Watcher<T>>| Watcher {
            id,
            host,
            getter: RefCell::new(Box::new(getter)),
            cb: RefCell::new(cb),
            value: RefCell::new(None),
            deep: options.deep,
            user: options.user,
            lazy: Cell::new(options.lazy),
            sync: options.sync,
            is_render: options.is_render,
            dirty: Cell::new(options.lazy),
            active: Cell::new(true),
            deps: RefCell::new(Vec::new()),
            dep_ids: RefCell::new(HashSet::new()),
            new_deps: RefCell::new(Vec::new()),
            new_dep_ids: RefCell::new(HashSet::new()),
            before: options.before,
            self_weak: RefCell::new(weak.clone()),
        });
        if !watcher.lazy.get() {
            let value = watcher.get();
            *watcher.value.borrow_mut() = Some(value);
        }
        watcher
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> HostId {
        self.host
    }

    pub fn is_render(&self) -> bool {
        self.is_render
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy.get()
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    fn as_tracker(&self) -> Option<Rc<dyn TrackerLike>> {
        self.self_weak.borrow().upgrade().map(|rc| rc as Rc<dyn TrackerLike>)
    }

    /// Evaluates the getter, recording dependencies against `self`.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self), fields(tracker_id = self.id)))]
    pub fn get(self: &Rc<Self>) -> T {
        let self_tracker: Rc<dyn TrackerLike> = self.clone();
        push_target(self_tracker);
        let this = self.clone();
        let _guard = TargetGuard::new(move || {
            pop_target();
            this.cleanup_deps();
        });

        let result = if self.user {
            match catch_unwind(AssertUnwindSafe(|| (self.getter.borrow_mut())())) {
                Ok(v) => v,
                Err(payload) => {
                    handle_error(payload, self.host, "watcher getter");
                    // No sensible fallback value exists for an arbitrary `T`; re-use the last
                    // known good value if there is one, otherwise there is nothing safe to
                    // return and we resume unwinding (still restoring bookkeeping via `_guard`).
                    match self.value.borrow().clone() {
                        Some(v) => v,
                        None => std::panic::resume_unwind(Box::new("watcher getter panicked with no prior value")),
                    }
                }
            }
        } else {
            (self.getter.borrow_mut())()
        };

        if self.deep {
            let mut seen = HashSet::new();
            result.deep_traverse(&mut seen);
        }

        result
    }

    /// Dependency recording: avoids double-subscription across re-evaluations by checking
    /// both the in-progress `new_dep_ids` and the prior `dep_ids`.
    fn add_dep(&self, dep: Rc<Dep>) {
        let dep_id = dep.id();
        if self.new_dep_ids.borrow_mut().insert(dep_id) {
            self.new_deps.borrow_mut().push(dep.clone());
            if !self.dep_ids.borrow().contains(&dep_id) {
                if let Some(tracker) = self.as_tracker() {
                    dep.add_sub(tracker);
                }
            }
        }
    }

    /// Unsubscribes from every dep that was touched on the *previous* evaluation but not this
    /// one, then swaps the dep sets.
    fn cleanup_deps(&self) {
        let stale: Vec<Rc<Dep>> = self
            .deps
            .borrow()
            .iter()
            .filter(|d| !self.new_dep_ids.borrow().contains(&d.id()))
            .cloned()
            .collect();
        for dep in stale {
            dep.remove_sub(self.id);
        }
        self.deps.borrow_mut().clear();
        std::mem::swap(&mut *self.deps.borrow_mut(), &mut *self.new_deps.borrow_mut());
        self.dep_ids.borrow_mut().clear();
        std::mem::swap(&mut *self.dep_ids.borrow_mut(), &mut *self.new_dep_ids.borrow_mut());
        self.new_deps.borrow_mut().clear();
        self.new_dep_ids.borrow_mut().clear();
    }

    /// Re-evaluates and fires the callback if the value changed (or is a reference type, or
    /// `deep` is set).
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self), fields(tracker_id = self.id)))]
    pub fn run(self: &Rc<Self>) {
        if !self.active.get() {
            return;
        }
        // Read, don't take: `get()`'s panic fallback for a `user` tracker reads `self.value` to
        // recover the last known-good value, so it must still be there while `get()` runs.
        let old_value = self.value.borrow().clone();
        let new_value = self.get();
        let changed = match &old_value {
            None => true,
            Some(old) => !T::values_equal(old, &new_value) || new_value.is_reference_type() || self.deep,
        };
        *self.value.borrow_mut() = Some(new_value.clone());
        if changed {
            let old_for_cb = old_value.unwrap_or_else(|| new_value.clone());
            self.fire_callback(&new_value, &old_for_cb);
        }
    }

    fn fire_callback(&self, new: &T, old: &T) {
        let Some(mut cb) = self.cb.borrow_mut().take() else {
            return;
        };
        if self.user {
            let result = catch_unwind(AssertUnwindSafe(|| cb(new, old)));
            if let Err(payload) = result {
                handle_error(payload, self.host, "watcher callback");
            }
        } else {
            cb(new, old);
        }
        *self.cb.borrow_mut() = Some(cb);
    }

    /// Lazy evaluation: invoked on demand when a `lazy` tracker's cached value is read while
    /// dirty.
    pub fn evaluate(self: &Rc<Self>) {
        let value = self.get();
        *self.value.borrow_mut() = Some(value);
        self.dirty.set(false);
    }

    /// Current cached value, re-evaluating first if dirty. Mirrors a memoized derived-value
    /// read.
    pub fn value(self: &Rc<Self>) -> T {
        if self.lazy.get() && self.dirty.get() {
            self.evaluate();
        }
        self.value
            .borrow()
            .clone()
            .unwrap_or_else(|| panic!("watcher {} read before first evaluation", self.id))
    }

    /// Forwards this lazy tracker's own deps to whatever tracker is currently evaluating, so a
    /// change to one of this memo's inputs also wakes its consumer even though the memo itself
    /// is cached.
    pub fn depend(&self) {
        for dep in self.deps.borrow().iter() {
            dep.depend();
        }
    }

    /// Tears down this tracker: unsubscribes from every dep it still holds and marks it
    /// inactive, so no future mutation ever invokes its callback again.
    pub fn teardown(self: &Rc<Self>) {
        if !self.active.get() {
            return;
        }
        for dep in self.deps.borrow().iter() {
            dep.remove_sub(self.id);
        }
        self.active.set(false);
    }
}

impl Watcher<crate::value::Value> {
    /// Builds a getter from a dot-delimited path string instead of a closure, e.g. `"a.b.c"`.
    /// Each segment reads through `MapData::get`/`ListData::get` (so dependency recording is
    /// identical to a hand-written accessor chain); any missing or non-container link along the
    /// way short-circuits the rest of the path and yields `Value::Null`, rather than panicking.
    pub fn from_path(
        host: HostId,
        root: crate::value::Value,
        path: &str,
        cb: Callback<crate::value::Value>,
        options: WatcherOptions,
    ) -> Rc<Self> {
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        let getter = move || {
            let mut current = root.clone();
            for segment in &segments {
                current = match &current {
                    crate::value::Value::Map(map) => map.get(segment),
                    crate::value::Value::List(list) => match segment.parse::<usize>() {
                        Ok(index) => list.get(index),
                        Err(_) => crate::value::Value::Null,
                    },
                    _ => crate::value::Value::Null,
                };
            }
            current
        };
        Self::with_callback(host, getter, Some(cb), options)
    }
}

impl<T: TrackedValue> TrackerLike for Watcher<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn add_dep(&self, dep: Rc<Dep>) {
        Watcher::add_dep(self, dep);
    }

    fn update(&self) {
        if self.lazy.get() {
            self.dirty.set(true);
            return;
        }
        if self.sync {
            if let Some(tracker) = self.as_tracker() {
                // Downcast back through the type-erased path: since `run` needs `Rc<Self>`, and
                // we only have `&self` here, re-enter through the upgraded `Rc<dyn TrackerLike>`
                // and call its own `run`, which every `Watcher<T>` implements below.
                tracker.run();
            }
            return;
        }
        if let Some(tracker) = self.as_tracker() {
            queue_watcher(tracker);
        }
    }

    fn call_before(&self) {
        if let Some(before) = &self.before {
            before();
        }
    }

    fn run(&self) {
        if let Some(strong) = self.self_weak.borrow().upgrade() {
            Watcher::run(&strong);
        }
    }

    fn is_active(&self) -> bool {
        self.active.get()
    }

    fn is_render(&self) -> bool {
        self.is_render
    }
}
