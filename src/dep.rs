//! `Dep`: the atom of the observer graph, and the thread-local current-target stack.
//!
//! A single thread-local holds "what is currently being evaluated"; reads against a `Dep`
//! record an edge against whatever is on top of that stack.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use smallvec::SmallVec;

use crate::ids::next_dep_id;

/// Anything that can sit in a `Dep`'s subscriber list or on the current-target stack. Both
/// `Watcher<T>` (for any `T`) and the scheduler's queue need a type-erased handle, since a
/// single process hosts watchers over many different value types at once.
pub(crate) trait TrackerLike {
    fn id(&self) -> u64;
    /// Called by `Dep::depend()` on whichever tracker is currently on top of the target stack.
    /// It is the tracker, not the dep, that decides whether this is a new edge.
    fn add_dep(&self, dep: Rc<Dep>);
    /// Reacts to a notification from one of this tracker's deps.
    fn update(&self);
    /// Runs the `before` hook, if any, just before the scheduler calls `run()`.
    fn call_before(&self);
    /// Re-evaluates and (maybe) fires the callback. Called directly for `sync` trackers and by
    /// the scheduler for the rest.
    fn run(&self);
    fn is_active(&self) -> bool;
    /// Whether this is a collaborator's render tracker, for the scheduler's post-flush "updated"
    /// hook. Defaults to `false` so test/internal trackers don't need to implement it.
    fn is_render(&self) -> bool {
        false
    }
}

/// A dependency node: a set of subscribing trackers plus a creation-ordered identity.
///
/// Created eagerly per observed container (the "shape" dep) and lazily per intercepted
/// property (a "value" dep); never explicitly destroyed.
pub(crate) struct Dep {
    id: u64,
    // Most deps (a single primitive property) end up with exactly one subscriber; `SmallVec`
    // keeps that common case allocation-free.
    subs: RefCell<SmallVec<[Rc<dyn TrackerLike>; 1]>>,
}

impl Dep {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            id: next_dep_id(),
            subs: RefCell::new(SmallVec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Appends a subscriber. Duplicate-free by construction: `Watcher::add_dep` only calls this
    /// the first time a given dep id is seen across an evaluation.
    pub fn add_sub(&self, tracker: Rc<dyn TrackerLike>) {
        self.subs.borrow_mut().push(tracker);
    }

    /// O(n) removal by tracker id; subscriber lists stay small in practice.
    pub fn remove_sub(&self, tracker_id: u64) {
        self.subs.borrow_mut().retain(|t| t.id() != tracker_id);
    }

    /// If a tracker is currently being evaluated, record this dep against it. No-ops while
    /// inside [`crate::untracked`], even with a tracker on the stack.
    pub fn depend(self: &Rc<Self>) {
        if is_suppressed() {
            return;
        }
        CURRENT_TARGET.with(|stack| {
            if let Some(top) = stack.borrow().last() {
                top.add_dep(self.clone());
            }
        });
    }

    /// Notifies every subscriber that this dep's value changed. Snapshots first so that a
    /// subscriber's callback mutating the sub list (e.g. tearing down a sibling) during
    /// iteration can't invalidate the loop; notified-then-removed subscribers still get this
    /// round's notification.
    pub fn notify(&self) {
        let mut subs: Vec<Rc<dyn TrackerLike>> = self.subs.borrow().clone();
        if !crate::diagnostics::Config::async_scheduling() {
            subs.sort_by_key(|t| t.id());
        }
        for sub in subs {
            sub.update();
        }
    }
}

thread_local! {
    /// The stack of trackers currently being evaluated. The top is the "current target"; nested
    /// evaluations (a lazy tracker read from inside a render tracker) push/pop in balanced
    /// pairs via `TargetGuard`.
    static CURRENT_TARGET: RefCell<Vec<Rc<dyn TrackerLike>>> = const { RefCell::new(Vec::new()) };
    /// Depth counter for [`crate::untracked`]; `depend()` is a no-op while this is above zero,
    /// regardless of what's on `CURRENT_TARGET`. A counter rather than a bool so nested calls
    /// compose correctly.
    static SUPPRESS_DEPTH: Cell<u32> = const { Cell::new(0) };
}

pub(crate) fn push_target(t: Rc<dyn TrackerLike>) {
    CURRENT_TARGET.with(|stack| stack.borrow_mut().push(t));
}

pub(crate) fn pop_target() {
    CURRENT_TARGET.with(|stack| {
        stack.borrow_mut().pop();
    });
}

fn is_suppressed() -> bool {
    SUPPRESS_DEPTH.with(Cell::get) > 0
}

/// Runs `f` with dependency recording suppressed: reads performed inside `f` do not register
/// against whatever tracker is currently evaluating, even though that tracker stays on top of
/// the target stack. The escape hatch framework-internal code needs when it must read reactive
/// state without creating a dependency edge (e.g. composing default values, or any read a
/// collaborator above this crate does not want attributed to the tracker currently running).
///
/// A closure rather than a raw push/pop pair, so the suppression can never be left unbalanced by
/// a caller that forgets to undo it; restored via a drop guard even if `f` panics.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    struct SuppressGuard;
    impl Drop for SuppressGuard {
        fn drop(&mut self) {
            SUPPRESS_DEPTH.with(|d| d.set(d.get() - 1));
        }
    }
    SUPPRESS_DEPTH.with(|d| d.set(d.get() + 1));
    let _guard = SuppressGuard;
    f()
}

/// RAII guard ensuring `pop_target` (and whatever else the caller needs to restore) runs even if
/// the evaluation panics. Rust's `Drop` runs during unwinding, so dependency bookkeeping is
/// always restored without needing to catch every panic.
pub(crate) struct TargetGuard<F: FnMut()> {
    on_drop: Option<F>,
}

impl<F: FnMut()> TargetGuard<F> {
    pub fn new(on_drop: F) -> Self {
        Self {
            on_drop: Some(on_drop),
        }
    }
}

impl<F: FnMut()> Drop for TargetGuard<F> {
    fn drop(&mut self) {
        if let Some(mut f) = self.on_drop.take() {
            f();
        }
    }
}
