//! Batching scheduler: coalesces tracker updates within a tick and flushes them in
//! creation-id order.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::dep::TrackerLike;
use crate::diagnostics::warn;

const MAX_UPDATE_COUNT: u32 = 100;

type FlushHook = Box<dyn Fn(&[u64])>;

thread_local! {
    static QUEUE: RefCell<Vec<Rc<dyn TrackerLike>>> = RefCell::new(Vec::new());
    static QUEUED_IDS: RefCell<HashSet<u64>> = RefCell::new(HashSet::new());
    static FLUSHING: Cell<bool> = const { Cell::new(false) };
    static WAITING: Cell<bool> = const { Cell::new(false) };
    static FLUSH_INDEX: Cell<usize> = const { Cell::new(0) };
    static CIRCULAR_COUNTS: RefCell<HashMap<u64, u32>> = RefCell::new(HashMap::new());
    static BANNED: RefCell<HashSet<u64>> = RefCell::new(HashSet::new());
    static RENDER_IDS_RUN: RefCell<Vec<u64>> = RefCell::new(Vec::new());
    static UPDATED_HOOKS: RefCell<Vec<FlushHook>> = RefCell::new(Vec::new());
    static ACTIVATED_HOOKS: RefCell<Vec<FlushHook>> = RefCell::new(Vec::new());
}

/// Registers a callback invoked once per flush, after every tracker in it has run, with the ids
/// of the render trackers (`WatcherOptions::is_render`) that ran during that flush — the
/// post-render "updated" hook a view layer built on top of this crate would drive its own
/// lifecycle callbacks from.
pub fn on_flush_updated(hook: impl Fn(&[u64]) + 'static) {
    UPDATED_HOOKS.with(|hooks| hooks.borrow_mut().push(Box::new(hook)));
}

/// Registers a callback for the "activated" half of the same post-flush pair. This crate does
/// not model component (de)activation itself — `HostId` is opaque and there is no keep-alive
/// tree here — so the hook is always called with an empty slice; it exists so a collaborator
/// layering that concept on top has a stable place to register against, without this crate
/// inventing fake activation semantics to fill it.
pub fn on_flush_activated(hook: impl Fn(&[u64]) + 'static) {
    ACTIVATED_HOOKS.with(|hooks| hooks.borrow_mut().push(Box::new(hook)));
}

/// Enqueues `tracker` for the next flush. Deduplicates by id. If a flush is already underway,
/// inserts the tracker into the still-unprocessed tail of the queue in id order, so a tracker
/// woken by the flush itself still runs in this same flush rather than waiting for a whole
/// separate tick.
///
/// This does not itself run anything: there is no event loop in this crate to hang a microtask
/// off of, so marking `waiting` is as far as it goes. A consumer with its own executor calls
/// [`flush_scheduler`] from whatever tick boundary it drives; [`run_sync_flush`] is the same call
/// under a name suited to contexts (tests, scripts) with no event loop to wait for at all.
pub(crate) fn queue_watcher(tracker: Rc<dyn TrackerLike>) {
    let id = tracker.id();
    let already_queued = QUEUED_IDS.with(|ids| !ids.borrow_mut().insert(id));
    if already_queued {
        return;
    }

    let is_flushing = FLUSHING.with(Cell::get);
    if !is_flushing {
        QUEUE.with(|q| q.borrow_mut().push(tracker));
    } else {
        insert_sorted_while_flushing(tracker);
    }

    WAITING.with(|w| w.set(true));
}

/// Drains the current queue right now. Identical to [`flush_scheduler`]; exposed under this name
/// for callers (tests chief among them) with no event loop of their own to schedule a flush
/// against, so a mutation's effects are observable immediately rather than on the next tick.
pub fn run_sync_flush() {
    flush_scheduler();
}

/// Scans backward from the end of the queue for the first already-processed-or-not entry with a
/// smaller id than `tracker`, then inserts right after it. Searching from the end matches the
/// common case where the newly queued tracker has a higher id than most of the queue.
fn insert_sorted_while_flushing(tracker: Rc<dyn TrackerLike>) {
    let id = tracker.id();
    QUEUE.with(|q| {
        let mut queue = q.borrow_mut();
        let current_index = FLUSH_INDEX.with(Cell::get);
        let mut i = queue.len();
        while i > current_index + 1 && queue[i - 1].id() > id {
            i -= 1;
        }
        queue.insert(i, tracker);
    });
}

/// Runs every queued tracker's `before` hook then `run`, in ascending id order, draining the
/// queue by live index so trackers queued mid-flush (by `insert_sorted_while_flushing`) are
/// still picked up in this same call.
///
/// A tracker's id is cleared from `QUEUED_IDS` right before it runs, so a callback that mutates
/// one of its own deps legitimately re-queues it for a later index in this same flush. If that
/// happens more than [`MAX_UPDATE_COUNT`] times for one tracker, it is banned for the rest of
/// this flush and a diagnostic is emitted, instead of looping forever.
#[cfg_attr(feature = "trace", tracing::instrument)]
pub fn flush_scheduler() {
    FLUSHING.with(|f| f.set(true));

    QUEUE.with(|q| q.borrow_mut().sort_by_key(|t| t.id()));

    let mut index = 0;
    loop {
        let tracker = QUEUE.with(|q| q.borrow().get(index).cloned());
        let Some(tracker) = tracker else { break };
        FLUSH_INDEX.with(|i| i.set(index));

        let id = tracker.id();
        // Clear this id's membership *before* running it, so a callback that mutates something
        // this same tracker reads can legitimately re-queue it mid-flush (picked up by the
        // `QUEUE.get(index)` scan continuing past this point). If it does get re-added, its id
        // reappears in `QUEUED_IDS` immediately after `run()` returns, which is how re-entry is
        // detected below.
        QUEUED_IDS.with(|ids| ids.borrow_mut().remove(&id));

        let already_banned = BANNED.with(|b| b.borrow().contains(&id));
        if !already_banned && tracker.is_active() {
            tracker.call_before();
            tracker.run();

            if tracker.is_render() {
                RENDER_IDS_RUN.with(|ids| ids.borrow_mut().push(id));
            }

            let requeued = QUEUED_IDS.with(|ids| ids.borrow().contains(&id));
            if requeued {
                let count = CIRCULAR_COUNTS.with(|counts| {
                    let mut counts = counts.borrow_mut();
                    let entry = counts.entry(id).or_insert(0);
                    *entry += 1;
                    *entry
                });
                if count > MAX_UPDATE_COUNT {
                    warn(
                        "tracker re-ran more than the re-entry limit within a single flush; dropping it for the rest of this tick",
                        Some(&format!("tracker id {id}")),
                    );
                    BANNED.with(|b| b.borrow_mut().insert(id));
                }
            }
        }

        index += 1;
    }

    let rendered = RENDER_IDS_RUN.with(|ids| std::mem::take(&mut *ids.borrow_mut()));
    UPDATED_HOOKS.with(|hooks| {
        for hook in hooks.borrow().iter() {
            hook(&rendered);
        }
    });
    ACTIVATED_HOOKS.with(|hooks| {
        for hook in hooks.borrow().iter() {
            hook(&[]);
        }
    });

    reset();
}

fn reset() {
    QUEUE.with(|q| q.borrow_mut().clear());
    QUEUED_IDS.with(|ids| ids.borrow_mut().clear());
    CIRCULAR_COUNTS.with(|counts| counts.borrow_mut().clear());
    BANNED.with(|b| b.borrow_mut().clear());
    FLUSH_INDEX.with(|i| i.set(0));
    FLUSHING.with(|f| f.set(false));
    WAITING.with(|w| w.set(false));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    struct RecordingTracker {
        id: u64,
        log: Rc<StdRefCell<Vec<u64>>>,
    }

    impl TrackerLike for RecordingTracker {
        fn id(&self) -> u64 {
            self.id
        }
        fn add_dep(&self, _dep: Rc<crate::dep::Dep>) {}
        fn update(&self) {}
        fn call_before(&self) {}
        fn run(&self) {
            self.log.borrow_mut().push(self.id);
        }
        fn is_active(&self) -> bool {
            true
        }
    }

    fn tracker(id: u64, log: &Rc<StdRefCell<Vec<u64>>>) -> Rc<RecordingTracker> {
        Rc::new(RecordingTracker {
            id,
            log: log.clone(),
        })
    }

    #[test]
    fn flush_runs_trackers_in_ascending_id_order() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let t3 = tracker(3, &log);
        let t1 = tracker(1, &log);
        let t2 = tracker(2, &log);

        queue_watcher(t3);
        queue_watcher(t1);
        queue_watcher(t2);

        flush_scheduler();
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_queue_entries_run_once_per_flush() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let t1a = tracker(1, &log);
        let t1b = tracker(1, &log);

        queue_watcher(t1a);
        queue_watcher(t1b);

        flush_scheduler();
        assert_eq!(log.borrow().len(), 1);
    }

    struct SelfRequeuingTracker {
        id: u64,
        runs: Rc<Cell<u32>>,
    }

    impl TrackerLike for SelfRequeuingTracker {
        fn id(&self) -> u64 {
            self.id
        }
        fn add_dep(&self, _dep: Rc<crate::dep::Dep>) {}
        fn update(&self) {}
        fn call_before(&self) {}
        fn run(&self) {
            self.runs.set(self.runs.get() + 1);
        }
        fn is_active(&self) -> bool {
            true
        }
    }

    #[test]
    fn a_tracker_that_requeues_itself_every_run_is_bounded_and_warned() {
        let runs = Rc::new(Cell::new(0));
        let runs_for_tracker = runs.clone();
        // Wrap in a second layer that requeues on every `run()` by calling `queue_watcher`
        // again with the same id from inside `run`, simulating a tracker whose callback writes
        // back to the thing it reads.
        struct Requeuer {
            inner: Rc<SelfRequeuingTracker>,
        }
        impl TrackerLike for Requeuer {
            fn id(&self) -> u64 {
                self.inner.id()
            }
            fn add_dep(&self, dep: Rc<crate::dep::Dep>) {
                self.inner.add_dep(dep)
            }
            fn update(&self) {}
            fn call_before(&self) {}
            fn run(&self) {
                self.inner.run();
                queue_watcher(Rc::new(Requeuer { inner: self.inner.clone() }));
            }
            fn is_active(&self) -> bool {
                true
            }
        }

        let inner = Rc::new(SelfRequeuingTracker { id: 42, runs: runs_for_tracker });
        queue_watcher(Rc::new(Requeuer { inner }));
        flush_scheduler();

        assert!(runs.get() > MAX_UPDATE_COUNT, "should run past the threshold before being banned");
        assert!(runs.get() < MAX_UPDATE_COUNT * 2, "should not run unboundedly");
    }

    struct RenderTracker {
        id: u64,
        log: Rc<StdRefCell<Vec<u64>>>,
    }

    impl TrackerLike for RenderTracker {
        fn id(&self) -> u64 {
            self.id
        }
        fn add_dep(&self, _dep: Rc<crate::dep::Dep>) {}
        fn update(&self) {}
        fn call_before(&self) {}
        fn run(&self) {
            self.log.borrow_mut().push(self.id);
        }
        fn is_active(&self) -> bool {
            true
        }
        fn is_render(&self) -> bool {
            true
        }
    }

    #[test]
    fn on_flush_updated_fires_with_render_tracker_ids_only() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let seen_render_ids = Rc::new(StdRefCell::new(Vec::new()));
        let seen2 = seen_render_ids.clone();
        on_flush_updated(move |ids| seen2.borrow_mut().extend_from_slice(ids));

        let plain = tracker(1, &log);
        let render = Rc::new(RenderTracker { id: 2, log: log.clone() });

        queue_watcher(plain);
        queue_watcher(render);

        flush_scheduler();
        assert_eq!(*seen_render_ids.borrow(), vec![2]);
    }

    #[test]
    fn queueing_does_not_run_anything_until_a_flush_is_driven() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        queue_watcher(tracker(1, &log));
        assert!(log.borrow().is_empty(), "queueing alone must not run the tracker");

        run_sync_flush();
        assert_eq!(*log.borrow(), vec![1]);
    }
}
