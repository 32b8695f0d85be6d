//! A fine-grained reactivity core: dependency tracking, observable containers, and a batching
//! scheduler, independent of any particular rendering or templating layer.
//!
//! The model is a graph of three kinds of object:
//!
//! - [`Value`] containers (`Map`/`List`), each wrapped in an [`Observer`][value::Observer] the
//!   first time they're passed to [`observe`].
//! - [`Dep`][dep::Dep] nodes: one per observed container (its "shape") and one per map key.
//! - [`Watcher`] trackers: evaluate an expression against the containers, subscribe to whatever
//!   deps they read, and re-run (directly or through the [`scheduler`]) when one of those deps
//!   is notified.
//!
//! Reads and writes never happen through language-level property interception — there isn't any
//! in Rust — so every access goes through an explicit method on [`Value`], [`MapData`], or
//! [`ListData`].

mod dep;
mod diagnostics;
mod ids;
mod list_ops;
mod mutators;
mod scheduler;
mod value;
mod watcher;

pub use dep::untracked;
pub use diagnostics::{handle_error, warn, without_observation, Config, ScopedFlag};
pub use mutators::{define_reactive, del, set};
pub use scheduler::{flush_scheduler, on_flush_activated, on_flush_updated, run_sync_flush};
pub use value::{observe, ListData, MapData, Value};
pub use watcher::{HostId, TrackedValue, Watcher, WatcherOptions};
