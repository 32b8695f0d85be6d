//! The non-panicking diagnostic sink, the `user`-tracker panic-isolation boundary, and the
//! small set of process-wide configuration flags the rest of the crate reads.

use std::any::Any;
use std::cell::Cell;

use crate::HostId;

/// Emits a diagnostic for an invalid-but-recoverable use of the reactivity core.
///
/// This is the sole channel for "programmer error" style diagnostics; none of them panic. The
/// caller is always left with a sensible fallback (a no-op, or falling through to a plain,
/// non-reactive assignment).
pub fn warn(message: &str, context: Option<&str>) {
    match context {
        Some(ctx) => tracing::warn!(target: "reactive_core", context = ctx, "{message}"),
        None => tracing::warn!(target: "reactive_core", "{message}"),
    }
}

/// Routes a caught panic from a `user`-flagged tracker's getter or callback to the diagnostic
/// sink. `host` identifies the owning component for log correlation; this crate does not
/// interpret it further.
pub fn handle_error(payload: Box<dyn Any + Send>, host: HostId, context: &str) {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    tracing::error!(
        target: "reactive_core",
        host = host.0,
        context,
        "{message}"
    );
}

thread_local! {
    static SHOULD_OBSERVE: Cell<bool> = const { Cell::new(true) };
    static SILENT: Cell<bool> = const { Cell::new(false) };
    static ASYNC_SCHEDULING: Cell<bool> = const { Cell::new(true) };
}

/// Process-wide (thread-local) flags read by the rest of the crate.
pub struct Config;

impl Config {
    /// Whether newly encountered containers should be wrapped in an `Observer` at all. Toggled
    /// off by collaborators during phases where reactivity would be wasted work (e.g. composing
    /// default prop values before a component's data is attached).
    pub fn should_observe() -> bool {
        SHOULD_OBSERVE.with(Cell::get)
    }

    pub fn set_should_observe(value: bool) {
        SHOULD_OBSERVE.with(|c| c.set(value));
    }

    /// The internal flag toggled while composing values that must not themselves trigger
    /// observation side effects (mirrors Vue's internal `observerState.isSettingProps`-style
    /// use, generalized to any "do this quietly" block).
    pub fn silent() -> bool {
        SILENT.with(Cell::get)
    }

    pub fn set_silent(value: bool) {
        SILENT.with(|c| c.set(value));
    }

    /// Whether notifications may be delivered out of creation order. When `false`,
    /// `Dep::notify` sorts its subscriber snapshot by id and the scheduler behaves
    /// deterministically. Defaults to `true`.
    pub fn async_scheduling() -> bool {
        ASYNC_SCHEDULING.with(Cell::get)
    }

    pub fn set_async_scheduling(value: bool) {
        ASYNC_SCHEDULING.with(|c| c.set(value));
    }
}

/// RAII guard that sets a flag for the duration of a block and restores the previous value on
/// drop, even on panic/unwind.
pub struct ScopedFlag<F: Fn(bool) + 'static> {
    previous: bool,
    setter: F,
}

impl<F: Fn(bool) + 'static> ScopedFlag<F> {
    /// `getter`/`setter` should read/write the same underlying flag (e.g.
    /// `Config::should_observe`/`Config::set_should_observe`).
    pub fn new(getter: impl Fn() -> bool, setter: F, new_value: bool) -> Self {
        let previous = getter();
        setter(new_value);
        Self { previous, setter }
    }
}

impl<F: Fn(bool) + 'static> Drop for ScopedFlag<F> {
    fn drop(&mut self) {
        (self.setter)(self.previous);
    }
}

/// Runs `f` with observation suppressed, restoring the previous `should_observe` flag afterwards
/// no matter how `f` returns (including by panicking).
pub fn without_observation<T>(f: impl FnOnce() -> T) -> T {
    let _guard = ScopedFlag::new(Config::should_observe, Config::set_should_observe, false);
    f()
}
