//! The observable container model: `Value`, `Observer`, and `observe()`.
//!
//! A host language with structural objects and arrays needs no concrete "value" type of its
//! own — any plain object or array is observable. Rust has no such universal container, so this
//! crate defines one: `Value` is a small dynamically-typed tree (`Map`/`List`/primitives). Every
//! read and write of a `Map` or `List` goes through its methods, which is this crate's substitute
//! for a host proxy.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::dep::Dep;
use crate::diagnostics::Config;
use crate::ids::next_observer_id;
use crate::watcher::TrackedValue;

/// A dynamically-typed value: the only kind of data this crate's containers hold.
///
/// `List` and `Map` are reference types — cloning a `Value::List`/`Value::Map` clones the
/// handle, not the data (same semantics as cloning a JS object reference). Primitives are
/// cloned by value.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    List(Rc<ListData>),
    Map(Rc<MapData>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::List(l) => f.debug_list().entries(l.items.borrow().iter()).finish(),
            Value::Map(m) => f.debug_map().entries(m.entries.borrow().iter()).finish(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Rc::from(s))
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s.as_str()))
    }
}

/// Tracks how many roots a container backs (`vm_count`). Non-zero forbids the public
/// `set`/`del` mutators from adding or removing properties.
pub(crate) struct Observer {
    pub id: u64,
    pub dep: Rc<Dep>,
    pub vm_count: Cell<u32>,
}

impl Observer {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            id: next_observer_id(),
            dep: Dep::new(),
            vm_count: Cell::new(0),
        })
    }
}

pub struct ListData {
    pub(crate) items: RefCell<Vec<Value>>,
    pub(crate) observer: RefCell<Option<Rc<Observer>>>,
    frozen: Cell<bool>,
    is_vm: Cell<bool>,
    is_vnode: Cell<bool>,
}

pub struct MapData {
    pub(crate) entries: RefCell<IndexMap<String, Value>>,
    pub(crate) key_deps: RefCell<IndexMap<String, Rc<Dep>>>,
    pub(crate) observer: RefCell<Option<Rc<Observer>>>,
    frozen: Cell<bool>,
    is_vm: Cell<bool>,
    is_vnode: Cell<bool>,
}

impl Value {
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(ListData {
            items: RefCell::new(items),
            observer: RefCell::new(None),
            frozen: Cell::new(false),
            is_vm: Cell::new(false),
            is_vnode: Cell::new(false),
        }))
    }

    pub fn map(entries: Vec<(String, Value)>) -> Value {
        Value::Map(Rc::new(MapData {
            entries: RefCell::new(entries.into_iter().collect()),
            key_deps: RefCell::new(IndexMap::new()),
            observer: RefCell::new(None),
            frozen: Cell::new(false),
            is_vm: Cell::new(false),
            is_vnode: Cell::new(false),
        }))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_list(&self) -> Option<&Rc<ListData>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Rc<MapData>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub(crate) fn observer(&self) -> Option<Rc<Observer>> {
        match self {
            Value::List(l) => l.observer.borrow().clone(),
            Value::Map(m) => m.observer.borrow().clone(),
            _ => None,
        }
    }

    /// Whether `observe`/`set`/`del` are allowed to add or remove this container's properties.
    /// Lives on the container itself (not the `Observer`) so freezing works even before the
    /// container has ever been observed.
    pub fn is_extensible(&self) -> bool {
        match self {
            Value::List(l) => !l.frozen.get(),
            Value::Map(m) => !m.frozen.get(),
            _ => true,
        }
    }

    fn is_frozen(&self) -> bool {
        !self.is_extensible()
    }

    fn is_marked_vm(&self) -> bool {
        match self {
            Value::List(l) => l.is_vm.get(),
            Value::Map(m) => m.is_vm.get(),
            _ => false,
        }
    }

    fn is_marked_vnode(&self) -> bool {
        match self {
            Value::List(l) => l.is_vnode.get(),
            Value::Map(m) => m.is_vnode.get(),
            _ => false,
        }
    }

    /// Marks this container non-extensible: `observe` becomes a permanent no-op for it (even if
    /// it was never observed in the first place) and `set`/`del` refuse to add or remove keys.
    pub fn freeze(&self) {
        match self {
            Value::List(l) => l.frozen.set(true),
            Value::Map(m) => m.frozen.set(true),
            _ => {}
        }
    }

    /// "This container is a framework instance, do not observe". Settable before or after
    /// observation; `observe` checks it on every call, not only the first.
    pub fn mark_as_vm(&self) {
        match self {
            Value::List(l) => l.is_vm.set(true),
            Value::Map(m) => m.is_vm.set(true),
            _ => {}
        }
    }

    /// "This container is a virtual-node representation, never observe".
    pub fn mark_as_vnode(&self) {
        match self {
            Value::List(l) => l.is_vnode.set(true),
            Value::Map(m) => m.is_vnode.set(true),
            _ => {}
        }
    }
}

impl MapData {
    /// Reads a key, recording dependencies.
    ///
    /// Records (i) the per-key dep, (ii) the child's shape dep if the value is itself observed,
    /// and (iii) every element's shape dep if the value is a `List` (since indexing into a list
    /// can't be intercepted any more finely than "the whole list changed shape").
    pub fn get(&self, key: &str) -> Value {
        let value = match self.entries.borrow().get(key) {
            Some(v) => v.clone(),
            None => return Value::Null,
        };
        if let Some(dep) = self.key_deps.borrow().get(key) {
            dep.depend();
        }
        match &value {
            Value::Map(child) => {
                if let Some(obs) = child.observer.borrow().as_ref() {
                    obs.dep.depend();
                }
            }
            Value::List(child) => {
                if let Some(obs) = child.observer.borrow().as_ref() {
                    obs.dep.depend();
                }
                for item in child.items.borrow().iter() {
                    if let Value::List(inner) = item {
                        if let Some(obs) = inner.observer.borrow().as_ref() {
                            obs.dep.depend();
                        }
                    } else if let Value::Map(inner) = item {
                        if let Some(obs) = inner.observer.borrow().as_ref() {
                            obs.dep.depend();
                        }
                    }
                }
            }
            _ => {}
        }
        value
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.borrow().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.borrow().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes an *existing* key. Does nothing, including not notifying, if the key does not
    /// already exist — use the free function `mutators::set` to add a new key, since that
    /// requires extra guards around root-data extensibility.
    pub fn set_existing(&self, key: &str, new: Value, shallow: bool) {
        let old = match self.entries.borrow().get(key) {
            Some(v) => v.clone(),
            None => return,
        };
        if Value::values_equal(&old, &new) {
            return;
        }
        if !shallow {
            observe(&new, false);
        }
        self.entries.borrow_mut().insert(key.to_string(), new);
        if let Some(dep) = self.key_deps.borrow().get(key) {
            dep.notify();
        }
    }

    /// Installs a fresh per-key dep and inserts the value, without firing any notification.
    /// Used by `observe()` at construction time and by `mutators::set` for brand-new keys
    /// (which additionally fires the *shape* dep after calling this).
    pub(crate) fn insert_reactive(&self, key: &str, value: Value, shallow: bool) {
        if !shallow {
            observe(&value, false);
        }
        self.entries.borrow_mut().insert(key.to_string(), value);
        self.key_deps
            .borrow_mut()
            .entry(key.to_string())
            .or_insert_with(Dep::new);
    }

    pub(crate) fn remove(&self, key: &str) -> Option<Value> {
        self.key_deps.borrow_mut().shift_remove(key);
        self.entries.borrow_mut().shift_remove(key)
    }

    /// Inserts a key with no dep bookkeeping at all: used only for maps that were never wrapped
    /// by `observe` in the first place, where there is nothing to notify.
    pub(crate) fn entries_insert_plain(&self, key: &str, value: Value) {
        self.entries.borrow_mut().insert(key.to_string(), value);
    }

    pub(crate) fn shape_dep(&self) -> Option<Rc<Dep>> {
        self.observer.borrow().as_ref().map(|o| o.dep.clone())
    }
}

impl ListData {
    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads an element without recording any dependency: indexed reads can't be intercepted any
    /// more finely than the list's shape dep (recorded by the *parent* `Map::get`); callers that
    /// want to track "I read this list at all" should also hold and read the `Value::List`
    /// through a `Map`, or call `depend_shape()` explicitly.
    pub fn get(&self, index: usize) -> Value {
        self.items.borrow().get(index).cloned().unwrap_or(Value::Null)
    }

    pub fn depend_shape(&self) {
        if let Some(obs) = self.observer.borrow().as_ref() {
            obs.dep.depend();
        }
    }

    pub(crate) fn shape_dep(&self) -> Option<Rc<Dep>> {
        self.observer.borrow().as_ref().map(|o| o.dep.clone())
    }

    pub(crate) fn to_vec(&self) -> Vec<Value> {
        self.items.borrow().clone()
    }
}

impl Value {
    /// Recursively touches every reachable key/shape dep, for `Watcher { deep: true }`
    /// evaluation. `seen` holds observer ids already visited, preventing infinite recursion on
    /// cyclic graphs.
    pub(crate) fn deep_touch(&self, seen: &mut std::collections::HashSet<u64>) {
        match self {
            Value::Map(m) => {
                let Some(obs) = m.observer.borrow().clone() else {
                    return;
                };
                if !seen.insert(obs.id) {
                    return;
                }
                obs.dep.depend();
                let keys = m.keys();
                for key in keys {
                    if let Some(dep) = m.key_deps.borrow().get(&key) {
                        dep.depend();
                    }
                    let value = m.entries.borrow().get(&key).cloned();
                    if let Some(value) = value {
                        value.deep_touch(seen);
                    }
                }
            }
            Value::List(l) => {
                let Some(obs) = l.observer.borrow().clone() else {
                    return;
                };
                if !seen.insert(obs.id) {
                    return;
                }
                obs.dep.depend();
                for item in l.to_vec() {
                    item.deep_touch(seen);
                }
            }
            _ => {}
        }
    }
}

/// Idempotently wraps `value` in an `Observer`.
///
/// Gated by [`Config::should_observe`], by the container's own `frozen`/`is_vm`/`is_vnode`
/// markers (`freeze`/`mark_as_vm`/`mark_as_vnode` — checked on every call, so marking a
/// container after it was already observed does not retroactively un-observe it, but marking it
/// beforehand keeps it from ever being wrapped), and primitives are never observed regardless.
/// Returns the (possibly pre-existing) observer, or `None` if observation was skipped or
/// refused.
pub fn observe(value: &Value, as_root_data: bool) -> Option<Rc<Observer>> {
    if !Config::should_observe() {
        return None;
    }
    let existing = value.observer();
    if let Some(obs) = &existing {
        if as_root_data {
            obs.vm_count.set(obs.vm_count.get() + 1);
        }
        return Some(obs.clone());
    }
    if value.is_frozen() || value.is_marked_vm() || value.is_marked_vnode() {
        return None;
    }
    match value {
        Value::Map(m) => {
            let obs = Observer::new();
            if as_root_data {
                obs.vm_count.set(1);
            }
            *m.observer.borrow_mut() = Some(obs.clone());
            let keys = m.keys();
            for key in keys {
                m.key_deps
                    .borrow_mut()
                    .entry(key.clone())
                    .or_insert_with(Dep::new);
                let child = m.entries.borrow().get(&key).cloned();
                if let Some(child) = child {
                    observe(&child, false);
                }
            }
            Some(obs)
        }
        Value::List(l) => {
            let obs = Observer::new();
            if as_root_data {
                obs.vm_count.set(1);
            }
            *l.observer.borrow_mut() = Some(obs.clone());
            for item in l.items.borrow().iter() {
                observe(item, false);
            }
            Some(obs)
        }
        _ => None,
    }
}

impl TrackedValue for Value {
    fn values_equal(a: &Self, b: &Self) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            // NaN guard: two NaNs are treated as equal so that re-assigning NaN to a property
            // already holding NaN does not notify.
            (Value::Number(x), Value::Number(y)) => x == y || (x.is_nan() && y.is_nan()),
            (Value::String(x), Value::String(y)) => x == y,
            (Value::List(x), Value::List(y)) => Rc::ptr_eq(x, y),
            (Value::Map(x), Value::Map(y)) => Rc::ptr_eq(x, y),
            _ => false,
        }
    }

    fn is_reference_type(&self) -> bool {
        matches!(self, Value::List(_) | Value::Map(_))
    }

    fn deep_traverse(&self, seen: &mut std::collections::HashSet<u64>) {
        self.deep_touch(seen);
    }
}
