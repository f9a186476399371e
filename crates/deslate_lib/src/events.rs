use std::fmt;

use crate::vm::Value;

/// One announced bulk edit of a namespace: entries to add, names to drop,
/// entries to overwrite. Listeners see it before it is applied and may veto
/// it; a vetoed change is discarded wholesale, never applied partially.
pub struct NamespaceChange {
    pub origin: String,
    pub added: Vec<(String, Value)>,
    pub removed: Vec<String>,
    pub modified: Vec<(String, Value)>,
    vetoed: bool,
}

impl NamespaceChange {
    pub fn new(origin: impl Into<String>) -> NamespaceChange {
        NamespaceChange {
            origin: origin.into(),
            added: Vec::new(),
            removed: Vec::new(),
            modified: Vec::new(),
            vetoed: false,
        }
    }

    pub fn veto(&mut self) {
        self.vetoed = true;
    }

    pub fn is_vetoed(&self) -> bool {
        self.vetoed
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

impl fmt::Debug for NamespaceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceChange")
            .field("origin", &self.origin)
            .field("added", &self.added.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("removed", &self.removed)
            .field("modified", &self.modified.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("vetoed", &self.vetoed)
            .finish()
    }
}

type Listener = Box<dyn FnMut(&mut NamespaceChange)>;

/// Registered change listeners, dispatched in registration order. Every
/// listener runs even after an earlier one vetoes, so each gets a complete
/// picture of the proposed change.
pub struct ListenerSet {
    listeners: Vec<Listener>,
}

impl ListenerSet {
    pub fn new() -> ListenerSet {
        ListenerSet { listeners: Vec::new() }
    }

    pub fn register(&mut self, listener: impl FnMut(&mut NamespaceChange) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn dispatch(&mut self, change: &mut NamespaceChange) {
        for listener in &mut self.listeners {
            listener(change);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl Default for ListenerSet {
    fn default() -> ListenerSet {
        ListenerSet::new()
    }
}
