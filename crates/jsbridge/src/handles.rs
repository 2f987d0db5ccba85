//! Persistent handle table and named object registry.
//!
//! Engine values referenced from host code must be pinned so the collector
//! does not reclaim them. The table wraps each pinned value in a durable
//! [`HandleId`] with an explicit create/dispose lifecycle; ids are never
//! reused, so a double dispose is reported instead of corrupting a slot.
//!
//! The table is generic over the stored handle type so the lifecycle logic is
//! testable off the runtime thread. The runtime instantiates it with
//! `v8::Global` values.

use std::collections::HashMap;

use crate::error::HandleError;

/// Stable identifier for a pinned engine value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub(crate) u32);

pub(crate) struct HandleTable<T> {
    live: HashMap<u32, T>,
    next_id: u32,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            live: HashMap::new(),
            next_id: 1,
        }
    }

    /// Pins `value` and returns its durable id. `is_object` is the caller's
    /// kind check; a non-object value is refused.
    pub fn create(&mut self, value: T, is_object: bool) -> Result<HandleId, HandleError> {
        if !is_object {
            return Err(HandleError::InvalidValueKind);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id, value);
        Ok(HandleId(id))
    }

    /// Resolves a live handle. Failing here means a lifecycle bug upstream.
    pub fn unwrap(&self, id: HandleId) -> Result<&T, HandleError> {
        self.live.get(&id.0).ok_or(HandleError::NotAnObject(id))
    }

    /// Releases the handle, returning the stored value so the caller can
    /// drop it inside the engine's domain. Must be called exactly once per
    /// [`create`](Self::create).
    pub fn dispose(&mut self, id: HandleId) -> Result<T, HandleError> {
        match self.live.remove(&id.0) {
            Some(value) => Ok(value),
            // Ids are allocated monotonically and never reused, so a
            // non-live id inside the allocated range must already have been
            // disposed; anything outside it was never created.
            None if id.0 >= 1 && id.0 < self.next_id => Err(HandleError::AlreadyDisposed(id)),
            None => Err(HandleError::NotAnObject(id)),
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Drops every live handle. Used at shutdown so the runtime thread does
    /// not leak pinned values when torn down mid-flight.
    pub fn dispose_all(&mut self) -> usize {
        let count = self.live.len();
        self.live.clear();
        count
    }
}

/// Name -> handle mapping for objects addressable from the host.
pub(crate) struct ObjectRegistry {
    by_name: HashMap<String, HandleId>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
        }
    }

    /// Registers `id` under `name`. A previous registration under the same
    /// name is replaced; the caller disposes the displaced handle.
    pub fn register(&mut self, name: impl Into<String>, id: HandleId) -> Option<HandleId> {
        let name = name.into();
        let previous = self.by_name.insert(name.clone(), id);
        if previous.is_some() {
            log::debug!("object registry: `{name}` re-registered");
        }
        previous
    }

    pub fn lookup(&self, name: &str) -> Option<HandleId> {
        self.by_name.get(name).copied()
    }

    /// Removes the mapping. Unregistering a name twice is a well-defined
    /// no-op returning `None`.
    pub fn unregister(&mut self, name: &str) -> Option<HandleId> {
        self.by_name.remove(name)
    }

    /// Drains every mapping, handing the handles back for disposal.
    pub fn unregister_all(&mut self) -> Vec<HandleId> {
        self.by_name.drain().map(|(_, id)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }
}
