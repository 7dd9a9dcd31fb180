//! The debug device's own handle namespace.
//!
//! Grounded on `DebugDevice`'s `objectMap` and `newObjectHandle`/
//! `wrapObjectHandle`/`unwrapObjectHandle` trio: every object the backend
//! hands back gets wrapped in a debug-namespace [`crate::handle::Id`]
//! the application actually holds, plus a reverse map so a handle the
//! backend passes back unprompted (e.g. in a frame-completion callback)
//! can be translated back into the debug namespace.

use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;

use crate::debug::descriptor::Descriptor;
use crate::handle::Id;
use crate::object::Object;
use crate::registry::Registry;

pub struct HandleTable {
    registry: Registry<Descriptor>,
    wrapped_to_debug: HashMap<NonNull<dyn Object>, Id<Descriptor>>,
    /// Addresses this table has previously tracked and since released,
    /// kept so a call against a released handle can be told apart from
    /// one this device never saw at all (`Error::ReleasedHandle` vs
    /// `Error::UnknownHandle`).
    released: HashSet<NonNull<dyn Object>>,
}

// SAFETY: the table is only ever accessed behind the debug device's own
// lock (see debug::device::DebugDevice); the raw pointer key is never
// dereferenced, only compared and hashed by address.
unsafe impl Send for HandleTable {}
unsafe impl Sync for HandleTable {}

impl Default for HandleTable {
    fn default() -> Self {
        Self {
            registry: Registry::new(),
            wrapped_to_debug: HashMap::new(),
            released: HashSet::new(),
        }
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `newObjectHandle`: allocate a fresh debug handle for a
    /// newly-wrapped backend object.
    pub fn wrap_new(&mut self, descriptor: Descriptor) -> Id<Descriptor> {
        let wrapped_ptr = descriptor.wrapped.as_non_null();
        let id = self.registry.insert(descriptor);
        self.wrapped_to_debug.insert(wrapped_ptr, id);
        id
    }

    /// `unwrapObjectHandle`: debug handle -> wrapped backend handle.
    pub fn unwrap(&self, id: Id<Descriptor>) -> Option<&Descriptor> {
        self.registry.get(id)
    }

    pub fn unwrap_mut(&mut self, id: Id<Descriptor>) -> Option<&mut Descriptor> {
        self.registry.get_mut(id)
    }

    /// `wrapObjectHandle`: a wrapped backend handle the backend handed us
    /// unprompted (e.g. in a completion callback) -> the debug handle the
    /// application actually knows about.
    pub fn wrap_existing(&self, wrapped: NonNull<dyn Object>) -> Option<Id<Descriptor>> {
        self.wrapped_to_debug.get(&wrapped).copied()
    }

    pub fn release(&mut self, id: Id<Descriptor>) -> Option<Descriptor> {
        let descriptor = self.registry.remove(id)?;
        let wrapped = descriptor.wrapped.as_non_null();
        self.wrapped_to_debug.remove(&wrapped);
        self.released.insert(wrapped);
        Some(descriptor)
    }

    /// Whether `wrapped` is an address this table tracked and has since
    /// released, as opposed to one it never saw.
    pub fn was_released(&self, wrapped: NonNull<dyn Object>) -> bool {
        self.released.contains(&wrapped)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<Descriptor>, &Descriptor)> {
        self.registry.iter()
    }
}
