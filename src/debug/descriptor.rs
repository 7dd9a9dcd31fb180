//! Per-handle bookkeeping record the debug device keeps alongside its own
//! handle table.
//!
//! Grounded on `GenericDebugObject`: every handle the debug device hands
//! out gets its own descriptor tracking the wrapped backend's handle, a
//! name, and simple usage counters (`uncommittedParameters`,
//! `references`) that back the "uncommitted parameters at commit time" /
//! "unused object at release time" validation rules.

use crate::object::Object;
use crate::refcount::Handle;
use crate::value::DataType;

pub struct Descriptor {
    pub data_type: DataType,
    pub subtype: String,
    pub name: Option<String>,
    pub wrapped: Handle<dyn Object>,
    pub uncommitted_parameters: u32,
    pub references: u32,
    pub history: Vec<String>,
    pub rendered: bool,
}

impl Descriptor {
    pub fn new(data_type: DataType, subtype: impl Into<String>, wrapped: Handle<dyn Object>) -> Self {
        Self {
            data_type,
            subtype: subtype.into(),
            name: None,
            wrapped,
            uncommitted_parameters: 0,
            references: 0,
            history: Vec::new(),
            rendered: false,
        }
    }

    pub fn record_set_param(&mut self, name: &str) {
        self.uncommitted_parameters += 1;
        self.history.push(format!("setParameter({name})"));
    }

    pub fn record_unset_param(&mut self, name: &str) {
        self.uncommitted_parameters += 1;
        self.history.push(format!("unsetParameter({name})"));
    }

    pub fn record_commit(&mut self) {
        self.uncommitted_parameters = 0;
        self.history.push("commitParameters".to_string());
    }

    pub fn mark_used(&mut self) {
        self.references += 1;
    }

    /// Registers a referenced-by edge from a parameter-owning object to
    /// this (the parameter value's) descriptor -- the same `references`
    /// bump `mark_used` performs, kept as a distinct call site to match
    /// `DebugObject::referencedBy`'s naming and caller (object-typed
    /// `setParameter`, as opposed to `retain`/`getProperty`).
    pub fn record_referenced_by(&mut self) {
        self.references += 1;
    }

    pub fn mark_rendered(&mut self) {
        self.rendered = true;
        self.history.push("renderFrame".to_string());
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{:?}@{:p}", self.data_type, self.wrapped.as_non_null().as_ptr()))
    }
}
