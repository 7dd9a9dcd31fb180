//! Feature-usage accounting.
//!
//! Grounded on the reference implementation's end-of-device-lifetime
//! summary of which data types, subtypes, and parameter names an
//! application actually exercised. The full table there is generated per
//! concrete backend and keyed by extension id; that generator is a
//! collaborator and out of scope here. What this module owns is the
//! counting machinery plus a small static table covering the object kinds
//! this crate defines, emitted as informational status records when the
//! device is released.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

use crate::error::{StatusCode, StatusRecord, StatusSeverity};
use crate::value::ObjectKind;

/// Parameter names every object recognizes regardless of subtype. Built
/// once and reused across every `FeatureUsage` instance rather than per
/// device, since the set is fixed for the lifetime of the crate.
static WELL_KNOWN_PARAMETERS: Lazy<[&str; 2]> = Lazy::new(|| ["name", "userData"]);

#[derive(Default)]
pub struct FeatureUsage {
    subtypes: BTreeMap<(ObjectKind, String), usize>,
    parameter_names: BTreeMap<String, usize>,
    unrecognized_parameters: BTreeMap<String, usize>,
}

impl FeatureUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_object(&mut self, kind: ObjectKind, subtype: &str) {
        *self
            .subtypes
            .entry((kind, subtype.to_string()))
            .or_insert(0) += 1;
    }

    pub fn record_parameter(&mut self, name: &str) {
        *self.parameter_names.entry(name.to_string()).or_insert(0) += 1;
        if !WELL_KNOWN_PARAMETERS.contains(&name) {
            *self.unrecognized_parameters.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    /// Informational status records summarizing what was exercised,
    /// meant to be emitted once at device-teardown time.
    pub fn summary(&self) -> Vec<StatusRecord> {
        let mut records: Vec<StatusRecord> = self
            .subtypes
            .iter()
            .map(|((kind, subtype), count)| {
                StatusRecord::new(
                    StatusSeverity::Info,
                    StatusCode::NoError,
                    format!("{kind:?}/{subtype}: created {count} time(s)"),
                )
            })
            .collect();
        records.extend(self.parameter_names.iter().map(|(name, count)| {
            StatusRecord::new(
                StatusSeverity::Info,
                StatusCode::NoError,
                format!("parameter '{name}' set {count} time(s)"),
            )
        }));
        records.extend(self.unrecognized_parameters.keys().map(|name| {
            StatusRecord::new(
                StatusSeverity::Performance,
                StatusCode::NoError,
                format!("parameter '{name}' is not one of the well-known parameter names"),
            )
        }));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_per_subtype() {
        let mut usage = FeatureUsage::new();
        usage.record_object(ObjectKind::Array, "array1d");
        usage.record_object(ObjectKind::Array, "array1d");
        usage.record_object(ObjectKind::Frame, "frame");
        let summary = usage.summary();
        assert_eq!(summary.len(), 2);
    }

    #[test]
    fn parameter_counts_accumulate() {
        let mut usage = FeatureUsage::new();
        usage.record_parameter("exposure");
        usage.record_parameter("exposure");
        let summary = usage.summary();
        assert!(summary.iter().any(|r| r.message.contains("2 time(s)")));
    }

    #[test]
    fn unrecognized_parameter_noted_but_well_known_is_not() {
        let mut usage = FeatureUsage::new();
        usage.record_parameter("name");
        usage.record_parameter("exposure");
        let summary = usage.summary();
        assert!(summary
            .iter()
            .any(|r| r.message.contains("exposure") && r.message.contains("not one of")));
        assert!(!summary
            .iter()
            .any(|r| r.message.contains("'name'") && r.message.contains("not one of")));
    }
}
