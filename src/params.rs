//! Ordered, typed parameter bag.
//!
//! Backed by an `IndexMap` instead of the linear vector scan in the
//! reference implementation: insertion order is preserved (useful for
//! trace replay and debug-device parameter history) while `get`/`set`/
//! `unset` by name are O(1) instead of O(n).

use indexmap::IndexMap;

use crate::value::{AnyValue, DataType};

#[derive(Default)]
pub struct ParamSet {
    map: IndexMap<String, AnyValue>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a parameter. Returns `false`, and leaves the
    /// existing value untouched, if `name` is already set to a
    /// value-equal `AnyValue` -- `setParameter` with an unchanged value is
    /// a no-op, not a fresh mutation.
    pub fn set(&mut self, name: impl Into<String>, value: AnyValue) -> bool {
        let name = name.into();
        if let Some(existing) = self.map.get(&name) {
            if existing.value_eq(&value) {
                return false;
            }
        }
        self.map.insert(name, value);
        true
    }

    /// Returns `true` if `name` was present and has been removed.
    pub fn unset(&mut self, name: &str) -> bool {
        self.map.shift_remove(name).is_some()
    }

    pub fn unset_all(&mut self) {
        self.map.clear();
    }

    pub fn has(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn get_direct(&self, name: &str) -> Option<&AnyValue> {
        self.map.get(name)
    }

    pub fn get_pod<T: Copy>(&self, name: &str, expect: DataType, default: T) -> T {
        self.map
            .get(name)
            .and_then(|v| v.as_pod(expect))
            .unwrap_or(default)
    }

    pub fn get_string<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.map.get(name).and_then(|v| v.as_str()).unwrap_or(default)
    }

    pub fn get_object(
        &self,
        name: &str,
    ) -> Option<&crate::refcount::IntrusivePtr<dyn crate::object::Object>> {
        self.map.get(name).and_then(|v| v.as_object())
    }

    /// Every distinct parameter currently set, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AnyValue)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_unset_round_trip() {
        let mut params = ParamSet::new();
        params.set("exposure", AnyValue::from_pod(DataType::Float32, 1.5f32));
        assert!(params.has("exposure"));
        assert_eq!(params.get_pod::<f32>("exposure", DataType::Float32, 0.0), 1.5);

        params.unset("exposure");
        assert!(!params.has("exposure"));
        assert_eq!(params.get_pod::<f32>("exposure", DataType::Float32, 2.0), 2.0);
    }

    #[test]
    fn unset_all_clears_everything() {
        let mut params = ParamSet::new();
        params.set("a", AnyValue::from_string("x"));
        params.set("b", AnyValue::from_string("y"));
        params.unset_all();
        assert!(!params.has("a"));
        assert!(!params.has("b"));
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut params = ParamSet::new();
        params.set("z", AnyValue::from_string("1"));
        params.set("a", AnyValue::from_string("2"));
        let names: Vec<_> = params.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["z", "a"]);
    }

    #[test]
    fn setting_the_same_value_twice_is_reported_as_a_no_op() {
        let mut params = ParamSet::new();
        assert!(params.set("exposure", AnyValue::from_pod(DataType::Float32, 1.5f32)));
        assert!(!params.set("exposure", AnyValue::from_pod(DataType::Float32, 1.5f32)));
        assert!(params.set("exposure", AnyValue::from_pod(DataType::Float32, 2.0f32)));
    }

    #[test]
    fn unsetting_twice_reports_the_second_call_as_a_no_op() {
        let mut params = ParamSet::new();
        params.set("exposure", AnyValue::from_pod(DataType::Float32, 1.5f32));
        assert!(params.unset("exposure"));
        assert!(!params.unset("exposure"));
    }
}
