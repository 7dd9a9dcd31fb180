//! The validating passthrough device.
//!
//! `DebugDevice` intercepts every call the `device::Device` trait exposes,
//! keeps its own handle table (see `handle_table`) mapping each object to
//! a [`Descriptor`], runs the validation rules in `validation` and the
//! accounting in `feature_usage`, optionally hands the call to a
//! [`Serializer`], and forwards to the wrapped backend.
//!
//! Handle translation here is a side table rather than a second opaque
//! integer handed back to the caller: this crate's API surface is a
//! `Handle<dyn Object>` smart pointer, not a C handle, so the thing that
//! would need translating across a wire boundary is already out of scope
//! (see the external-interfaces design notes). What this device still
//! does, faithfully, is keep an *independent* record of every object
//! that flows through it, keyed off the wrapped object's address, exactly
//! as `DebugDevice::objectMap` does.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::array::Deleter;
use crate::debug::descriptor::Descriptor;
use crate::debug::feature_usage::FeatureUsage;
use crate::debug::handle_table::HandleTable;
use crate::debug::serializer::{NoopSerializer, Serializer, TraceEvent};
use crate::debug::validation;
use crate::device::Device;
use crate::error::{Result, StatusSeverity};
use crate::frame::{Channel, WaitMask};
use crate::object::Object;
use crate::refcount::Handle;
use crate::state::GlobalState;
use crate::value::{AnyValue, DataType, ObjectKind};

pub struct DebugDevice {
    state: Arc<GlobalState>,
    wrapped: Box<dyn Device>,
    handles: Mutex<HandleTable>,
    usage: Mutex<FeatureUsage>,
    serializer: Mutex<Box<dyn Serializer>>,
    device_object: Handle<dyn Object>,
}

fn addr_of(object: &Handle<dyn Object>) -> u64 {
    object.as_non_null().as_ptr() as *const () as u64
}

impl DebugDevice {
    pub fn new(wrapped: Box<dyn Device>) -> Self {
        let state = Arc::new(GlobalState::new());
        let device_object = Handle::from_boxed(Box::new(crate::state::DeviceConfig::new(Arc::downgrade(&state))))
            .into_dyn();
        Self {
            state,
            wrapped,
            handles: Mutex::new(HandleTable::new()),
            usage: Mutex::new(FeatureUsage::new()),
            serializer: Mutex::new(Box::new(NoopSerializer)),
            device_object,
        }
    }

    /// Handle to this device's own parameter-bearing object, matching
    /// `set_parameter(h, name, ...)` being callable with the device handle
    /// itself per the recognized device-parameters table (`traceMode`,
    /// `traceDir`, `wrappedDevice`): staged through `set_parameter` here and
    /// applied on `commit_parameters`, the same as any other object.
    pub fn device_handle(&self) -> Handle<dyn Object> {
        self.device_object.clone()
    }

    fn apply_device_config(&self) {
        let params = self.device_object.base().params().lock();
        let trace_mode = params.get_string("traceMode", "").to_string();
        let trace_dir = params.get_string("traceDir", ".").to_string();
        drop(params);
        if trace_mode == "code" {
            if let Err(err) = self.enable_code_trace(&trace_dir) {
                self.state.report(
                    StatusSeverity::Warning,
                    format!("failed to enable code trace in '{trace_dir}': {err}"),
                    None,
                );
            }
        }
    }

    /// Enable the code-emitting serializer, matching the `traceMode =
    /// "code"` device parameter.
    pub fn enable_code_trace(&self, dir: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        let serializer = crate::debug::serializer::CodeSerializer::create(dir)?;
        *self.serializer.lock() = Box::new(serializer);
        Ok(())
    }

    fn trace(&self, event: TraceEvent<'_>) {
        self.serializer.lock().record(&event);
    }

    fn track(&self, kind: ObjectKind, subtype: &str, wrapped: Handle<dyn Object>) {
        self.usage.lock().record_object(kind, subtype);
        let descriptor = Descriptor::new(DataType::Object(kind), subtype, wrapped);
        self.handles.lock().wrap_new(descriptor);
    }

    /// Looks up `object`'s descriptor, reporting and returning `None` if
    /// the handle isn't tracked: `Error::ReleasedHandle` if this table
    /// previously tracked it and it was released, `Error::UnknownHandle`
    /// otherwise -- the debug device's own handle is never tracked here
    /// (see `device_handle`), so it is exempted rather than misreported.
    fn descriptor_for<'a>(
        &self,
        handles: &'a mut HandleTable,
        object: &Handle<dyn Object>,
    ) -> Option<&'a mut Descriptor> {
        if addr_of(object) == addr_of(&self.device_object) {
            return None;
        }
        let Some(id) = handles.wrap_existing(object.as_non_null()) else {
            let err = if handles.was_released(object.as_non_null()) {
                crate::error::Error::ReleasedHandle
            } else {
                crate::error::Error::UnknownHandle
            };
            let (severity, _code) = err.status();
            self.state.report(severity, err.to_string(), None);
            return None;
        };
        handles.unwrap_mut(id)
    }

    /// Report every object still registered in this device's own handle
    /// table, and flush the serializer. Call at device-teardown time.
    ///
    /// Leak counts come from `handles`, not `self.state`: object creation
    /// always goes through the wrapped backend, which registers counts
    /// against its own `GlobalState`, so this device's `state` never
    /// tracks an `ObjectBase` directly -- `handles` is the bookkeeping
    /// that actually mirrors every object this device has seen.
    pub fn shutdown(mut self) -> Result<()> {
        let mut leaks: std::collections::BTreeMap<ObjectKind, usize> = std::collections::BTreeMap::new();
        for (_, descriptor) in self.handles.lock().iter() {
            if let DataType::Object(kind) = descriptor.data_type {
                *leaks.entry(kind).or_insert(0) += 1;
            }
        }
        for (kind, count) in leaks {
            self.state.report(
                StatusSeverity::Warning,
                format!("{count} object(s) of kind {kind:?} still alive at device release"),
                None,
            );
        }
        for record in self.usage.lock().summary() {
            self.state.report(record.severity, record.message, None);
        }
        self.serializer
            .lock()
            .finish()
            .map_err(|e| crate::error::Error::Fatal(e.to_string()))
    }
}

impl Device for DebugDevice {
    fn state(&self) -> &Arc<GlobalState> {
        &self.state
    }

    fn new_object(&self, kind: ObjectKind, subtype: &str) -> Handle<dyn Object> {
        let handle = self.wrapped.new_object(kind, subtype);
        self.trace(TraceEvent::NewObject {
            handle: addr_of(&handle),
            data_type: DataType::Object(kind),
            subtype,
        });
        self.track(kind, subtype, handle.clone());
        handle
    }

    fn new_array(
        &self,
        element_type: DataType,
        dims: Vec<usize>,
        bytes: Vec<u8>,
        deleter: Option<Deleter>,
    ) -> Handle<dyn Object> {
        let byte_len = bytes.len();
        let handle = self.wrapped.new_array(element_type, dims, bytes, deleter);
        self.trace(TraceEvent::NewArray {
            handle: addr_of(&handle),
            data_type: element_type,
            byte_len,
        });
        self.track(ObjectKind::Array, "array", handle.clone());
        handle
    }

    fn new_frame(&self) -> Handle<dyn Object> {
        let handle = self.wrapped.new_frame();
        self.trace(TraceEvent::NewFrame {
            handle: addr_of(&handle),
        });
        self.track(ObjectKind::Frame, "frame", handle.clone());
        handle
    }

    fn set_parameter(&self, object: &Handle<dyn Object>, name: &str, value: AnyValue) -> Result<()> {
        if addr_of(object) == addr_of(&self.device_object) {
            object.base().set_param(name.to_string(), value);
            return Ok(());
        }
        {
            let mut handles = self.handles.lock();
            // Object-typed parameter: register a referenced-by edge from
            // `object` to the pointee before forwarding, matching
            // `DebugDevice::setParameter`'s `info->referencedBy(object)`.
            if let Some(pointee) = value.as_object() {
                if let Some(id) = handles.wrap_existing(pointee.as_non_null()) {
                    if let Some(descriptor) = handles.unwrap_mut(id) {
                        descriptor.record_referenced_by();
                    }
                }
            }
            let previous_type = object.base().params().lock().get_direct(name).map(|v| v.data_type());
            if let Some(descriptor) = self.descriptor_for(&mut handles, object) {
                if let Some(previous) = previous_type {
                    if let Some(record) = validation::check_param_type_mismatch(name, previous, value.data_type()) {
                        self.state.report(record.severity, record.message, Some(object.as_ref()));
                    }
                }
                descriptor.record_set_param(name);
                if name == "name" {
                    if let Some(s) = value.as_str() {
                        descriptor.set_name(s.to_string());
                    }
                }
            }
        }
        self.usage.lock().record_parameter(name);
        self.wrapped.set_parameter(object, name, value)
    }

    fn unset_parameter(&self, object: &Handle<dyn Object>, name: &str) {
        let mut handles = self.handles.lock();
        if let Some(descriptor) = self.descriptor_for(&mut handles, object) {
            descriptor.record_unset_param(name);
        }
        drop(handles);
        self.wrapped.unset_parameter(object, name);
    }

    fn unset_all_parameters(&self, object: &Handle<dyn Object>) {
        self.wrapped.unset_all_parameters(object);
    }

    fn commit_parameters(&self, object: &Handle<dyn Object>) {
        if addr_of(object) == addr_of(&self.device_object) {
            self.apply_device_config();
            return;
        }
        {
            let mut handles = self.handles.lock();
            if let Some(descriptor) = self.descriptor_for(&mut handles, object) {
                if let Some(record) = validation::check_commit_with_no_changes(descriptor) {
                    self.state.report(record.severity, record.message, Some(object.as_ref()));
                }
                descriptor.record_commit();
            }
        }
        self.wrapped.commit_parameters(object);
    }

    fn get_property(&self, object: &Handle<dyn Object>, name: &str) -> Option<AnyValue> {
        let mut handles = self.handles.lock();
        if let Some(descriptor) = self.descriptor_for(&mut handles, object) {
            descriptor.mark_used();
        }
        drop(handles);
        self.wrapped.get_property(object, name)
    }

    fn release(&self, object: Handle<dyn Object>) {
        let mut handles = self.handles.lock();
        if let Some(id) = handles.wrap_existing(object.as_non_null()) {
            if let Some(descriptor) = handles.unwrap(id) {
                if let Some(record) = validation::check_release_unused(descriptor) {
                    self.state.report(record.severity, record.message, None);
                }
            }
            handles.release(id);
        }
        drop(handles);
        self.wrapped.release(object);
    }

    fn retain(&self, object: &Handle<dyn Object>) -> Handle<dyn Object> {
        let mut handles = self.handles.lock();
        if let Some(descriptor) = self.descriptor_for(&mut handles, object) {
            descriptor.mark_used();
        }
        drop(handles);
        self.wrapped.retain(object)
    }

    fn flush(&self) -> Result<()> {
        self.wrapped.flush()
    }

    fn render_frame(&self, frame: &Handle<dyn Object>) -> Result<()> {
        {
            let mut handles = self.handles.lock();
            if let Some(descriptor) = self.descriptor_for(&mut handles, frame) {
                if let Some(record) = validation::check_render_frame_uncommitted(descriptor) {
                    self.state.report(record.severity, record.message, Some(frame.as_ref()));
                }
                descriptor.mark_rendered();
            }
        }
        self.wrapped.render_frame(frame)
    }

    fn frame_ready(&self, frame: &Handle<dyn Object>, mask: WaitMask) -> Result<bool> {
        let mut effective_mask = mask;
        if mask == WaitMask::NoWait {
            let mut handles = self.handles.lock();
            if let Some(descriptor) = self.descriptor_for(&mut handles, frame) {
                if !descriptor.rendered {
                    let record = validation::check_no_wait_upgraded();
                    self.state.report(record.severity, record.message, Some(frame.as_ref()));
                    effective_mask = WaitMask::Wait;
                }
            }
        }
        self.wrapped.frame_ready(frame, effective_mask)
    }

    fn discard_frame(&self, frame: &Handle<dyn Object>) -> Result<()> {
        self.wrapped.discard_frame(frame)
    }

    fn map_frame(&self, frame: &Handle<dyn Object>, channel: Channel) -> Result<(Vec<u8>, u32, u32)> {
        self.wrapped.map_frame(frame, channel)
    }

    fn unmap_frame(&self, frame: &Handle<dyn Object>, channel: Channel) -> Result<()> {
        self.wrapped.unmap_frame(frame, channel)
    }

    fn map_array(&self, array: &Handle<dyn Object>) -> Result<*mut u8> {
        self.wrapped.map_array(array)
    }

    fn unmap_array(&self, array: &Handle<dyn Object>) -> Result<()> {
        self.wrapped.unmap_array(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LocalDevice;

    #[test]
    fn handle_table_entry_is_removed_on_release() {
        let debug = DebugDevice::new(Box::new(LocalDevice::new()));
        let obj = debug.new_object(ObjectKind::Unknown, "test");
        assert_eq!(debug.handles.lock().len(), 1);

        debug.commit_parameters(&obj);
        debug.release(obj);
        assert_eq!(debug.handles.lock().len(), 0);
    }

    #[test]
    fn setting_an_object_parameter_registers_a_referenced_by_edge() {
        let debug = DebugDevice::new(Box::new(LocalDevice::new()));
        let owner = debug.new_object(ObjectKind::Unknown, "owner");
        let child = debug.new_object(ObjectKind::Unknown, "child");

        debug
            .set_parameter(
                &owner,
                "child",
                AnyValue::from_object(ObjectKind::Unknown, child.to_intrusive()),
            )
            .unwrap();

        let mut handles = debug.handles.lock();
        let id = handles.wrap_existing(child.as_non_null()).unwrap();
        assert_eq!(handles.unwrap(id).unwrap().references, 1);
    }

    #[test]
    fn setting_a_parameter_with_a_different_type_than_before_reports_a_mismatch() {
        let debug = DebugDevice::new(Box::new(LocalDevice::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        debug.state().set_status_callback(move |sev, msg, _obj| {
            seen2.lock().push((sev, msg.to_string()));
        });

        let obj = debug.new_object(ObjectKind::Unknown, "test");
        debug
            .set_parameter(&obj, "exposure", AnyValue::from_pod(DataType::Float32, 1.0f32))
            .unwrap();
        debug
            .set_parameter(&obj, "exposure", AnyValue::from_pod(DataType::Int32, 1i32))
            .unwrap();

        assert!(seen
            .lock()
            .iter()
            .any(|(sev, msg)| *sev == StatusSeverity::Error && msg.contains("type mismatch")));
    }

    #[test]
    fn calling_set_parameter_on_a_released_handle_reports_released_handle() {
        let debug = DebugDevice::new(Box::new(LocalDevice::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        debug.state().set_status_callback(move |sev, msg, _obj| {
            seen2.lock().push((sev, msg.to_string()));
        });

        let obj = debug.new_object(ObjectKind::Unknown, "test");
        let stale = obj.clone();
        debug.release(obj);
        let _ = debug.set_parameter(&stale, "exposure", AnyValue::from_pod(DataType::Float32, 1.0f32));

        assert!(seen
            .lock()
            .iter()
            .any(|(sev, msg)| *sev == StatusSeverity::Error && msg.contains("already been released")));
    }

    #[test]
    fn scenario_leak_detection_at_shutdown() {
        let debug = DebugDevice::new(Box::new(LocalDevice::new()));
        let _leaked = debug.new_object(ObjectKind::Unknown, "leaky");
        // Intentionally not released: the wrapped LocalDevice's own
        // GlobalState should still report one live UnknownObject.
        let leaks = debug.wrapped.state().leak_report();
        assert_eq!(leaks, vec![(ObjectKind::Unknown, 1)]);
    }

    #[test]
    fn frame_ready_no_wait_on_an_unrendered_frame_is_upgraded_to_wait() {
        let debug = DebugDevice::new(Box::new(LocalDevice::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        debug.state().set_status_callback(move |sev, msg, _obj| {
            seen2.lock().push((sev, msg.to_string()));
        });

        let frame = debug.new_frame();
        assert!(debug.frame_ready(&frame, WaitMask::NoWait).unwrap());
        assert!(seen
            .lock()
            .iter()
            .any(|(sev, msg)| *sev == StatusSeverity::Performance && msg.contains("upgraded to a blocking wait")));
    }

    #[test]
    fn frame_ready_no_wait_after_render_is_not_upgraded() {
        let debug = DebugDevice::new(Box::new(LocalDevice::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        debug.state().set_status_callback(move |sev, msg, _obj| {
            seen2.lock().push((sev, msg.to_string()));
        });

        let frame = debug.new_frame();
        debug.render_frame(&frame).unwrap();
        debug.frame_ready(&frame, WaitMask::NoWait).unwrap();
        assert!(!seen.lock().iter().any(|(_, msg)| msg.contains("upgraded")));
    }

    #[test]
    fn committing_trace_mode_code_on_the_device_handle_enables_code_trace() {
        let debug = DebugDevice::new(Box::new(LocalDevice::new()));
        let dir = std::env::temp_dir().join(format!("rdcore-trace-test-{:p}", &debug));
        let device_handle = debug.device_handle();

        debug
            .set_parameter(&device_handle, "traceMode", AnyValue::from_string("code"))
            .unwrap();
        debug
            .set_parameter(
                &device_handle,
                "traceDir",
                AnyValue::from_string(dir.to_str().unwrap()),
            )
            .unwrap();
        debug.commit_parameters(&device_handle);

        assert!(dir.join("out.rs").exists());
        assert!(dir.join("data.bin").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn shutdown_reports_objects_still_in_the_handle_table() {
        let debug = DebugDevice::new(Box::new(LocalDevice::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        debug.state().set_status_callback(move |_sev, msg, _obj| {
            seen2.lock().push(msg.to_string());
        });

        let _leaked = debug.new_object(ObjectKind::Unknown, "leaky");
        debug.shutdown().unwrap();

        assert!(seen.lock().iter().any(|m| m.contains("Unknown") && m.contains("1 object")));
    }
}
