//! The trait a backend implements: the Rust-level stand-in for the C-ABI
//! surface an application would call through. One method per entry point
//! named in the external-interfaces design, taking owned/borrowed Rust
//! values and returning `Result` in place of an out-parameter plus status
//! callback.

use std::sync::Arc;

use crate::array::{Array, Deleter};
use crate::error::{Error, Result};
use crate::frame::{Channel, Frame, WaitMask};
use crate::object::{Object, ObserverPtr, UnknownObject};
use crate::refcount::Handle;
use crate::state::GlobalState;
use crate::value::{AnyValue, DataType, ObjectKind};

/// The boundary the debug device wraps and every concrete backend
/// implements. Handles crossing this boundary are always
/// `Handle<dyn Object>` -- callers never need a concrete object type.
pub trait Device: Send + Sync {
    fn state(&self) -> &Arc<GlobalState>;

    /// `anariNewObject`: construct an object of the given ANARI-style
    /// data type and subtype string. Unrecognized subtypes still return a
    /// handle (to `UnknownObject`) rather than failing the call, matching
    /// the reference implementation's fallback object convention.
    fn new_object(&self, kind: ObjectKind, subtype: &str) -> Handle<dyn Object>;

    fn new_array(
        &self,
        element_type: DataType,
        dims: Vec<usize>,
        bytes: Vec<u8>,
        deleter: Option<Deleter>,
    ) -> Handle<dyn Object> {
        crate::api_log!("new_array({element_type:?}, {dims:?})");
        let weak = Arc::downgrade(self.state());
        let array = if let Some(deleter) = deleter {
            Array::new_captured(element_type, dims, bytes, deleter, weak)
        } else {
            Array::new_shared(element_type, dims, bytes, weak)
        };
        Handle::from_boxed(Box::new(array)).into_dyn()
    }

    fn new_frame(&self) -> Handle<dyn Object> {
        crate::api_log!("new_frame()");
        let weak = Arc::downgrade(self.state());
        Handle::from_boxed(Box::new(Frame::new(weak))).into_dyn()
    }

    fn set_parameter(&self, object: &Handle<dyn Object>, name: &str, value: AnyValue) -> Result<()> {
        crate::api_log!("set_parameter({name:?})");
        // An object-typed parameter makes `object` depend on its pointee:
        // register the observer edge before (or in place of) the owning
        // edge so the pointee's observer set always reflects what is
        // currently set, never a stale or doubled-up registration.
        match value.as_object() {
            Some(pointee) => {
                // SAFETY: `object` owns this `ObserverPtr` through its own
                // `ObjectBase` and detaches it no later than its own drop.
                let edge = unsafe { ObserverPtr::new(pointee.clone(), object.as_ref()) };
                object.base().set_observed_edge(name.to_string(), edge);
            }
            None => object.base().clear_observed_edge(name),
        }
        object.base().set_param(name.to_string(), value);
        Ok(())
    }

    fn unset_parameter(&self, object: &Handle<dyn Object>, name: &str) {
        object.base().unset_param(name);
        object.base().clear_observed_edge(name);
    }

    fn unset_all_parameters(&self, object: &Handle<dyn Object>) {
        object.base().unset_all_params();
        object.base().clear_all_observed_edges();
    }

    /// `anariCommitParameters`: stages the object onto the device's
    /// commit queue. Nothing takes effect until the next render-frame
    /// flush (or an explicit caller-side flush, for subtypes that need
    /// immediate synchronous application -- the device object itself, for
    /// instance).
    fn commit_parameters(&self, object: &Handle<dyn Object>) {
        crate::api_log!("commit_parameters()");
        if !object.base().needs_commit() {
            self.state().report(
                crate::error::StatusSeverity::Warning,
                "committing object with no pending parameter changes",
                Some(object.as_ref()),
            );
        }
        self.state()
            .commit_queue()
            .lock()
            .enqueue(object.to_intrusive());
    }

    fn get_property(&self, object: &Handle<dyn Object>, name: &str) -> Option<AnyValue> {
        if name == "valid" {
            return Some(AnyValue::from_pod(DataType::Bool, object.is_valid()));
        }
        object.get_property(name)
    }

    /// `anariGetProperty`'s buffer-writing form: same lookup as
    /// [`Device::get_property`], but copies the result into a caller-owned
    /// buffer instead of returning an owned [`AnyValue`]. Errors with
    /// [`Error::PropertyBufferTooSmall`] if `out` cannot hold the value.
    fn get_property_into(&self, object: &Handle<dyn Object>, name: &str, out: &mut [u8]) -> Result<usize> {
        let value = self
            .get_property(object, name)
            .ok_or_else(|| Error::InvalidArgument(format!("no such property '{name}'")))?;
        value.copy_into(out)
    }

    fn release(&self, object: Handle<dyn Object>) {
        crate::api_log!("release()");
        if !object.is_valid() {
            self.state().report(
                crate::error::StatusSeverity::Warning,
                "releasing an object that was never valid",
                None,
            );
        }
        drop(object);
    }

    fn retain(&self, object: &Handle<dyn Object>) -> Handle<dyn Object> {
        object.clone()
    }

    /// Drain the commit/finalize pipeline to a fixed point. Called by
    /// `render_frame` before the backend's render routine runs, and
    /// available directly for callers that want an explicit flush point.
    fn flush(&self) -> Result<()> {
        let mut commit_queue = self.state().commit_queue().lock();
        let mut finalize_queue = self.state().finalize_queue().lock();
        crate::commit::flush(&mut commit_queue, &mut finalize_queue)
    }

    fn render_frame(&self, frame: &Handle<dyn Object>) -> Result<()> {
        crate::api_log!("render_frame()");
        self.flush()?;
        let frame = downcast_frame(frame)?;
        self.state().rendering_gate().begin_render();
        let result = frame.render_frame();
        self.state().rendering_gate().end_render();
        result
    }

    fn frame_ready(&self, frame: &Handle<dyn Object>, mask: WaitMask) -> Result<bool> {
        Ok(downcast_frame(frame)?.frame_ready(mask))
    }

    fn discard_frame(&self, frame: &Handle<dyn Object>) -> Result<()> {
        downcast_frame(frame)?.discard();
        Ok(())
    }

    fn map_frame(&self, frame: &Handle<dyn Object>, channel: Channel) -> Result<(Vec<u8>, u32, u32)> {
        let frame = downcast_frame(frame)?;
        self.state().rendering_gate().begin_map();
        let result = frame.map(channel);
        if result.is_err() {
            self.state().rendering_gate().end_map();
        }
        result
    }

    fn unmap_frame(&self, frame: &Handle<dyn Object>, channel: Channel) -> Result<()> {
        let result = downcast_frame(frame)?.unmap(channel);
        if result.is_ok() {
            self.state().rendering_gate().end_map();
        }
        result
    }

    fn map_array(&self, array: &Handle<dyn Object>) -> Result<*mut u8> {
        let array = downcast_array(array)?;
        self.state().rendering_gate().begin_map();
        let result = array.map();
        if result.is_err() {
            self.state().rendering_gate().end_map();
        }
        result
    }

    fn unmap_array(&self, array: &Handle<dyn Object>) -> Result<()> {
        let result = downcast_array(array)?.unmap();
        if result.is_ok() {
            self.state().rendering_gate().end_map();
        }
        result
    }
}

/// A minimal in-process device used by tests and by the debug device's own
/// unit tests as a wrapped backend: commits run, frames "render"
/// synchronously with an empty channel, arrays behave normally.
pub struct LocalDevice {
    state: Arc<GlobalState>,
}

impl LocalDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(GlobalState::new()),
        }
    }
}

impl Default for LocalDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for LocalDevice {
    fn state(&self) -> &Arc<GlobalState> {
        &self.state
    }

    fn new_object(&self, kind: ObjectKind, subtype: &str) -> Handle<dyn Object> {
        let weak = Arc::downgrade(&self.state);
        Handle::from_boxed(Box::new(UnknownObject::new(kind, subtype, weak))).into_dyn()
    }
}

fn downcast_frame(object: &Handle<dyn Object>) -> Result<&Frame> {
    object
        .as_any()
        .downcast_ref::<Frame>()
        .ok_or_else(|| Error::InvalidArgument("handle does not refer to a frame".into()))
}

fn downcast_array(object: &Handle<dyn Object>) -> Result<&Array> {
    object
        .as_any()
        .downcast_ref::<Array>()
        .ok_or_else(|| Error::InvalidArgument("handle does not refer to an array".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_parameter_then_get_property_round_trips() {
        let device = LocalDevice::new();
        let object = device.new_object(ObjectKind::Unknown, "probe");
        device
            .set_parameter(&object, "exposure", AnyValue::from_pod(DataType::Float32, 1.5f32))
            .unwrap();
        let read_back = device.get_property(&object, "exposure").unwrap();
        assert_eq!(read_back.as_pod::<f32>(DataType::Float32), Some(1.5));
    }

    #[test]
    fn valid_property_reflects_object_validity() {
        let device = LocalDevice::new();
        let unknown = device.new_object(ObjectKind::Unknown, "bogus-subtype");
        let valid = device.get_property(&unknown, "valid").unwrap();
        assert_eq!(valid.as_pod::<bool>(DataType::Bool), Some(false));
    }

    #[test]
    fn get_property_into_fills_caller_buffer() {
        let device = LocalDevice::new();
        let frame = device.new_frame();
        let mut buf = [0u8; 4];
        let n = device.get_property_into(&frame, "valid", &mut buf).unwrap();
        assert_eq!(n, std::mem::size_of::<bool>());
    }

    #[test]
    fn get_property_into_reports_too_small_buffer() {
        let device = LocalDevice::new();
        let frame = device.new_frame();
        let mut buf: [u8; 0] = [];
        let err = device.get_property_into(&frame, "valid", &mut buf).unwrap_err();
        assert!(matches!(err, Error::PropertyBufferTooSmall { .. }));
    }

    #[test]
    fn render_frame_rejects_an_array_handle() {
        let device = LocalDevice::new();
        let array = device.new_array(DataType::Float32, vec![1], vec![0, 0, 0, 0], None);
        assert!(device.render_frame(&array).is_err());
    }
}
