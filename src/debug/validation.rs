//! Representative validation rules, each producing a [`StatusRecord`].
//!
//! These are diagnostic, not gating: per the error-handling design, a call
//! that trips one of these still forwards to the backend whenever that is
//! safe. Grounded on the reference implementation's scattered
//! `reportMessage`/assertion call sites in `DebugDevice.cpp`, consolidated
//! here into one table of named checks.

use crate::debug::descriptor::Descriptor;
use crate::error::{Error, StatusCode, StatusRecord, StatusSeverity};
use crate::value::DataType;

/// `committing with no pending changes` -> warning.
pub fn check_commit_with_no_changes(descriptor: &Descriptor) -> Option<StatusRecord> {
    if descriptor.uncommitted_parameters == 0 {
        Some(StatusRecord::new(
            StatusSeverity::Warning,
            StatusCode::InvalidOperation,
            format!("committing '{}' with no pending parameter changes", descriptor.display_name()),
        ))
    } else {
        None
    }
}

/// `releasing an unused object` -> warning.
pub fn check_release_unused(descriptor: &Descriptor) -> Option<StatusRecord> {
    if descriptor.references == 0 {
        Some(StatusRecord::new(
            StatusSeverity::Warning,
            StatusCode::InvalidOperation,
            format!("releasing '{}' which was never referenced by another object", descriptor.display_name()),
        ))
    } else {
        None
    }
}

/// `render frame with uncommitted parameters on the frame itself` -> warning.
pub fn check_render_frame_uncommitted(descriptor: &Descriptor) -> Option<StatusRecord> {
    if descriptor.uncommitted_parameters > 0 {
        Some(StatusRecord::new(
            StatusSeverity::Warning,
            StatusCode::InvalidOperation,
            format!("rendering '{}' with uncommitted parameters", descriptor.display_name()),
        ))
    } else {
        None
    }
}

/// `type mismatch in object parameter` -> error. Compares the incoming
/// value's type against whatever `name` was previously set to on the same
/// object, if anything -- the only type expectation this crate can check
/// without a per-subtype parameter schema (out of scope, generated per
/// concrete backend in the reference implementation).
pub fn check_param_type_mismatch(name: &str, previous: DataType, incoming: DataType) -> Option<StatusRecord> {
    if previous == incoming {
        return None;
    }
    let err = Error::ParamTypeMismatch {
        name: name.to_string(),
        expected: previous,
        found: incoming,
    };
    let (severity, code) = err.status();
    Some(StatusRecord::new(severity, code, err.to_string()))
}

/// `frameReady(NO_WAIT)` forcibly upgraded to `WAIT` -- a performance note
/// rather than a correctness warning, emitted when a caller polls a frame
/// that has not been rendered at all yet (there is nothing to poll).
pub fn check_no_wait_upgraded() -> StatusRecord {
    StatusRecord::new(
        StatusSeverity::Performance,
        StatusCode::NoError,
        "frameReady(NO_WAIT) on a frame with no in-flight render was upgraded to a blocking wait",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Object, UnknownObject};
    use crate::refcount::Handle;
    use crate::value::{DataType, ObjectKind};
    use std::sync::Weak;

    fn descriptor() -> Descriptor {
        let obj = Handle::from_boxed(Box::new(UnknownObject::new(ObjectKind::Unknown, "x", Weak::new())));
        let obj: Handle<dyn Object> = obj.into_dyn();
        Descriptor::new(DataType::Object(ObjectKind::Unknown), "x", obj)
    }

    #[test]
    fn commit_with_no_changes_warns() {
        let d = descriptor();
        assert!(check_commit_with_no_changes(&d).is_some());
    }

    #[test]
    fn commit_after_set_param_does_not_warn() {
        let mut d = descriptor();
        d.record_set_param("exposure");
        assert!(check_commit_with_no_changes(&d).is_none());
    }

    #[test]
    fn release_unused_warns() {
        let d = descriptor();
        assert!(check_release_unused(&d).is_some());
    }

    #[test]
    fn release_after_use_does_not_warn() {
        let mut d = descriptor();
        d.mark_used();
        assert!(check_release_unused(&d).is_none());
    }

    #[test]
    fn param_type_mismatch_is_reported_as_an_error() {
        let record = check_param_type_mismatch(
            "exposure",
            DataType::Float32,
            DataType::Object(ObjectKind::Unknown),
        )
        .unwrap();
        assert_eq!(record.severity, crate::error::StatusSeverity::Error);
    }

    #[test]
    fn same_type_is_not_a_mismatch() {
        assert!(check_param_type_mismatch("exposure", DataType::Float32, DataType::Float32).is_none());
    }
}
