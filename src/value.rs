//! The type tag and type-erased value cell shared by parameters and object
//! identity.
//!
//! `DataType` unifies two roles the host SDK keeps in one enum: the type of
//! a parameter value, and the kind of object a node in the graph is. Folding
//! both into one tag is what lets [`AnyValue`] hold an object-typed
//! parameter without a second, parallel "kind" enum.

use crate::error::{Error, Result};
use crate::object::Object;
use crate::refcount::IntrusivePtr;
use std::fmt;

/// Size in bytes of [`AnyValue`]'s inline POD buffer: a 4x4 `f32` matrix.
const INLINE_CAPACITY: usize = 16 * std::mem::size_of::<f32>();

/// Parameter-value / object-kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
    Float32Vec2,
    Float32Vec3,
    Float32Vec4,
    Float32Mat4,
    String,
    Object(ObjectKind),
}

/// The subset of [`DataType`] that denotes an object rather than a POD or
/// string value. Kept as its own enum so [`crate::state::ObjectCounts`] can
/// index an array by kind without matching the full [`DataType`] space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Device,
    Array,
    Frame,
    Unknown,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 4] = [
        ObjectKind::Device,
        ObjectKind::Array,
        ObjectKind::Frame,
        ObjectKind::Unknown,
    ];

    pub fn index(self) -> usize {
        match self {
            ObjectKind::Device => 0,
            ObjectKind::Array => 1,
            ObjectKind::Frame => 2,
            ObjectKind::Unknown => 3,
        }
    }
}

impl DataType {
    /// Byte width of the POD payload this type carries, or `None` for
    /// `String`/`Object` which are not stored inline.
    pub fn pod_size(self) -> Option<usize> {
        use DataType::*;
        Some(match self {
            Bool => std::mem::size_of::<bool>(),
            Int32 | Uint32 => 4,
            Int64 | Uint64 => 8,
            Float32 => 4,
            Float64 => 8,
            Float32Vec2 => 8,
            Float32Vec3 => 12,
            Float32Vec4 => 16,
            Float32Mat4 => 64,
            String | Object(_) => return None,
        })
    }

    /// Relative ordering used to sort the commit queue: objects other
    /// nodes can depend on (arrays, then generic objects) commit before
    /// the things that read them (frames, devices).
    pub fn commit_priority(self) -> i32 {
        match self {
            DataType::Object(ObjectKind::Array) => 0,
            DataType::Object(ObjectKind::Unknown) => 10,
            DataType::Object(ObjectKind::Frame) => 20,
            DataType::Object(ObjectKind::Device) => 30,
            _ => 10,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A type-erased value cell.
///
/// POD payloads up to [`INLINE_CAPACITY`] bytes live inline with no heap
/// allocation; strings and object references get their own arm. Object-typed
/// values are held via [`IntrusivePtr`] (an internal reference), never
/// [`crate::refcount::Handle`] -- a parameter slot is implementation-owned,
/// not application-visible.
#[derive(Clone)]
pub enum AnyValue {
    Pod {
        ty: DataType,
        bytes: [u8; INLINE_CAPACITY],
        len: usize,
    },
    Str(String),
    Object {
        kind: ObjectKind,
        ptr: IntrusivePtr<dyn Object>,
    },
}

impl AnyValue {
    pub fn from_pod<T: Copy>(ty: DataType, value: T) -> Self {
        let len = std::mem::size_of::<T>();
        assert!(
            len <= INLINE_CAPACITY,
            "POD value for {ty:?} does not fit in the inline buffer"
        );
        let mut bytes = [0u8; INLINE_CAPACITY];
        // SAFETY: `T: Copy` and `len <= INLINE_CAPACITY` was just checked.
        unsafe {
            std::ptr::copy_nonoverlapping(
                &value as *const T as *const u8,
                bytes.as_mut_ptr(),
                len,
            );
        }
        AnyValue::Pod { ty, bytes, len }
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        AnyValue::Str(s.into())
    }

    pub fn from_object(kind: ObjectKind, ptr: IntrusivePtr<dyn Object>) -> Self {
        AnyValue::Object { kind, ptr }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            AnyValue::Pod { ty, .. } => *ty,
            AnyValue::Str(_) => DataType::String,
            AnyValue::Object { kind, .. } => DataType::Object(*kind),
        }
    }

    /// Typed read-back of a POD value. Returns `None` on type mismatch or
    /// size mismatch, never panics.
    pub fn as_pod<T: Copy>(&self, expect: DataType) -> Option<T> {
        match self {
            AnyValue::Pod { ty, bytes, len } if *ty == expect => {
                if *len != std::mem::size_of::<T>() {
                    return None;
                }
                // SAFETY: len matches size_of::<T>() and bytes was
                // populated from a T-shaped value in from_pod.
                Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AnyValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IntrusivePtr<dyn Object>> {
        match self {
            AnyValue::Object { ptr, .. } => Some(ptr),
            _ => None,
        }
    }

    /// Value equality used by `ParamSet::set` to decide whether a
    /// `setParameter` call with the same value is a no-op. Object-typed
    /// values compare by pointee identity, not structural content.
    pub fn value_eq(&self, other: &AnyValue) -> bool {
        match (self, other) {
            (AnyValue::Pod { ty: t1, bytes: b1, len: l1 }, AnyValue::Pod { ty: t2, bytes: b2, len: l2 }) => {
                t1 == t2 && l1 == l2 && b1[..*l1] == b2[..*l2]
            }
            (AnyValue::Str(a), AnyValue::Str(b)) => a == b,
            (AnyValue::Object { kind: k1, ptr: p1 }, AnyValue::Object { kind: k2, ptr: p2 }) => {
                k1 == k2 && IntrusivePtr::ptr_eq(p1, p2)
            }
            _ => false,
        }
    }

    /// Byte length this value would occupy in a flat buffer, or `None` for
    /// object-typed values, which have no flat representation.
    pub fn flat_byte_len(&self) -> Option<usize> {
        match self {
            AnyValue::Pod { len, .. } => Some(*len),
            AnyValue::Str(s) => Some(s.len()),
            AnyValue::Object { .. } => None,
        }
    }

    /// `anariGetProperty`'s buffer-writing form: copy this value's bytes
    /// into `out`, returning how many were written.
    pub fn copy_into(&self, out: &mut [u8]) -> Result<usize> {
        let needed = self
            .flat_byte_len()
            .ok_or_else(|| Error::InvalidArgument("property value has no flat byte representation".into()))?;
        if out.len() < needed {
            return Err(Error::PropertyBufferTooSmall { needed, available: out.len() });
        }
        match self {
            AnyValue::Pod { bytes, len, .. } => out[..*len].copy_from_slice(&bytes[..*len]),
            AnyValue::Str(s) => out[..needed].copy_from_slice(s.as_bytes()),
            AnyValue::Object { .. } => unreachable!("flat_byte_len returned Some for an object value"),
        }
        Ok(needed)
    }
}

impl fmt::Debug for AnyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnyValue::Pod { ty, .. } => write!(f, "AnyValue::Pod({ty:?})"),
            AnyValue::Str(s) => write!(f, "AnyValue::Str({s:?})"),
            AnyValue::Object { kind, .. } => write!(f, "AnyValue::Object({kind:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_round_trip() {
        let v = AnyValue::from_pod(DataType::Float32, 3.5f32);
        assert_eq!(v.as_pod::<f32>(DataType::Float32), Some(3.5));
        assert_eq!(v.as_pod::<i32>(DataType::Int32), None);
    }

    #[test]
    fn matrix_fits_inline() {
        let m = [0f32; 16];
        let v = AnyValue::from_pod(DataType::Float32Mat4, m);
        assert_eq!(v.data_type(), DataType::Float32Mat4);
    }

    #[test]
    fn string_round_trip() {
        let v = AnyValue::from_string("channel.color");
        assert_eq!(v.as_str(), Some("channel.color"));
        assert_eq!(v.data_type(), DataType::String);
    }

    #[test]
    fn copy_into_reports_buffer_too_small() {
        let v = AnyValue::from_pod(DataType::Float32, 1.0f32);
        let mut small = [0u8; 2];
        let err = v.copy_into(&mut small).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::PropertyBufferTooSmall { needed: 4, available: 2 }
        ));
    }

    #[test]
    fn copy_into_succeeds_when_buffer_fits() {
        let v = AnyValue::from_pod(DataType::Float32, 2.5f32);
        let mut buf = [0u8; 4];
        let n = v.copy_into(&mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(f32::from_le_bytes(buf), 2.5);
    }
}
