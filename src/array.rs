//! Array ownership regimes and privatization.
//!
//! An array wraps application memory under one of three regimes:
//! `Shared` (application keeps ownership, must outlive the array),
//! `Captured` (application hands over memory plus a deleter the array
//! invokes exactly once), or `Managed` (the array allocated its own
//! storage up front). `Shared`/`Captured` storage is copied into a fresh
//! `Managed` buffer the first time the array's public references all go
//! away but internal references (e.g. a still-staged parameter or an
//! in-flight render) keep it alive -- this is `privatize`, since the
//! application can no longer be relied on to keep the backing memory live.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Weak;

use crate::error::{Error, Result};
use crate::object::{Object, ObjectBase};
use crate::refcount::{RefCounted, RefCountedNode};
use crate::state::GlobalState;
use crate::value::{DataType, ObjectKind};

/// Most arrays are rank 1-3; inlining up to 4 dims avoids a heap allocation
/// for the overwhelming majority of them.
type Dims = SmallVec<[usize; 4]>;

/// A deleter callback captured arrays invoke exactly once, when the array
/// is freed or privatized. Modeled after `ANARIMemoryDeleter`: a function
/// pointer plus an opaque user-data pointer, carried here as a boxed
/// closure since this crate has no C ABI of its own to marshal through.
pub type Deleter = Box<dyn FnOnce() + Send>;

enum Storage {
    /// Application-owned memory; the array never frees it.
    Shared { bytes: Vec<u8> },
    /// Application-owned memory with a deleter to invoke on last release.
    Captured { bytes: Vec<u8>, deleter: Option<Deleter> },
    /// Array-owned memory, as a result of construction or of
    /// [`Array::privatize`].
    Managed { bytes: Vec<u8> },
}

impl Storage {
    fn bytes(&self) -> &[u8] {
        match self {
            Storage::Shared { bytes } | Storage::Captured { bytes, .. } | Storage::Managed { bytes } => bytes,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Storage::Shared { bytes } | Storage::Captured { bytes, .. } | Storage::Managed { bytes } => bytes,
        }
    }

    fn is_private(&self) -> bool {
        matches!(self, Storage::Managed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapState {
    Unmapped,
    Mapped,
}

/// A one-dimensional typed array of application or array-owned memory.
/// Higher-rank arrays (`Array2D`/`Array3D` in the wider object model) are
/// the same storage plus a shape; only the shape differs, so this type
/// carries an explicit `dims` rather than duplicating the storage logic.
pub struct Array {
    base: ObjectBase,
    element_type: DataType,
    dims: Dims,
    storage: Mutex<Storage>,
    map_state: Mutex<MapState>,
}

impl Array {
    /// Construct a `Shared` array over application memory.
    pub fn new_shared(
        element_type: DataType,
        dims: impl Into<Dims>,
        bytes: Vec<u8>,
        device: Weak<GlobalState>,
    ) -> Self {
        Self::new(element_type, dims.into(), Storage::Shared { bytes }, device)
    }

    /// Construct a `Captured` array: application memory plus a deleter.
    /// Per the source invariant, captured and shared cannot both be true
    /// of one array -- captured always implies a deleter will eventually
    /// run exactly once, shared implies the application manages lifetime
    /// itself and no deleter is invoked.
    pub fn new_captured(
        element_type: DataType,
        dims: impl Into<Dims>,
        bytes: Vec<u8>,
        deleter: Deleter,
        device: Weak<GlobalState>,
    ) -> Self {
        Self::new(
            element_type,
            dims.into(),
            Storage::Captured {
                bytes,
                deleter: Some(deleter),
            },
            device,
        )
    }

    /// Construct a `Managed` array: the array allocates and owns its own
    /// storage from the start.
    pub fn new_managed(element_type: DataType, dims: impl Into<Dims>, device: Weak<GlobalState>) -> Self {
        let dims = dims.into();
        let len = dims.iter().product::<usize>() * element_type.pod_size().unwrap_or(1);
        Self::new(element_type, dims, Storage::Managed { bytes: vec![0u8; len] }, device)
    }

    fn new(element_type: DataType, dims: Dims, storage: Storage, device: Weak<GlobalState>) -> Self {
        Self {
            base: ObjectBase::new(ObjectKind::Array, "array", device),
            element_type,
            dims,
            storage: Mutex::new(storage),
            map_state: Mutex::new(MapState::Unmapped),
        }
    }

    pub fn element_type(&self) -> DataType {
        self.element_type
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `anariMapArray`: returns a raw pointer valid until the matching
    /// `unmap`. Errors if the array is already mapped.
    pub fn map(&self) -> Result<*mut u8> {
        let mut state = self.map_state.lock();
        if *state == MapState::Mapped {
            return Err(Error::InvalidArgument("array is already mapped".into()));
        }
        *state = MapState::Mapped;
        Ok(self.storage.lock().bytes_mut().as_mut_ptr())
    }

    /// `anariUnmapArray`: marks the parameter-changed timestamp, since
    /// mapped writes are exactly the kind of out-of-band mutation the
    /// commit pipeline must learn about.
    pub fn unmap(&self) -> Result<()> {
        let mut state = self.map_state.lock();
        if *state != MapState::Mapped {
            return Err(Error::NotMapped);
        }
        *state = MapState::Unmapped;
        self.base.mark_updated();
        Ok(())
    }

    pub fn is_mapped(&self) -> bool {
        *self.map_state.lock() == MapState::Mapped
    }

    pub fn byte_len(&self) -> usize {
        self.storage.lock().bytes().len()
    }

    /// Copy shared/captured bytes into freshly allocated, array-owned
    /// storage, running a captured deleter exactly once in the process.
    /// A no-op if the array is already `Managed`.
    pub fn privatize(&self) {
        let mut storage = self.storage.lock();
        if storage.is_private() {
            return;
        }
        let owned = storage.bytes().to_vec();
        let old = std::mem::replace(&mut *storage, Storage::Managed { bytes: owned });
        if let Storage::Captured { deleter: Some(deleter), .. } = old {
            deleter();
        }
    }
}

impl RefCountedNode for Array {
    fn ref_counted(&self) -> &RefCounted {
        self.base.ref_counted()
    }

    fn on_no_public_references(&self) {
        self.privatize();
    }
}

impl Object for Array {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refcount::Handle;

    #[test]
    fn privatize_copies_shared_bytes() {
        let arr = Handle::from_boxed(Box::new(Array::new_shared(
            DataType::Float32,
            vec![4],
            vec![1, 2, 3, 4],
            Weak::new(),
        )));
        let internal = arr.to_intrusive();
        drop(arr);
        assert_eq!(internal.byte_len(), 4);
        assert_eq!(internal.storage.lock().bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn captured_deleter_runs_once_on_privatize() {
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ran2 = ran.clone();
        let arr = Array::new_captured(
            DataType::Float32,
            vec![1],
            vec![9],
            Box::new(move || {
                ran2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
            Weak::new(),
        );
        arr.privatize();
        arr.privatize();
        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn map_unmap_round_trip() {
        let arr = Array::new_managed(DataType::Float32, vec![2], Weak::new());
        assert!(!arr.is_mapped());
        arr.map().unwrap();
        assert!(arr.is_mapped());
        assert!(arr.map().is_err());
        arr.unmap().unwrap();
        assert!(!arr.is_mapped());
        assert!(arr.unmap().is_err());
    }
}
