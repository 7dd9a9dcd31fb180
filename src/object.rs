//! The `Object` trait and the `ObjectBase` every concrete object composes.
//!
//! `ObjectBase` is the fixed-layout part every node in the graph shares: its
//! reference count, its type tag, a weak link back to the device that owns
//! it, its parameter bag, its observers, and its four lifecycle timestamps.
//! Concrete object types (a device, an array, a frame, ...) embed one and
//! implement [`Object`] by delegating to it plus whatever subtype-specific
//! behavior `commit_parameters`/`finalize` need.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use crate::error::{Error, Result, StatusSeverity};
use crate::params::ParamSet;
use crate::refcount::{Handle, IntrusivePtr, RefCounted, RefCountedNode};
use crate::state::GlobalState;
use crate::value::{AnyValue, DataType, ObjectKind};

/// A non-owning observer relationship: holds an internal reference to the
/// object being observed, and registers/deregisters `owner`'s address in
/// that object's [`ObserverSet`] for its lifetime. Move-only, since the
/// registration is tied to exactly one slot in the target's observer set.
pub struct ObserverPtr<T: Object + ?Sized> {
    target: IntrusivePtr<T>,
    owner: ObserverToken,
}

impl<T: Object + ?Sized> ObserverPtr<T> {
    /// # Safety
    /// `owner` must remain live for as long as the returned `ObserverPtr`
    /// exists -- in practice this holds because an object always drops
    /// its own `ObserverPtr` fields before it can be deallocated.
    pub unsafe fn new(target: IntrusivePtr<T>, owner: &dyn Object) -> Self {
        let token = ObserverToken::new(owner);
        target.base().observers().attach(token);
        Self { target, owner: token }
    }

    pub fn get(&self) -> &T {
        self.target.as_ref()
    }
}

impl<T: Object + ?Sized> Drop for ObserverPtr<T> {
    fn drop(&mut self) {
        self.target.base().observers().detach(self.owner.addr());
    }
}

/// A non-owning reference to an observing object, used by [`ObserverSet`].
/// Distinct from ownership edges (`IntrusivePtr`) -- this is exactly the
/// back-reference the distilled spec calls out as "must not itself be an
/// owning reference, to avoid a reference cycle between parameter and
/// observer edges."
#[derive(Clone, Copy)]
pub struct ObserverToken(NonNull<dyn Object>);

// SAFETY: the pointee is itself Send + Sync (all Object implementors are),
// and the token is only ever dereferenced while the pointee is known live
// (it is removed from the observer set no later than the pointee's drop).
unsafe impl Send for ObserverToken {}
unsafe impl Sync for ObserverToken {}

impl ObserverToken {
    /// # Safety
    /// `obj` must outlive every use of the returned token, i.e. the caller
    /// must remove it from whatever `ObserverSet` holds it before `obj` is
    /// dropped. In practice this holds because objects always detach their
    /// own token from what they observe in their own teardown path.
    pub unsafe fn new(obj: &dyn Object) -> Self {
        Self(NonNull::from(obj))
    }

    /// # Safety
    /// The pointee must still be live.
    pub unsafe fn get(&self) -> &dyn Object {
        self.0.as_ref()
    }

    pub fn addr(&self) -> NonNull<dyn Object> {
        self.0
    }
}

/// Non-owning set of objects to notify when this object's parameters
/// change or it commits.
#[derive(Default)]
pub struct ObserverSet {
    tokens: Mutex<Vec<ObserverToken>>,
}

impl ObserverSet {
    pub fn attach(&self, token: ObserverToken) {
        self.tokens.lock().push(token);
    }

    pub fn detach(&self, target: NonNull<dyn Object>) {
        self.tokens.lock().retain(|t| t.0 != target);
    }

    /// Invoke `f` for each currently-attached observer.
    ///
    /// # Safety
    /// Every token in the set must still point at a live object.
    pub unsafe fn for_each(&self, mut f: impl FnMut(&dyn Object)) {
        for token in self.tokens.lock().iter() {
            f(token.get());
        }
    }
}

/// The four mutation-tracking timestamps named in the distilled spec:
/// last time a parameter was set/unset, last time the object was
/// considered "updated" by its own commit or by an observed dependency,
/// last time `commit_parameters` actually ran, last time `finalize` ran.
#[derive(Default)]
pub struct Timestamps {
    pub last_changed: AtomicU64,
    pub last_updated: AtomicU64,
    pub last_committed: AtomicU64,
    pub last_finalized: AtomicU64,
}

impl Timestamps {
    fn touch(counter: &AtomicU64) {
        counter.store(crate::timestamp::new_timestamp(), Ordering::Release);
    }
}

/// Fixed layout embedded by every concrete object type.
pub struct ObjectBase {
    ref_counted: RefCounted,
    kind: ObjectKind,
    subtype: String,
    device: Weak<GlobalState>,
    params: Mutex<ParamSet>,
    observers: ObserverSet,
    observed: Mutex<HashMap<String, ObserverPtr<dyn Object>>>,
    timestamps: Timestamps,
}

impl ObjectBase {
    pub fn new(kind: ObjectKind, subtype: impl Into<String>, device: Weak<GlobalState>) -> Self {
        if let Some(state) = device.upgrade() {
            state.object_counts().inc(kind);
        }
        let base = Self {
            ref_counted: RefCounted::new(),
            kind,
            subtype: subtype.into(),
            device,
            params: Mutex::new(ParamSet::new()),
            observers: ObserverSet::default(),
            observed: Mutex::new(HashMap::new()),
            timestamps: Timestamps::default(),
        };
        Timestamps::touch(&base.timestamps.last_changed);
        base
    }

    pub fn ref_counted(&self) -> &RefCounted {
        &self.ref_counted
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn data_type(&self) -> DataType {
        DataType::Object(self.kind)
    }

    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    pub fn device(&self) -> Option<std::sync::Arc<GlobalState>> {
        self.device.upgrade()
    }

    pub fn params(&self) -> &Mutex<ParamSet> {
        &self.params
    }

    pub fn observers(&self) -> &ObserverSet {
        &self.observers
    }

    /// Record that this object now depends on the pointee of the
    /// object-typed parameter `name`, replacing (and so detaching) whatever
    /// `name` previously observed. Called whenever an object-typed
    /// parameter is set, so the parameter graph's ownership edges
    /// (`ParamSet`) and its dependency edges (`ObserverSet`) stay in sync:
    /// "parameters hold ownership, observers hold dependency."
    pub fn set_observed_edge(&self, name: String, edge: ObserverPtr<dyn Object>) {
        self.observed.lock().insert(name, edge);
    }

    /// Stop observing whatever `name` was pointed at, if anything. Called
    /// when `name` is unset or overwritten with a non-object value.
    pub fn clear_observed_edge(&self, name: &str) {
        self.observed.lock().remove(name);
    }

    pub fn clear_all_observed_edges(&self) {
        self.observed.lock().clear();
    }

    pub fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }

    /// `anariSetParameter`. Returns `false`, without touching
    /// `last_changed`, if `name` was already set to a value-equal
    /// `AnyValue` -- an unchanged `setParameter` call is not a mutation.
    pub fn set_param(&self, name: impl Into<String>, value: AnyValue) -> bool {
        let changed = self.params.lock().set(name, value);
        if changed {
            Timestamps::touch(&self.timestamps.last_changed);
        }
        changed
    }

    /// `anariUnsetParameter`. Returns `false` if `name` was not set.
    pub fn unset_param(&self, name: &str) -> bool {
        let removed = self.params.lock().unset(name);
        if removed {
            Timestamps::touch(&self.timestamps.last_changed);
        }
        removed
    }

    pub fn unset_all_params(&self) {
        self.params.lock().unset_all();
        Timestamps::touch(&self.timestamps.last_changed);
    }

    pub fn mark_updated(&self) {
        Timestamps::touch(&self.timestamps.last_updated);
    }

    pub fn mark_committed(&self) {
        Timestamps::touch(&self.timestamps.last_committed);
    }

    pub fn mark_finalized(&self) {
        Timestamps::touch(&self.timestamps.last_finalized);
    }

    pub fn needs_commit(&self) -> bool {
        self.timestamps.last_changed.load(Ordering::Acquire)
            > self.timestamps.last_committed.load(Ordering::Acquire)
    }

    /// Report a diagnostic through the owning device's status callback, if
    /// the device is still alive.
    pub fn report(&self, severity: StatusSeverity, message: impl Into<String>) {
        if let Some(state) = self.device() {
            state.report(severity, message, None);
        }
    }
}

impl Drop for ObjectBase {
    fn drop(&mut self) {
        if let Some(state) = self.device() {
            state.object_counts().dec(self.kind);
        }
    }
}

/// Shared capability of every node in the object graph.
///
/// `commit_priority` and the lifecycle hooks have default implementations;
/// `commit_parameters`/`finalize`/`get_property`/`is_valid` are the
/// subtype-specific behavior every concrete object supplies.
pub trait Object: RefCountedNode {
    fn base(&self) -> &ObjectBase;

    /// Escape hatch for the handful of call sites (frame/array operations
    /// on `device::Device`) that need the concrete type back out of a
    /// `Handle<dyn Object>`. Every concrete object type implements this as
    /// `{ self }`.
    fn as_any(&self) -> &dyn std::any::Any;

    fn commit_priority(&self) -> i32 {
        self.base().data_type().commit_priority()
    }

    /// Apply staged parameter changes. Called by the commit queue in
    /// priority order; must not itself enqueue new commits (observer
    /// notification is how dependents react instead).
    fn commit_parameters(&self) -> Result<()> {
        Ok(())
    }

    /// Run after every object's `commit_parameters` for this flush round
    /// has completed, draining the finalize queue. Default is a no-op for
    /// subtypes with nothing to recompute.
    fn finalize(&self) -> Result<()> {
        Ok(())
    }

    /// Read-only introspection. The universal `"valid"` property is
    /// handled by the default [`Object::is_valid`]-backed caller in
    /// `device`; this default answers every other property by reading
    /// straight back from the committed parameter set (`setParam(name, x)`
    /// then `getParam(name)` must return `x`), so subtypes only need to
    /// override this for properties that are not themselves a stored
    /// parameter (e.g. a computed bounding box).
    fn get_property(&self, name: &str) -> Option<AnyValue> {
        self.base().params().lock().get_direct(name).cloned()
    }

    /// Whether this object is in a usable state. `UnknownObject` (an
    /// unrecognized subtype) always answers `false`.
    fn is_valid(&self) -> bool {
        true
    }
}

/// Placeholder object created for an unrecognized subtype string, so a
/// `Handle` can still be returned and later operations fail gracefully
/// (`ReleasedHandle`/`UnknownSubtype`-style diagnostics) rather than the
/// factory call itself needing to return an `Option`.
pub struct UnknownObject {
    base: ObjectBase,
}

impl UnknownObject {
    pub fn new(kind: ObjectKind, subtype: impl Into<String>, device: Weak<GlobalState>) -> Self {
        let subtype = subtype.into();
        Self {
            base: ObjectBase::new(kind, subtype.clone(), device.clone()),
        }
        .tap_report(subtype, device)
    }

    fn tap_report(self, subtype: String, device: Weak<GlobalState>) -> Self {
        if let Some(state) = device.upgrade() {
            state.report(
                StatusSeverity::Warning,
                format!("unknown subtype '{subtype}'"),
                None,
            );
        }
        self
    }
}

impl RefCountedNode for UnknownObject {
    fn ref_counted(&self) -> &RefCounted {
        self.base.ref_counted()
    }
}

impl Object for UnknownObject {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn is_valid(&self) -> bool {
        false
    }

    fn commit_parameters(&self) -> Result<()> {
        Err(Error::UnknownSubtype(self.base.subtype().to_string()))
    }
}

impl<T: Object + Sized> Handle<T> {
    /// Like [`Handle::to_intrusive`], but erases to `dyn Object` -- the
    /// common case for enqueueing onto the commit/finalize queues or
    /// storing as an object-typed parameter.
    pub fn to_intrusive_dyn(&self) -> IntrusivePtr<dyn Object> {
        let r: &dyn Object = self.as_ref();
        // SAFETY: `from_raw` takes out a fresh internal reference; the
        // pointee is live for the duration of this call since `self`
        // (a public reference) keeps it alive.
        unsafe { IntrusivePtr::from_raw(NonNull::from(r)) }
    }

    /// Erase a concrete `Handle<T>` to `Handle<dyn Object>`. Ownership of
    /// the one public reference moves from `self` into the result.
    pub fn into_dyn(self) -> Handle<dyn Object> {
        let r: &dyn Object = self.as_ref();
        let nn = NonNull::from(r);
        std::mem::forget(self);
        // SAFETY: `self` owned exactly one public reference, forgotten
        // just above without running its `Drop`, transferred unchanged.
        unsafe { Handle::from_owned_raw(nn) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DataType;

    #[test]
    fn set_param_does_not_touch_timestamp_when_value_is_unchanged() {
        let base = ObjectBase::new(ObjectKind::Unknown, "test", Weak::new());
        assert!(base.set_param("exposure", AnyValue::from_pod(DataType::Float32, 1.0f32)));
        let after_first = base.timestamps().last_changed.load(Ordering::Acquire);

        assert!(!base.set_param("exposure", AnyValue::from_pod(DataType::Float32, 1.0f32)));
        let after_second = base.timestamps().last_changed.load(Ordering::Acquire);
        assert_eq!(after_first, after_second);

        assert!(base.set_param("exposure", AnyValue::from_pod(DataType::Float32, 2.0f32)));
        assert!(base.timestamps().last_changed.load(Ordering::Acquire) > after_second);
    }

    #[test]
    fn unset_param_reports_whether_anything_was_removed() {
        let base = ObjectBase::new(ObjectKind::Unknown, "test", Weak::new());
        base.set_param("exposure", AnyValue::from_pod(DataType::Float32, 1.0f32));
        assert!(base.unset_param("exposure"));
        assert!(!base.unset_param("exposure"));
    }
}

