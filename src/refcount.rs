//! Split public/internal reference counting.
//!
//! Every live object carries two independent counters. *Public* counts
//! application-visible references; *internal* counts references held by
//! other objects inside the implementation (parents, parameter slots,
//! commit/finalize queues). Both must reach zero before an object is freed.
//!
//! The two halves are packed into one `AtomicU64` (public in the low 32
//! bits, internal in the high 32 bits) and updated through a
//! compare-exchange loop, so a transition that straddles both halves (an
//! increment racing a decrement) is never observed torn.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which of the two counters an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Public,
    Internal,
}

/// The embedded reference-count core. Types implementing [`Object`] embed
/// one of these (typically inside an `ObjectBase`) and expose it through
/// [`Object::ref_counted`].
#[derive(Debug)]
pub struct RefCounted(AtomicU64);

const PUBLIC_MASK: u64 = 0x0000_0000_FFFF_FFFF;

#[inline]
fn pack(public: u32, internal: u32) -> u64 {
    (u64::from(internal) << 32) | u64::from(public)
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    ((word & PUBLIC_MASK) as u32, (word >> 32) as u32)
}

impl RefCounted {
    /// A freshly created node: public = 1, internal = 0.
    pub fn new() -> Self {
        Self(AtomicU64::new(pack(1, 0)))
    }

    /// Current `(public, internal)` pair.
    pub fn counts(&self) -> (u32, u32) {
        unpack(self.0.load(Ordering::Acquire))
    }

    pub fn use_count(&self, kind: RefKindQuery) -> u32 {
        let (public, internal) = self.counts();
        match kind {
            RefKindQuery::Public => public,
            RefKindQuery::Internal => internal,
            RefKindQuery::All => public.saturating_add(internal),
        }
    }

    /// Increment one counter, returning the `(public, internal)` pair after
    /// the increment.
    fn inc(&self, kind: RefKind) -> (u32, u32) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let (public, internal) = unpack(current);
            let next = match kind {
                RefKind::Public => pack(public.saturating_add(1), internal),
                RefKind::Internal => pack(public, internal.saturating_add(1)),
            };
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return unpack(next),
                Err(observed) => current = observed,
            }
        }
    }

    /// Decrement one counter (saturating at zero; decrementing below zero
    /// is a client bug and is reported and ignored rather than wrapping),
    /// returning the `(before, after)` pairs.
    fn dec(&self, kind: RefKind) -> ((u32, u32), (u32, u32)) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let before = unpack(current);
            let (public, internal) = before;
            let next = match kind {
                RefKind::Public => pack(public.saturating_sub(1), internal),
                RefKind::Internal => pack(public, internal.saturating_sub(1)),
            };
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return (before, unpack(next)),
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for RefCounted {
    fn default() -> Self {
        Self::new()
    }
}

/// What [`RefCounted::use_count`] should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKindQuery {
    Public,
    Internal,
    All,
}

/// Capability every reference-counted node in the object graph implements.
///
/// # Safety
///
/// `ref_counted` must always return a reference to the *same* `RefCounted`
/// instance for the lifetime of the object (typically a field embedded in
/// the implementor), since `IntrusivePtr`/`Handle` rely on it to decide when
/// to free the node.
pub trait RefCountedNode: Send + Sync {
    fn ref_counted(&self) -> &RefCounted;

    /// Fires the first time public references drop to zero while internal
    /// references remain. Re-arms on the next public→0 transition.
    fn on_no_public_references(&self) {}

    /// Fires the first time internal references drop to zero while public
    /// references remain. Re-arms on the next internal→0 transition.
    fn on_no_internal_references(&self) {}
}

/// Runs one decrement against `ptr`'s `RefCounted`, invokes the matching
/// hook if this decrement just caused the corresponding transition, and
/// frees the node if both counters are now at zero.
///
/// # Safety
///
/// `ptr` must point at a live, heap-allocated (`Box`-originated) `T` that
/// this call is entitled to free once its combined count reaches zero --
/// i.e. the caller is relinquishing exactly one reference of `kind`.
unsafe fn dec_and_maybe_drop<T: RefCountedNode + ?Sized>(ptr: NonNull<T>, kind: RefKind) {
    let obj = ptr.as_ref();
    let (before, after) = obj.ref_counted().dec(kind);
    match kind {
        RefKind::Public => {
            if before.0 > 0 && after.0 == 0 && after.1 > 0 {
                obj.on_no_public_references();
            }
        }
        RefKind::Internal => {
            if before.1 > 0 && after.1 == 0 && after.0 > 0 {
                obj.on_no_internal_references();
            }
        }
    }
    if after.0 == 0 && after.1 == 0 {
        drop(Box::from_raw(ptr.as_ptr()));
    }
}

/// The application-visible handle to an object: owns one *public*
/// reference. `Clone` is the Rust-idiomatic stand-in for the C ABI's
/// `retain`; `Drop` stands in for `release`.
pub struct Handle<T: RefCountedNode + ?Sized> {
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

// SAFETY: T: Send + Sync is required transitively through RefCountedNode,
// and all mutation of shared state behind the pointer goes through atomics
// or the object's own interior-mutable fields.
unsafe impl<T: RefCountedNode + ?Sized> Send for Handle<T> {}
unsafe impl<T: RefCountedNode + ?Sized> Sync for Handle<T> {}

impl<T: RefCountedNode + ?Sized> Handle<T> {
    /// Takes ownership of a freshly boxed object. The box's contents must
    /// already carry a `RefCounted` in the just-created state (public = 1,
    /// internal = 0); this does not itself bump any counter.
    pub fn from_boxed(value: Box<T>) -> Self {
        let ptr = NonNull::new(Box::into_raw(value)).expect("Box::into_raw is never null");
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    pub fn as_ref(&self) -> &T {
        // SAFETY: a live Handle always keeps public >= 1, so the node has
        // not been freed.
        unsafe { self.ptr.as_ref() }
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    /// The raw pointer identity of this object, for use as a non-owning
    /// key (e.g. debug-device handle tables).
    pub fn as_non_null(&self) -> NonNull<T> {
        self.ptr
    }

    /// Build an owning `IntrusivePtr` (internal reference) to the same
    /// object, without consuming this `Handle`.
    pub fn to_intrusive(&self) -> IntrusivePtr<T> {
        self.as_ref().ref_counted().inc(RefKind::Internal);
        IntrusivePtr {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }

    /// Wrap a raw pointer that already represents one public reference
    /// being transferred to the new `Handle`, without taking out a new
    /// one. Used for unsizing casts (`Handle<Concrete>` to
    /// `Handle<dyn Trait>`).
    ///
    /// # Safety
    ///
    /// `ptr` must represent a public reference the caller is relinquishing
    /// to the returned value.
    pub unsafe fn from_owned_raw(ptr: NonNull<T>) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }
}

impl<T: RefCountedNode + ?Sized> std::ops::Deref for Handle<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.as_ref()
    }
}

impl<T: RefCountedNode + ?Sized> Clone for Handle<T> {
    fn clone(&self) -> Self {
        self.as_ref().ref_counted().inc(RefKind::Public);
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T: RefCountedNode + ?Sized> Drop for Handle<T> {
    fn drop(&mut self) {
        // SAFETY: this Handle owns exactly one public reference which we
        // are relinquishing here.
        unsafe { dec_and_maybe_drop(self.ptr, RefKind::Public) }
    }
}

/// An owning, non-public reference: increments *internal* on construction,
/// decrements on drop. This is how parameter slots, parents, and the
/// commit/finalize queues keep an object alive without counting as an
/// application-visible reference.
pub struct IntrusivePtr<T: RefCountedNode + ?Sized> {
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

unsafe impl<T: RefCountedNode + ?Sized> Send for IntrusivePtr<T> {}
unsafe impl<T: RefCountedNode + ?Sized> Sync for IntrusivePtr<T> {}

impl<T: RefCountedNode + ?Sized> IntrusivePtr<T> {
    /// Wrap a raw, live pointer, taking out a new internal reference.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live node (i.e. its combined reference count
    /// is currently > 0 and will remain so for the duration of this call).
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        ptr.as_ref().ref_counted().inc(RefKind::Internal);
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    pub fn as_ref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }

    pub fn as_non_null(&self) -> NonNull<T> {
        self.ptr
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    /// Wrap a raw pointer that already represents one internal reference
    /// being transferred to the new `IntrusivePtr`, without taking out a
    /// new one. Used for unsizing casts (`IntrusivePtr<Concrete>` to
    /// `IntrusivePtr<dyn Trait>`) where the caller already owns the
    /// reference and is only changing its static type.
    ///
    /// # Safety
    ///
    /// `ptr` must represent a reference the caller is relinquishing to the
    /// returned value -- it must not also drop its own copy of that
    /// reference.
    pub unsafe fn from_owned_raw(ptr: NonNull<T>) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }
}

impl<T: RefCountedNode + ?Sized> std::ops::Deref for IntrusivePtr<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.as_ref()
    }
}

impl<T: RefCountedNode + ?Sized> Clone for IntrusivePtr<T> {
    fn clone(&self) -> Self {
        self.as_ref().ref_counted().inc(RefKind::Internal);
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T: RefCountedNode + ?Sized> Drop for IntrusivePtr<T> {
    fn drop(&mut self) {
        // SAFETY: this IntrusivePtr owns exactly one internal reference.
        unsafe { dec_and_maybe_drop(self.ptr, RefKind::Internal) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Probe {
        rc: RefCounted,
        no_public: AtomicUsize,
        no_internal: AtomicUsize,
    }

    impl Probe {
        fn new() -> Box<Self> {
            Box::new(Self {
                rc: RefCounted::new(),
                no_public: AtomicUsize::new(0),
                no_internal: AtomicUsize::new(0),
            })
        }
    }

    impl RefCountedNode for Probe {
        fn ref_counted(&self) -> &RefCounted {
            &self.rc
        }
        fn on_no_public_references(&self) {
            self.no_public.fetch_add(1, Ordering::SeqCst);
        }
        fn on_no_internal_references(&self) {
            self.no_internal.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fresh_node_is_one_zero() {
        let h = Handle::from_boxed(Probe::new());
        assert_eq!(h.ref_counted().counts(), (1, 0));
    }

    #[test]
    fn scenario_ref_count_transitions() {
        // Mirrors the distilled spec's "Ref-count transitions" scenario.
        let h = Handle::from_boxed(Probe::new());
        assert_eq!(h.ref_counted().counts(), (1, 0));

        let internal = h.to_intrusive();
        assert_eq!(h.ref_counted().counts(), (1, 1));
        assert_eq!(h.no_public.load(Ordering::SeqCst), 0);

        drop(h);
        assert_eq!(internal.ref_counted().counts(), (0, 1));
        assert_eq!(internal.no_public.load(Ordering::SeqCst), 1);

        let h2 = {
            // simulate refInc(public) on a node with public == 0: the
            // object is considered semantically dead by policy even
            // though the arithmetic is still well-defined (saturating).
            internal.ref_counted().inc(RefKind::Public);
            Handle {
                ptr: internal.as_non_null(),
                _marker: PhantomData,
            }
        };
        assert_eq!(h2.ref_counted().counts(), (1, 1));

        drop(internal);
        assert_eq!(h2.ref_counted().counts(), (1, 0));
        assert_eq!(h2.no_internal.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hooks_fire_exactly_once_per_transition() {
        let h = Handle::from_boxed(Probe::new());
        let i1 = h.to_intrusive();
        let i2 = h.to_intrusive();
        drop(h);
        assert_eq!(i1.no_public.load(Ordering::SeqCst), 1);
        drop(i1);
        assert_eq!(i2.no_public.load(Ordering::SeqCst), 1);
        drop(i2);
    }

    #[test]
    fn object_typed_parameter_lifetime() {
        // Mirrors the distilled spec's "Object-typed parameter lifetime" scenario.
        let owner = Handle::from_boxed(Probe::new());
        let child = Handle::from_boxed(Probe::new());

        let slot = child.to_intrusive();
        assert_eq!(child.ref_counted().counts(), (1, 1));

        drop(child);
        assert_eq!(slot.ref_counted().counts(), (0, 1));

        drop(slot); // unsetParam(owner, "child")
        drop(owner);
    }
}
