//! Deferred, priority-ordered commit/finalize pipeline.
//!
//! Applications stage parameter changes freely; nothing takes effect until
//! a flush. A flush runs `commit_parameters` on every queued object in
//! priority order, then drains the finalize queue (objects an observed
//! commit marked dirty), repeating until neither queue gains new entries --
//! a fixed point -- or `MAX_FLUSH_ITERATIONS` is hit, which surfaces a
//! cycle in the observer graph as [`Error::CommitCycle`] instead of
//! looping forever.

use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::object::Object;
use crate::refcount::{IntrusivePtr, RefKindQuery};

/// Safety valve on the fixed-point iteration described in the distilled
/// spec's Open Questions.
pub const MAX_FLUSH_ITERATIONS: u32 = 64;

#[derive(Default)]
pub struct CommitQueue {
    queued: Vec<IntrusivePtr<dyn Object>>,
}

impl CommitQueue {
    pub fn enqueue(&mut self, object: IntrusivePtr<dyn Object>) {
        if self
            .queued
            .iter()
            .any(|existing| IntrusivePtr::ptr_eq(existing, &object))
        {
            return;
        }
        self.queued.push(object);
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Stable priority sort, then drain, running `commit_parameters` on
    /// each object in order and enqueueing its observers onto `finalize`.
    /// Skips an object whose only reference is the queue's own internal
    /// one (`useCount() > 1`) or that has no pending parameter change
    /// since its last commit -- mirrors
    /// `DeferredCommitBuffer::flush`'s `obj->useCount() > 1 &&
    /// obj->lastUpdated() > obj->lastCommitted()` guard. Returns `true` if
    /// anything was committed.
    fn drain_commit(&mut self, finalize: &mut FinalizeQueue) -> Result<bool> {
        if self.queued.is_empty() {
            return Ok(false);
        }
        self.queued.sort_by_key(|o| o.commit_priority());
        let batch = std::mem::take(&mut self.queued);
        let mut committed = false;
        for object in &batch {
            if object.ref_counted().use_count(RefKindQuery::All) <= 1 || !object.base().needs_commit() {
                continue;
            }
            object.commit_parameters()?;
            object.base().mark_committed();
            committed = true;
            // SAFETY: `for_each` only runs while `object` (held alive by
            // this batch's IntrusivePtr) is live, and every observer
            // token in its set refers to another still-live object.
            unsafe {
                object.base().observers().for_each(|observer| {
                    observer.base().mark_updated();
                    finalize.enqueue(IntrusivePtr::from_raw(NonNull::from(observer)));
                });
            }
        }
        Ok(committed)
    }
}

#[derive(Default)]
pub struct FinalizeQueue {
    queued: Vec<IntrusivePtr<dyn Object>>,
}

impl FinalizeQueue {
    pub fn enqueue(&mut self, object: IntrusivePtr<dyn Object>) {
        if self
            .queued
            .iter()
            .any(|existing| IntrusivePtr::ptr_eq(existing, &object))
        {
            return;
        }
        self.queued.push(object);
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Same priority-sort and dirty-check discipline as
    /// [`CommitQueue::drain_commit`], applied to the observer-driven
    /// finalize step: only an object that still has a reference beyond
    /// the queue's own, and that was actually marked updated since its
    /// last finalize, runs `finalize()`.
    fn drain_finalize(&mut self) -> Result<bool> {
        if self.queued.is_empty() {
            return Ok(false);
        }
        self.queued.sort_by_key(|o| o.commit_priority());
        let batch = std::mem::take(&mut self.queued);
        let mut finalized = false;
        for object in &batch {
            let timestamps = object.base().timestamps();
            let needs_finalize = timestamps.last_updated.load(std::sync::atomic::Ordering::Acquire)
                > timestamps.last_finalized.load(std::sync::atomic::Ordering::Acquire);
            if object.ref_counted().use_count(RefKindQuery::All) <= 1 || !needs_finalize {
                continue;
            }
            object.finalize()?;
            object.base().mark_finalized();
            finalized = true;
        }
        Ok(finalized)
    }
}

/// Run commit/finalize to a fixed point: a round commits whatever is
/// queued, finalizes whatever that commit (via observer notification)
/// queued in turn, and repeats as long as either queue gained new work.
pub fn flush(commit: &mut CommitQueue, finalize: &mut FinalizeQueue) -> Result<()> {
    for _ in 0..MAX_FLUSH_ITERATIONS {
        let committed = commit.drain_commit(finalize)?;
        let finalized = finalize.drain_finalize()?;
        if !committed && !finalized {
            return Ok(());
        }
    }
    Err(Error::CommitCycle(MAX_FLUSH_ITERATIONS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectBase;
    use crate::refcount::{Handle, RefCounted, RefCountedNode};
    use crate::value::ObjectKind;
    use std::sync::Arc;

    struct Tracking {
        base: ObjectBase,
        order: Arc<Mutex<Vec<i32>>>,
        priority: i32,
        finalized: std::sync::atomic::AtomicBool,
    }

    use parking_lot::Mutex;

    impl Tracking {
        fn new(priority: i32, order: Arc<Mutex<Vec<i32>>>) -> Box<Self> {
            Box::new(Self {
                base: ObjectBase::new(ObjectKind::Unknown, "tracking", std::sync::Weak::new()),
                order,
                priority,
                finalized: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    impl RefCountedNode for Tracking {
        fn ref_counted(&self) -> &RefCounted {
            self.base.ref_counted()
        }
    }

    impl Object for Tracking {
        fn base(&self) -> &ObjectBase {
            &self.base
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn commit_priority(&self) -> i32 {
            self.priority
        }

        fn commit_parameters(&self) -> Result<()> {
            self.order.lock().push(self.priority);
            Ok(())
        }

        fn finalize(&self) -> Result<()> {
            self.finalized.store(true, std::sync::atomic::Ordering::Release);
            Ok(())
        }
    }

    #[test]
    fn commits_run_in_priority_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let low = Handle::from_boxed(Tracking::new(30, order.clone()));
        let high = Handle::from_boxed(Tracking::new(0, order.clone()));

        let mut commit_queue = CommitQueue::default();
        let mut finalize_queue = FinalizeQueue::default();
        commit_queue.enqueue(low.to_intrusive_dyn());
        commit_queue.enqueue(high.to_intrusive_dyn());

        flush(&mut commit_queue, &mut finalize_queue).unwrap();
        assert_eq!(*order.lock(), vec![0, 30]);
    }

    #[test]
    fn committing_an_observed_object_finalizes_its_registered_observer() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let child = Handle::from_boxed(Tracking::new(0, order.clone()));
        let owner = Handle::from_boxed(Tracking::new(10, order.clone()));

        // SAFETY: `owner` (held by this test's `Handle`) outlives `edge`,
        // which is dropped explicitly below before `owner` is.
        let edge = unsafe { crate::object::ObserverPtr::new(child.to_intrusive_dyn(), owner.as_ref()) };

        let mut commit_queue = CommitQueue::default();
        let mut finalize_queue = FinalizeQueue::default();
        commit_queue.enqueue(child.to_intrusive_dyn());

        // Nothing enqueues `owner` directly -- only `child`'s own
        // `ObserverSet`, populated by `ObserverPtr::new` above, can get it
        // onto the finalize queue.
        flush(&mut commit_queue, &mut finalize_queue).unwrap();

        assert!(owner.finalized.load(std::sync::atomic::Ordering::Acquire));

        drop(edge);
    }
}
