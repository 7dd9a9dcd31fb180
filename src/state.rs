//! Per-device process-wide state: object counts, the status-callback
//! indirection, the commit/finalize pipeline, and the rendering gate that
//! arrays and frames serialize against.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Weak;

use crate::commit::{CommitQueue, FinalizeQueue};
use crate::error::StatusSeverity;
use crate::object::{Object, ObjectBase};
use crate::refcount::{RefCounted, RefCountedNode};
use crate::value::ObjectKind;

/// Live-object count per [`ObjectKind`], grounded on the reference
/// implementation's per-type leak counters. Read by the debug device at
/// device-teardown time to report anything still alive.
#[derive(Default)]
pub struct ObjectCounts {
    counts: [AtomicUsize; ObjectKind::ALL.len()],
}

impl ObjectCounts {
    pub fn inc(&self, kind: ObjectKind) {
        self.counts[kind.index()].fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec(&self, kind: ObjectKind) {
        self.counts[kind.index()].fetch_sub(1, Ordering::AcqRel);
    }

    pub fn get(&self, kind: ObjectKind) -> usize {
        self.counts[kind.index()].load(Ordering::Acquire)
    }

    pub fn total(&self) -> usize {
        ObjectKind::ALL.iter().map(|&k| self.get(k)).sum()
    }
}

#[derive(Default)]
struct GateState {
    rendering: bool,
    mapped_count: usize,
}

/// Device-wide serialization point between backend rendering and
/// application-side array/frame mapping: a true two-sided semaphore, not
/// just a one-way busy flag. Rendering excludes mapping and vice versa --
/// `begin_render` blocks while any array or frame is mapped, and
/// `begin_map` blocks while a render is in flight, for as long as the
/// mapping is held (`begin_map`..`end_map`), not just at the call that
/// starts it.
#[derive(Default)]
pub struct RenderingGate {
    state: Mutex<GateState>,
    idle: Condvar,
}

impl RenderingGate {
    pub fn begin_render(&self) {
        let mut state = self.state.lock();
        while state.rendering || state.mapped_count > 0 {
            self.idle.wait(&mut state);
        }
        state.rendering = true;
    }

    pub fn end_render(&self) {
        let mut state = self.state.lock();
        state.rendering = false;
        self.idle.notify_all();
    }

    pub fn begin_map(&self) {
        let mut state = self.state.lock();
        while state.rendering {
            self.idle.wait(&mut state);
        }
        state.mapped_count += 1;
    }

    pub fn end_map(&self) {
        let mut state = self.state.lock();
        state.mapped_count -= 1;
        if state.mapped_count == 0 {
            self.idle.notify_all();
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().rendering
    }
}

/// The device's own recognized parameters (`statusCallback`,
/// `wrappedDevice`, `traceMode`, `traceDir`, ...) live on this object like
/// any other node in the graph -- `setParameter`/`commitParameters` against
/// the handle `Device::device_handle` returns stages and applies them
/// through the same pipeline every other object uses. `statusCallback`
/// itself has no `AnyValue` representation (a Rust closure isn't POD,
/// string, or object-typed) and stays a dedicated method on
/// [`GlobalState`]; the string/handle-typed keys go through here.
pub struct DeviceConfig {
    base: ObjectBase,
}

impl DeviceConfig {
    pub fn new(device: Weak<GlobalState>) -> Self {
        Self {
            base: ObjectBase::new(ObjectKind::Device, "device", device),
        }
    }
}

impl RefCountedNode for DeviceConfig {
    fn ref_counted(&self) -> &RefCounted {
        self.base.ref_counted()
    }
}

impl Object for DeviceConfig {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

type StatusCallback = dyn Fn(StatusSeverity, &str, Option<&dyn Object>) + Send + Sync;

/// The state shared by every object belonging to one device instance.
/// Objects hold a `Weak<GlobalState>` back-reference (see
/// `object::ObjectBase`) so they never keep the device alive by accident.
pub struct GlobalState {
    object_counts: ObjectCounts,
    status_callback: Mutex<Option<Box<StatusCallback>>>,
    commit_queue: Mutex<CommitQueue>,
    finalize_queue: Mutex<FinalizeQueue>,
    rendering_gate: RenderingGate,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            object_counts: ObjectCounts::default(),
            status_callback: Mutex::new(None),
            commit_queue: Mutex::new(CommitQueue::default()),
            finalize_queue: Mutex::new(FinalizeQueue::default()),
            rendering_gate: RenderingGate::default(),
        }
    }
}

impl GlobalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_counts(&self) -> &ObjectCounts {
        &self.object_counts
    }

    pub fn rendering_gate(&self) -> &RenderingGate {
        &self.rendering_gate
    }

    pub fn commit_queue(&self) -> &Mutex<CommitQueue> {
        &self.commit_queue
    }

    pub fn finalize_queue(&self) -> &Mutex<FinalizeQueue> {
        &self.finalize_queue
    }

    pub fn set_status_callback(
        &self,
        callback: impl Fn(StatusSeverity, &str, Option<&dyn Object>) + Send + Sync + 'static,
    ) {
        *self.status_callback.lock() = Some(Box::new(callback));
    }

    pub fn report(&self, severity: StatusSeverity, message: impl Into<String>, object: Option<&dyn Object>) {
        let message = message.into();
        log::log!(
            match severity {
                StatusSeverity::Fatal | StatusSeverity::Error => log::Level::Error,
                StatusSeverity::Warning => log::Level::Warn,
                StatusSeverity::Performance | StatusSeverity::Info => log::Level::Info,
                StatusSeverity::Debug => log::Level::Debug,
            },
            "{severity}: {message}"
        );
        if let Some(callback) = self.status_callback.lock().as_ref() {
            callback(severity, &message, object);
        }
    }

    /// Report that every object count is zero, e.g. at device teardown.
    pub fn leak_report(&self) -> Vec<(ObjectKind, usize)> {
        ObjectKind::ALL
            .iter()
            .map(|&kind| (kind, self.object_counts.get(kind)))
            .filter(|&(_, n)| n > 0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_counts_round_trip() {
        let counts = ObjectCounts::default();
        counts.inc(ObjectKind::Array);
        counts.inc(ObjectKind::Array);
        counts.dec(ObjectKind::Array);
        assert_eq!(counts.get(ObjectKind::Array), 1);
        assert_eq!(counts.total(), 1);
    }

    #[test]
    fn is_busy_reflects_whether_a_render_is_in_flight() {
        let gate = RenderingGate::default();
        assert!(!gate.is_busy());
        gate.begin_render();
        assert!(gate.is_busy());
        gate.end_render();
        assert!(!gate.is_busy());
    }

    #[test]
    fn begin_render_blocks_while_an_array_is_mapped() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let gate = Arc::new(RenderingGate::default());
        gate.begin_map();

        let gate2 = gate.clone();
        let rendered = Arc::new(AtomicBool::new(false));
        let rendered2 = rendered.clone();
        let handle = thread::spawn(move || {
            gate2.begin_render();
            rendered2.store(true, Ordering::Release);
            gate2.end_render();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!rendered.load(Ordering::Acquire));

        gate.end_map();
        handle.join().unwrap();
        assert!(rendered.load(Ordering::Acquire));
    }

    #[test]
    fn begin_map_blocks_while_a_render_is_in_flight() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let gate = Arc::new(RenderingGate::default());
        gate.begin_render();

        let gate2 = gate.clone();
        let mapped = Arc::new(AtomicBool::new(false));
        let mapped2 = mapped.clone();
        let handle = thread::spawn(move || {
            gate2.begin_map();
            mapped2.store(true, Ordering::Release);
            gate2.end_map();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!mapped.load(Ordering::Acquire));

        gate.end_render();
        handle.join().unwrap();
        assert!(mapped.load(Ordering::Acquire));
    }

    #[test]
    fn status_callback_receives_reports() {
        let state = GlobalState::new();
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        state.set_status_callback(move |sev, msg, _obj| {
            seen2.lock().push((sev, msg.to_string()));
        });
        state.report(StatusSeverity::Warning, "test message", None);
        let log = seen.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].1, "test message");
    }
}
