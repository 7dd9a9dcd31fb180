//! Frame state machine and channel mapping.
//!
//! A frame cycles through `Unmapped -> Render -> Ready -> Mapped ->
//! Unmapped`. `render_frame` while `Mapped` blocks until `unmap`;
//! `frame_ready(WAIT)` blocks until a render completes; `discard` cancels
//! an in-flight render and is also what the last public reference going
//! away implies, since nothing else will ever unmap or observe it again.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use crate::error::{Error, Result};
use crate::object::{Object, ObjectBase};
use crate::refcount::{RefCounted, RefCountedNode};
use crate::state::GlobalState;
use crate::value::ObjectKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Unmapped,
    Render,
    Ready,
    Mapped,
}

/// `frameReady`'s wait mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMask {
    Wait,
    NoWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Color,
    Depth,
}

impl Channel {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "channel.color" => Some(Channel::Color),
            "channel.depth" => Some(Channel::Depth),
            _ => None,
        }
    }
}

struct ChannelBuffer {
    bytes: Vec<u8>,
    width: u32,
    height: u32,
}

pub struct Frame {
    base: ObjectBase,
    state: Mutex<FrameState>,
    ready: Condvar,
    discarded: AtomicBool,
    color: Mutex<Option<ChannelBuffer>>,
    depth: Mutex<Option<ChannelBuffer>>,
}

impl Frame {
    pub fn new(device: Weak<GlobalState>) -> Self {
        Self {
            base: ObjectBase::new(ObjectKind::Frame, "frame", device),
            state: Mutex::new(FrameState::Unmapped),
            ready: Condvar::new(),
            discarded: AtomicBool::new(false),
            color: Mutex::new(None),
            depth: Mutex::new(None),
        }
    }

    pub fn state(&self) -> FrameState {
        *self.state.lock()
    }

    /// `anariRenderFrame`. Blocks if the frame is currently mapped; once
    /// unblocked (or if it was already unmapped/ready), transitions to
    /// `Render` and hands the caller a guard to mark completion with.
    pub fn render_frame(&self) -> Result<()> {
        let mut state = self.state.lock();
        while *state == FrameState::Mapped {
            self.ready.wait(&mut state);
        }
        self.discarded.store(false, Ordering::Release);
        *state = FrameState::Render;
        Ok(())
    }

    /// The backend calls this once rendering actually completes (or is
    /// cancelled via `discard`), writing the rendered channel bytes.
    pub fn complete_render(&self, color: Option<(Vec<u8>, u32, u32)>, depth: Option<(Vec<u8>, u32, u32)>) {
        if let Some((bytes, width, height)) = color {
            *self.color.lock() = Some(ChannelBuffer { bytes, width, height });
        }
        if let Some((bytes, width, height)) = depth {
            *self.depth.lock() = Some(ChannelBuffer { bytes, width, height });
        }
        let mut state = self.state.lock();
        *state = FrameState::Ready;
        self.ready.notify_all();
    }

    /// `anariFrameReady`. `Wait` blocks until the render completes (or is
    /// discarded); `NoWait` reports the current state without blocking.
    pub fn frame_ready(&self, mask: WaitMask) -> bool {
        let mut state = self.state.lock();
        match mask {
            WaitMask::Wait => {
                while *state == FrameState::Render {
                    self.ready.wait(&mut state);
                }
                true
            }
            WaitMask::NoWait => *state != FrameState::Render,
        }
    }

    /// `anariDiscardFrame`: cancels an in-flight render asynchronously.
    /// The backend's render loop is expected to observe
    /// `is_discarded()` and stop; `frame_ready` unblocks immediately
    /// once discard flips the state to `Ready`.
    pub fn discard(&self) {
        self.discarded.store(true, Ordering::Release);
        let mut state = self.state.lock();
        if *state == FrameState::Render {
            *state = FrameState::Ready;
            self.ready.notify_all();
        } else {
            *state = FrameState::Unmapped;
        }
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    /// `anariMapFrame`: must follow a completed render. Returns the
    /// channel's bytes, width, and height.
    pub fn map(&self, channel: Channel) -> Result<(Vec<u8>, u32, u32)> {
        let mut state = self.state.lock();
        while *state == FrameState::Render {
            self.ready.wait(&mut state);
        }
        let slot = match channel {
            Channel::Color => &self.color,
            Channel::Depth => &self.depth,
        };
        let guard = slot.lock();
        let buf = guard
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("channel has not been rendered".into()))?;
        let result = (buf.bytes.clone(), buf.width, buf.height);
        drop(guard);
        *state = FrameState::Mapped;
        Ok(result)
    }

    /// `anariUnmapFrame`.
    pub fn unmap(&self, _channel: Channel) -> Result<()> {
        let mut state = self.state.lock();
        if *state != FrameState::Mapped {
            return Err(Error::NotMapped);
        }
        *state = FrameState::Unmapped;
        self.ready.notify_all();
        Ok(())
    }
}

impl RefCountedNode for Frame {
    fn ref_counted(&self) -> &RefCounted {
        self.base.ref_counted()
    }

    fn on_no_public_references(&self) {
        self.discard();
    }
}

impl Object for Frame {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn commit_parameters(&self) -> Result<()> {
        if !self.base.needs_commit() {
            self.base.report(
                crate::error::StatusSeverity::Warning,
                "committing frame with no pending changes",
            );
        }
        Ok(())
    }
}
