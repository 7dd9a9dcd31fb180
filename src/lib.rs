/*! Core runtime of a render-device SDK: split public/internal object
 *  reference counting, a deferred parameter/commit/finalize pipeline, and
 *  a validating debug/passthrough device wrapping a concrete backend.
 */

#![allow(
    // Matching the shape of a data-type tag is clearer than a guard chain.
    clippy::match_like_matches_macro,
    // Many constructors here intentionally have no meaningful default.
    clippy::new_without_default,
    // Device trait methods mirror a wide C-ABI surface; splitting them up
    // would just scatter one call's arguments across several methods.
    clippy::too_many_arguments,
)]
#![warn(trivial_casts, trivial_numeric_casts, unused_extern_crates, unused_qualifications)]

/// Logs an API entry point at `trace` level, or at `info` level when the
/// `api-log-info` feature is enabled -- matching the host workspace's
/// convention of promoting per-call tracing to a level that shows up
/// without `RUST_LOG=trace` during interactive debugging.
#[macro_export]
macro_rules! api_log {
    ($($arg:tt)+) => {
        if cfg!(feature = "api-log-info") {
            log::info!($($arg)+);
        } else {
            log::trace!($($arg)+);
        }
    };
}

pub mod array;
pub mod commit;
pub mod debug;
pub mod device;
pub mod error;
pub mod frame;
pub mod handle;
pub mod object;
pub mod params;
pub mod refcount;
pub mod registry;
pub mod state;
pub mod timestamp;
pub mod value;

pub use device::Device;
pub use error::{Error, Result, StatusCode, StatusRecord, StatusSeverity};
pub use object::{Object, ObjectBase, ObserverPtr};
pub use refcount::{Handle, IntrusivePtr};
pub use state::GlobalState;
pub use value::{AnyValue, DataType, ObjectKind};
