//! Frame-indexed CSV profiling.
//!
//! Producer threads record timing scopes, counters and text events at very
//! low per-call cost into lock-free per-thread buffers; a processing thread
//! periodically drains them, attributes every sample to a frame on its
//! thread's timeline, and streams one CSV row per frame to a file,
//! optionally zstd-compressed.
//!
//! ```no_run
//! use framecsv::{CaptureRequest, CategoryId, Profiler, ProfilerConfig, StatOp};
//!
//! fn main() -> framecsv::Result<()> {
//!     let profiler = Profiler::new(ProfilerConfig::default())?;
//!     profiler.begin_capture(CaptureRequest::new("/tmp/captures"))?;
//!     for _ in 0..120 {
//!         profiler.begin_frame();
//!         {
//!             let _tick = profiler.scope("Tick");
//!             profiler.record_custom_stat("DrawCalls", CategoryId::DEFAULT, 128, StatOp::Accumulate);
//!         }
//!         profiler.end_frame();
//!     }
//!     let path = profiler.end_capture()?.wait()?;
//!     println!("capture written to {}", path.display());
//!     Ok(())
//! }
//! ```

use thiserror::Error;

pub mod boundary;
pub mod config;
pub mod controller;
pub mod processor;
pub mod profiler;
pub mod registry;
pub mod sample;
pub mod scope;
pub mod series;
pub mod thread;
pub mod writer;

pub use config::{CompressionMode, ProfilerConfig};
pub use controller::{CaptureCompletion, CaptureRequest};
pub use profiler::Profiler;
pub use sample::{CategoryId, StatOp, Timeline, Value};
pub use scope::TimingScope;

#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("output format error: {0}")]
    Format(#[from] framecsv_format::FormatError),
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("a capture is already in progress")]
    AlreadyCapturing,
    #[error("no capture in progress")]
    NotCapturing,
    #[error("processing controller is gone")]
    ControllerGone,
}

pub type Result<T> = std::result::Result<T, ProfilerError>;

/// Monotonic timestamp in nanoseconds.
pub(crate) fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

pub(crate) fn current_tid() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}
