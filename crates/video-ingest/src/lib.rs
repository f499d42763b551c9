//! Frame capture for the detection pipeline.
//!
//! Frames are decoded by an ffmpeg child process into raw BGR24 buffers and
//! forwarded over a small bounded channel, so a slow consumer backpressures the
//! decoder instead of growing memory.

mod ffmpeg;
mod types;

pub use ffmpeg::{SourceKind, build_ffmpeg_args, parse_device_index, spawn_ffmpeg_reader};
pub use types::{CaptureError, Frame, FrameFormat};
