//! Video stream ingest and event-clip output.
//!
//! [`StreamReader`] opens a live (RTSP) or file source, captures frames on a
//! background thread into a bounded ring, and hands batches to the analyzer
//! loop. [`StreamWriter`] encodes event clips to H.264/MP4, fed through a
//! background flush thread so writes never block the hot path.

mod reader;
mod ring;
mod writer;

pub use reader::{ReaderConfig, StreamReader, VideoInfo};
pub use writer::StreamWriter;

use thiserror::Error;

/// Default capacity of the capture ring, in frames.
pub const DEFAULT_BUFFER_SIZE: usize = 64;

/// Default capture rate.
pub const DEFAULT_FPS: u32 = 15;

/// Errors from the stream reader.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The source is unreachable or the connection broke mid-stream.
    #[error("can't open video stream {0}")]
    Connection(String),

    /// A file source ran out of frames.
    #[error("end of video")]
    EndOfVideo,

    /// `open` was called on an already-open reader.
    #[error("stream is already opened")]
    AlreadyOpen,

    /// `read` was called before a successful `open`.
    #[error("stream is not opened")]
    NotOpen,
}

/// Errors from the clip writer.
#[derive(Error, Debug)]
pub enum WriterError {
    #[error("can't open video file {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("encoder failure: {0}")]
    Encode(String),

    #[error("writer thread terminated")]
    Terminated,
}

/// Whether a source URL is a livestream.
///
/// Only RTSP is treated as live; everything else is read with file
/// semantics (end-of-stream is an orderly end, not a broken connection).
#[must_use]
pub fn is_livestream(url: &str) -> bool {
    url.split("://")
        .next()
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("rtsp"))
        && url.contains("://")
}
