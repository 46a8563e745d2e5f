mod engine;
mod error;
mod types;

pub use engine::FfmpegEngine;
pub use error::{TranscodeError, TranscodeResult};
pub use types::{
    Encoder, MediaEngine, MediaInfo, SegmentFile, SegmentMode, TrackInfo, TrackKind,
};
