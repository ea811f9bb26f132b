//! Sample streams.
//!
//! A [SampleStream] presents the frames of one or more sources as a single seekable
//! sequence of samples with shape (time, channel, component). A [StreamWriter] does the
//! reverse, cutting sample blocks into frames.
mod cursor;
mod reader;
mod writer;

pub use reader::SampleStream;
pub use writer::{StreamWriter, WriteSummary, WriterOptions};

use hifitime::Epoch;
use ndarray::{Array2, Array3};
use serde::Serialize;
use typed_builder::TypedBuilder;

use crate::formats::FrameTime;
use crate::framing::DEFAULT_MAX_SEARCH;
use crate::quantization::Quantization;

/// What a read does about samples that have no data.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadPolicy {
    /// Fill with the fill value and mark them in the validity mask.
    #[default]
    Fill,
    /// Fail with [crate::Error::Gap] or [crate::Error::Eof].
    Strict,
}

/// Options for opening a [SampleStream].
#[derive(Debug, Clone, TypedBuilder)]
pub struct StreamOptions {
    /// Samples per second per channel. Determined from the data when not given.
    #[builder(default, setter(strip_option))]
    pub sample_rate: Option<f64>,
    /// Thread id to read from each source, by source index. Sources without an entry read
    /// the thread of their first frame.
    #[builder(default)]
    pub threads: Vec<u16>,
    /// Channels per frame, for formats whose headers do not record it.
    #[builder(default, setter(strip_option))]
    pub nchan: Option<usize>,
    /// Quantization, for formats whose headers do not record it.
    #[builder(default, setter(strip_option))]
    pub quantization: Option<Quantization>,
    /// An MJD within 500 days of the data, for formats recording only part of the date.
    #[builder(default, setter(strip_option))]
    pub ref_mjd: Option<i64>,
    #[builder(default = f32::NAN)]
    pub fill_value: f32,
    #[builder(default)]
    pub policy: ReadPolicy,
    /// Bytes scanned for the first frame of each source.
    #[builder(default = DEFAULT_MAX_SEARCH)]
    pub max_search: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions::builder().build()
    }
}

/// Target of [SampleStream::seek].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekTarget {
    /// Sample offset from the start.
    Start(u64),
    /// Relative to the current offset.
    Current(i64),
    /// Relative to the end of the data.
    End(i64),
    /// The sample at or nearest this time.
    Time(Epoch),
}

/// Result of [SampleStream::read].
#[derive(Debug, Clone, PartialEq)]
pub struct ReadBlock {
    /// Samples with shape (time, channel, component).
    pub data: Array3<f32>,
    /// Whether each (time, channel) sample came from valid data.
    pub valid: Array2<bool>,
    /// Number of trailing samples filled because the data ran out.
    pub exhausted: usize,
}

impl ReadBlock {
    /// Number of (time, channel) samples filled with the fill value.
    #[must_use]
    pub fn filled(&self) -> usize {
        self.valid.iter().filter(|v| !**v).count()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.filled() == 0
    }
}

/// Read-only description of an open stream.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub format: String,
    pub sources: usize,
    pub threads: Vec<u16>,
    pub start: FrameTime,
    /// Start time in UTC, when it can be determined.
    pub start_time: Option<String>,
    pub sample_rate: Option<f64>,
    pub frame_rate: Option<f64>,
    pub samples_per_frame: usize,
    pub num_samples: u64,
    pub nchan: usize,
    pub quantization: Quantization,
    pub policy: ReadPolicy,
}
