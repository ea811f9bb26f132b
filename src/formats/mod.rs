//! Frame format drivers.
//!
//! Every supported recording format is a [Driver] registered by name in a
//! [Registry]. A driver turns raw header bytes into a [Header] and interprets it as a
//! [FrameInfo]; everything downstream (frame reading, sample decoding, streams) works only
//! with those two types.
mod dada;
mod generic;
mod header;
mod layout;
mod mark5b;
mod registry;
mod vdif;

pub use dada::Dada;
pub use generic::Generic;
pub use header::{BinaryHeader, Header, TextHeader};
pub use layout::{BitField, Endian, HeaderLayout};
pub use mark5b::Mark5B;
pub use registry::Registry;
pub use vdif::Vdif;

use std::fmt::Debug;

use hifitime::{Duration, Epoch};
use serde::{Deserialize, Serialize};

use crate::prelude::*;
use crate::quantization::Quantization;

/// How the size of a frame (or header) is known.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FrameSize {
    /// Always this many bytes.
    Fixed(usize),
    /// Declared by each header.
    Header,
}

/// Static description of a format.
///
/// Built-in drivers construct their own; [Generic] drivers are created entirely from one,
/// typically loaded from JSON.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub name: String,
    /// Frame size including the header.
    pub frame_size: FrameSize,
    pub header_size: FrameSize,
    /// Bytes every header starts with, if any.
    #[serde(default)]
    pub sync: Option<Vec<u8>>,
    /// Word layout for binary headers.
    #[serde(default)]
    pub layout: Option<HeaderLayout>,
    /// Quantization when not declared by headers.
    #[serde(default)]
    pub quantization: Option<Quantization>,
    /// Channel count when not declared by headers.
    #[serde(default)]
    pub nchan: Option<usize>,
    /// Bytes per unit of a `frame_length` header field when frame size comes from headers.
    #[serde(default = "default_length_unit")]
    pub length_unit: usize,
}

fn default_length_unit() -> usize {
    1
}

impl Descriptor {
    /// Payload size when both frame and header sizes are fixed.
    #[must_use]
    pub fn fixed_payload_len(&self) -> Option<usize> {
        match (self.frame_size, self.header_size) {
            (FrameSize::Fixed(frame), FrameSize::Fixed(header)) => frame.checked_sub(header),
            _ => None,
        }
    }
}

/// Frame timestamp: integer Unix (UTC) seconds and the frame number within that second.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameTime {
    pub seconds: i64,
    pub frame_nr: u64,
}

impl FrameTime {
    #[must_use]
    pub fn new(seconds: i64, frame_nr: u64) -> Self {
        FrameTime { seconds, frame_nr }
    }

    /// Absolute time of the start of the frame.
    ///
    /// # Errors
    /// [Error::UnknownFrameRate] if the frame number is non-zero and no rate is known.
    pub fn to_epoch(&self, frame_rate: Option<f64>) -> Result<Epoch> {
        let base = Epoch::from_unix_seconds(self.seconds as f64);
        if self.frame_nr == 0 {
            return Ok(base);
        }
        let rate = frame_rate.ok_or(Error::UnknownFrameRate)?;
        Ok(base + Duration::from_seconds(self.frame_nr as f64 / rate))
    }

    /// Frame time of the frame starting closest to `epoch`.
    #[must_use]
    pub fn from_epoch(epoch: Epoch, frame_rate: f64) -> Self {
        let mut seconds = epoch.to_unix_seconds().floor() as i64;
        let mut frac = (epoch - Epoch::from_unix_seconds(seconds as f64)).to_seconds();
        if frac < 0.0 {
            seconds -= 1;
            frac += 1.0;
        }
        let mut frame_nr = (frac * frame_rate).round() as u64;
        if frame_nr as f64 >= frame_rate {
            seconds += 1;
            frame_nr = 0;
        }
        FrameTime { seconds, frame_nr }
    }

    /// Number of frames from `start` to this time.
    ///
    /// # Errors
    /// [Error::UnknownFrameRate] if the times are in different seconds and no rate is known.
    pub fn frames_since(&self, start: &FrameTime, frame_rate: Option<f64>) -> Result<i64> {
        let nr = self.frame_nr as i64 - start.frame_nr as i64;
        if self.seconds == start.seconds {
            return Ok(nr);
        }
        let rate = frame_rate.ok_or(Error::UnknownFrameRate)?;
        Ok(((self.seconds - start.seconds) as f64 * rate).round() as i64 + nr)
    }

    /// Time `frames` frames later. With a rate, frame numbers wrap at each second.
    #[must_use]
    pub fn advance(&self, frames: u64, frames_per_second: Option<u64>) -> Self {
        let total = self.frame_nr + frames;
        match frames_per_second {
            Some(rate) if rate > 0 => FrameTime {
                seconds: self.seconds + (total / rate) as i64,
                frame_nr: total % rate,
            },
            _ => FrameTime {
                seconds: self.seconds,
                frame_nr: total,
            },
        }
    }
}

/// A driver's reading of one header.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub time: FrameTime,
    pub thread_id: u16,
    /// Payload is flagged as not containing valid data.
    pub invalid: bool,
    pub nchan: usize,
    pub quantization: Quantization,
    pub payload_len: usize,
    /// Samples at the start of the payload holding real data, when the header records it.
    #[serde(default)]
    pub valid_samples: Option<usize>,
}

impl FrameInfo {
    /// # Errors
    /// [Error::Format] if the payload does not hold whole samples.
    pub fn samples_per_frame(&self) -> Result<usize> {
        self.quantization.samples_in(self.payload_len, self.nchan)
    }
}

/// Parameters a format may need that its headers do not carry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormatParams {
    pub nchan: Option<usize>,
    pub quantization: Option<Quantization>,
    /// Any MJD within 500 days of the data, for formats that record only part of the day.
    pub ref_mjd: Option<i64>,
    pub frame_rate: Option<f64>,
    pub station_id: Option<u16>,
}

/// Per-format header and frame rules.
pub trait Driver: Send + Sync + Debug {
    fn descriptor(&self) -> &Descriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Number of bytes [Self::header_len] needs to see.
    fn min_header_len(&self) -> usize;

    /// Length of the header starting with `prefix`.
    ///
    /// # Errors
    /// [Error::Format] if `prefix` cannot start a header.
    fn header_len(&self, prefix: &[u8]) -> Result<usize>;

    /// Parse a header from `buf`, which holds at least [Self::header_len] bytes.
    ///
    /// # Errors
    /// [Error::Format] if the sync pattern or any consistency check fails.
    fn parse_header(&self, buf: &[u8]) -> Result<Header>;

    /// Interpret a parsed header.
    ///
    /// # Errors
    /// [Error::Format] for inconsistent values, [Error::Config] for missing parameters.
    fn info(&self, header: &Header, params: &FormatParams) -> Result<FrameInfo>;

    /// Build the header describing `info`.
    ///
    /// # Errors
    /// If `info` cannot be represented by this format.
    fn build_header(&self, info: &FrameInfo, params: &FormatParams) -> Result<Header>;

    /// Frames per second implied by the header itself, if the format records it.
    fn frame_rate(&self, _header: &Header, _info: &FrameInfo) -> Option<f64> {
        None
    }

    /// Whether frame numbers restart at each second.
    fn wraps_per_second(&self) -> bool {
        true
    }

    /// Cheap test for the sync pattern at the start of `buf`.
    fn check_sync(&self, buf: &[u8]) -> bool {
        match &self.descriptor().sync {
            Some(sync) => buf.starts_with(sync),
            None => true,
        }
    }

    /// Sanity checks used to reject false sync matches.
    fn is_plausible(&self, info: &FrameInfo) -> bool {
        info.payload_len > 0
            && info.nchan > 0
            && info.quantization.validate().is_ok()
            && info.samples_per_frame().is_ok()
            && info.time.seconds >= 0
    }
}

/// Days since 1970-01-01 of a proleptic Gregorian date.
pub(crate) fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = i64::from((month + 9) % 12);
    let doy = (153 * mp + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Proleptic Gregorian (year, month, day) of a day count since 1970-01-01.
pub(crate) fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// Modified Julian Date of the Unix epoch.
pub(crate) const UNIX_EPOCH_MJD: i64 = 40_587;

pub(crate) const SECONDS_PER_DAY: i64 = 86_400;
