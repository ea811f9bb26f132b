use std::io::{Read, Seek};
use std::sync::Arc;

use ndarray::Array3;
use tracing::{debug, trace, warn};

use crate::formats::{FrameInfo, FrameTime, Header};
use crate::framing::{Frame, FrameReader};
use crate::prelude::*;
use crate::quantization::CodecSet;

/// Frames scanned when looking for the first frame of a thread or its interleave.
const MAX_THREAD_SCAN: usize = 1024;
/// Frames examined when locating one logical frame before calling it a gap.
const MAX_STEPS: usize = 256;
/// Frames scanned for a change of second when inferring the frame rate.
const MAX_RATE_SCAN: usize = 1 << 20;

/// Decoded contents of one frame.
pub(super) struct Decoded {
    pub data: Array3<f32>,
    /// Leading samples holding real data; the rest is padding.
    pub valid: usize,
}

pub(super) enum Slot<'a> {
    Data(&'a Decoded),
    /// Missing or unusable frame.
    Gap,
    /// Past the end of the data.
    Eof,
}

enum Located {
    Found(Decoded),
    Gap,
    Eof,
}

/// Reads the frames of one thread of one source by logical frame index.
///
/// The logical index of a frame is the number of frames between the stream start and
/// its timestamp. Physical frame positions are estimated from the last frame found and
/// the thread interleave, then corrected by stepping through headers.
pub(super) struct SourceCursor<S> {
    reader: FrameReader<S>,
    codecs: Arc<CodecSet>,
    thread: u16,
    first: FrameInfo,
    first_header: Header,
    /// Physical index of the first frame of `thread`.
    phase: u64,
    /// Physical frames per logical frame.
    stride: u64,
    /// Number of complete physical frames.
    total: u64,
    start: FrameTime,
    frame_rate: Option<f64>,
    /// Samples available from this source.
    num_samples: u64,
    /// Last located (logical, physical) pair.
    hint: Option<(u64, u64)>,
    cache: Option<(u64, Decoded)>,
}

fn is_frame_error(err: &Error) -> bool {
    matches!(
        err,
        Error::Format(_) | Error::Quantization(_) | Error::NotEnoughData { .. }
    )
}

impl<S> SourceCursor<S>
where
    S: Read + Seek,
{
    /// Position on the first frame of `thread`, or of the first frame's thread.
    pub fn open(
        mut reader: FrameReader<S>,
        thread: Option<u16>,
        codecs: Arc<CodecSet>,
    ) -> Result<Self> {
        let mut phase = reader.index();
        let mut found = None;
        for _ in 0..MAX_THREAD_SCAN {
            match reader.next_frame()? {
                Some(frame) if thread.map_or(true, |t| t == frame.info.thread_id) => {
                    found = Some(frame);
                    break;
                }
                Some(_) => phase += 1,
                None => break,
            }
        }
        let Some(Frame {
            header: first_header,
            info: first,
            ..
        }) = found
        else {
            return Err(Error::Format(format!("no frames for thread {thread:?}")));
        };
        let thread = first.thread_id;

        let mut stride = 1;
        for _ in 0..MAX_THREAD_SCAN {
            match reader.skip_frame() {
                Ok(Some(info)) if info.thread_id == thread => break,
                Ok(Some(_)) => stride += 1,
                _ => break,
            }
        }
        let total = reader.frame_count()?;
        debug!(thread, phase, stride, total, "source cursor opened");

        Ok(SourceCursor {
            reader,
            codecs,
            thread,
            first,
            first_header,
            phase,
            stride,
            total,
            start: FrameTime::new(0, 0),
            frame_rate: None,
            num_samples: 0,
            hint: None,
            cache: None,
        })
    }

    pub fn thread(&self) -> u16 {
        self.thread
    }

    pub fn first(&self) -> &FrameInfo {
        &self.first
    }

    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    /// Frame rate recorded in the first header, if the format has one.
    pub fn frame_rate_hint(&self) -> Option<f64> {
        self.reader
            .driver()
            .frame_rate(&self.first_header, &self.first)
    }

    /// Infer the frame rate as one more than the largest frame number before the first
    /// change of second.
    pub fn infer_frame_rate(&mut self) -> Result<Option<f64>> {
        self.reader.seek_frame(self.phase)?;
        let second = self.first.time.seconds;
        let mut max_nr = self.first.time.frame_nr;
        for _ in 0..MAX_RATE_SCAN {
            let info = match self.reader.skip_frame() {
                Ok(Some(info)) => info,
                Ok(None) => return Ok(None),
                Err(err) if is_frame_error(&err) => return Ok(None),
                Err(Error::TruncatedFrame { .. }) => return Ok(None),
                Err(err) => return Err(err),
            };
            if info.thread_id != self.thread {
                continue;
            }
            if info.time.seconds != second {
                let rate = (info.time.seconds == second + 1).then(|| (max_nr + 1) as f64);
                debug!(?rate, "inferred frame rate");
                return Ok(rate);
            }
            max_nr = max_nr.max(info.time.frame_nr);
        }
        Ok(None)
    }

    /// Fix the stream start and frame rate, and find where this source's data ends.
    pub fn configure(&mut self, start: FrameTime, frame_rate: Option<f64>) -> Result<()> {
        self.start = start;
        self.frame_rate = frame_rate;
        self.hint = None;
        self.cache = None;

        let spf = self.first.samples_per_frame()? as u64;
        let window = 2 * self.stride + 2;
        let mut lowest = self.total.saturating_sub(window);
        let mut p = self.total;
        let mut resyncs = 0;
        self.num_samples = 0;
        while p > lowest {
            p -= 1;
            self.reader.seek_frame(p)?;
            let info = match self.reader.skip_frame() {
                Ok(Some(info)) => info,
                Ok(None) => continue,
                Err(err) if is_frame_error(&err) => {
                    // lost or extra bytes shift the frames after them
                    if resyncs < MAX_STEPS && self.reader.resync()? {
                        resyncs += 1;
                        let total = self.reader.frame_count()?;
                        if total > self.total {
                            self.total = total;
                            p = total;
                            lowest = total.saturating_sub(window);
                        }
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };
            if info.thread_id != self.thread {
                continue;
            }
            let last = info.time.frames_since(&start, frame_rate)?.max(0) as u64;
            let valid = info.valid_samples.map_or(spf, |v| (v as u64).min(spf));
            self.num_samples = last * spf + valid;
            break;
        }
        self.reader.seek_frame(self.phase)?;
        trace!(thread = self.thread, num_samples = self.num_samples, "source end");
        Ok(())
    }

    fn guess(&self, k: u64) -> u64 {
        match self.hint {
            Some((logical, physical)) => {
                let delta = (k as i64 - logical as i64) * self.stride as i64;
                (physical as i64 + delta).max(0) as u64
            }
            None => self.phase + k * self.stride,
        }
    }

    fn read_at(&mut self, p: u64) -> Result<Option<Frame>> {
        self.reader.seek_frame(p)?;
        self.reader.next_frame()
    }

    /// Frame `k` of this source's thread, decoded.
    ///
    /// # Errors
    /// [Error::TruncatedFrame] when the search reaches a truncated frame, I/O errors,
    /// or [Error::UnknownFrameRate] if frames span seconds and no rate is known.
    pub fn frame_for(&mut self, k: u64) -> Result<Slot<'_>> {
        let cached = matches!(self.cache, Some((c, _)) if c == k);
        if !cached {
            match self.locate(k)? {
                Located::Found(decoded) => self.cache = Some((k, decoded)),
                Located::Gap => return Ok(Slot::Gap),
                Located::Eof => return Ok(Slot::Eof),
            }
        }
        Ok(match &self.cache {
            Some((_, decoded)) => Slot::Data(decoded),
            None => Slot::Gap,
        })
    }

    fn locate(&mut self, k: u64) -> Result<Located> {
        let mut p = self.guess(k);
        let mut seen_below = false;
        let mut backed_off = false;

        for _ in 0..MAX_STEPS {
            let frame = match self.read_at(p) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    if seen_below || p == 0 || self.total == 0 {
                        return Ok(Located::Eof);
                    }
                    backed_off = true;
                    p = p.min(self.total) - 1;
                    continue;
                }
                Err(err) if is_frame_error(&err) => {
                    warn!(thread = self.thread, frame = p, "skipping bad frame: {err}");
                    if !self.reader.resync()? {
                        return Ok(Located::Gap);
                    }
                    p = self.reader.index();
                    seen_below = true;
                    backed_off = true;
                    continue;
                }
                Err(err) => return Err(err),
            };
            if frame.info.thread_id != self.thread {
                p += 1;
                continue;
            }

            let logical = frame.info.time.frames_since(&self.start, self.frame_rate)?;
            let target = k as i64;
            if logical == target {
                self.hint = Some((k, p));
                return self.decode(frame);
            }
            if logical < target {
                let behind = (target - logical) as u64;
                if !backed_off && behind > 2 {
                    p += (behind - 1) * self.stride;
                } else {
                    seen_below = true;
                    p += 1;
                }
                continue;
            }
            if seen_below || p == 0 {
                trace!(thread = self.thread, frame = k, "missing frame");
                return Ok(Located::Gap);
            }
            backed_off = true;
            let ahead = (logical - target) as u64;
            p = p.saturating_sub((ahead * self.stride).max(1));
        }
        warn!(thread = self.thread, frame = k, "frame not found");
        Ok(Located::Gap)
    }

    fn decode(&self, frame: Frame) -> Result<Located> {
        let info = &frame.info;
        if info.invalid {
            trace!(thread = self.thread, "invalid frame");
            return Ok(Located::Gap);
        }
        if info.nchan != self.first.nchan
            || info.quantization != self.first.quantization
            || info.payload_len != self.first.payload_len
        {
            warn!(
                thread = self.thread,
                nchan = info.nchan,
                payload_len = info.payload_len,
                "frame layout differs from the first frame"
            );
            return Ok(Located::Gap);
        }
        let data = frame.decode(&self.codecs)?;
        let spf = data.dim().0;
        let valid = info.valid_samples.map_or(spf, |v| v.min(spf));
        Ok(Located::Found(Decoded { data, valid }))
    }
}
