use std::borrow::Cow;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use tracing::{debug, trace};

use super::read_full;
use crate::formats::{Driver, FormatParams, FrameInfo, Header};
use crate::prelude::*;

/// Default number of bytes scanned for the first frame.
pub const DEFAULT_MAX_SEARCH: usize = 1 << 20;

/// A synchronized frame location.
#[derive(Debug, Clone, PartialEq)]
pub struct Loc {
    /// Offset of the first header byte.
    pub offset: u64,
    /// Length of the frame including its header.
    pub frame_len: usize,
    pub info: FrameInfo,
}

enum Probe {
    Frame(Header, FrameInfo),
    /// Not enough bytes left to tell.
    Short,
    Invalid,
}

/// Synchronizer scans a byte stream for the start of a valid frame.
///
/// A candidate offset must match the format's sync pattern, parse, pass the driver's
/// plausibility checks, and be followed by either the exact end of the data or another
/// header of the same kind.
pub struct Synchronizer {
    driver: Arc<dyn Driver>,
    params: FormatParams,
}

impl Synchronizer {
    #[must_use]
    pub fn new(driver: Arc<dyn Driver>, params: FormatParams) -> Self {
        Synchronizer { driver, params }
    }

    /// Scan at most `max_search` bytes starting at `from` for a frame start.
    ///
    /// The source position is unspecified afterwards.
    ///
    /// # Errors
    /// Only I/O errors; a failed search is `Ok(None)`.
    pub fn scan<S: Read + Seek>(
        &self,
        source: &mut S,
        from: u64,
        max_search: usize,
    ) -> Result<Option<Loc>> {
        let end = source.seek(SeekFrom::End(0))?;
        let window = read_at(source, from, max_search + self.driver.min_header_len())?;
        let limit = max_search.min(window.len());

        for i in 0..limit {
            if !self.driver.check_sync(&window[i..]) {
                continue;
            }
            let offset = from + i as u64;
            let Probe::Frame(header, info) = self.probe(source, &window, from, offset)? else {
                continue;
            };
            if !self.driver.is_plausible(&info) {
                trace!(offset, "implausible header");
                continue;
            }
            let frame_len = header.len() + info.payload_len;
            if self.confirm(source, &window, from, offset + frame_len as u64, end, &info)? {
                debug!(offset, skipped = i, frame_len, "synchronized");
                return Ok(Some(Loc {
                    offset,
                    frame_len,
                    info,
                }));
            }
            trace!(offset, "next frame does not follow");
        }
        Ok(None)
    }

    fn probe<S: Read + Seek>(
        &self,
        source: &mut S,
        window: &[u8],
        window_start: u64,
        offset: u64,
    ) -> Result<Probe> {
        let min = self.driver.min_header_len();
        let prefix = bytes_at(source, window, window_start, offset, min)?;
        let len = match self.driver.header_len(&prefix) {
            Ok(len) => len,
            Err(_) if prefix.len() < min => return Ok(Probe::Short),
            Err(_) => return Ok(Probe::Invalid),
        };
        let buf = if len > prefix.len() {
            bytes_at(source, window, window_start, offset, len)?
        } else {
            prefix
        };
        if buf.len() < len {
            return Ok(Probe::Short);
        }
        let Ok(header) = self.driver.parse_header(&buf[..len]) else {
            return Ok(Probe::Invalid);
        };
        match self.driver.info(&header, &self.params) {
            Ok(info) => Ok(Probe::Frame(header, info)),
            Err(_) => Ok(Probe::Invalid),
        }
    }

    fn confirm<S: Read + Seek>(
        &self,
        source: &mut S,
        window: &[u8],
        window_start: u64,
        next: u64,
        end: u64,
        info: &FrameInfo,
    ) -> Result<bool> {
        if next == end {
            return Ok(true);
        }
        if next > end {
            return Ok(false);
        }
        let prefix = bytes_at(source, window, window_start, next, self.driver.min_header_len())?;
        if !self.driver.check_sync(&prefix) {
            return Ok(false);
        }
        Ok(match self.probe(source, window, window_start, next)? {
            Probe::Frame(_, other) => {
                other.payload_len == info.payload_len
                    && other.nchan == info.nchan
                    && other.quantization == info.quantization
                    && other.time >= info.time
            }
            Probe::Short => true,
            Probe::Invalid => false,
        })
    }
}

/// Up to `len` bytes at `offset`, fewer at the end of the source.
fn read_at<S: Read + Seek>(source: &mut S, offset: u64, len: usize) -> Result<Vec<u8>> {
    source.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    let n = read_full(source, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

fn bytes_at<'a, S: Read + Seek>(
    source: &mut S,
    window: &'a [u8],
    window_start: u64,
    offset: u64,
    len: usize,
) -> Result<Cow<'a, [u8]>> {
    if offset >= window_start {
        let rel = (offset - window_start) as usize;
        if rel + len <= window.len() {
            return Ok(Cow::Borrowed(&window[rel..rel + len]));
        }
    }
    Ok(Cow::Owned(read_at(source, offset, len)?))
}
