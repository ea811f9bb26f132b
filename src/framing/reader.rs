use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::synchronizer::{Synchronizer, DEFAULT_MAX_SEARCH};
use super::{read_full, Frame};
use crate::formats::{Driver, FormatParams, FrameInfo, FrameSize, Header};
use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Ready to read the frame at the current offset.
    Positioned,
    /// The last read found no more data.
    Eof,
    /// The last read failed; the offset is unchanged.
    Error,
}

/// Reads frames sequentially from a seekable byte source.
pub struct FrameReader<S> {
    source: S,
    driver: Arc<dyn Driver>,
    params: FormatParams,
    state: ReaderState,
    /// Offset of frame 0.
    start: u64,
    /// Index of the frame at `offset`.
    index: u64,
    offset: u64,
    /// Current position of `source`, when known.
    pos: Option<u64>,
    len: u64,
    fixed_len: Option<usize>,
    /// Offsets of frames seen so far for variable frame sizes. For fixed sizes, the
    /// origin of each run of aligned frames.
    anchors: BTreeMap<u64, u64>,
    max_search: usize,
}

struct RawHeader {
    header: Header,
    info: FrameInfo,
    /// Bytes read past the header.
    extra: Vec<u8>,
}

impl<S> FrameReader<S>
where
    S: Read + Seek,
{
    /// Create a reader whose frame 0 is the first valid frame at or after the source's
    /// current position.
    ///
    /// # Errors
    /// [Error::Format] if no frame is found within the search window, or I/O errors.
    pub fn new(source: S, driver: Arc<dyn Driver>, params: FormatParams) -> Result<Self> {
        Self::with_max_search(source, driver, params, DEFAULT_MAX_SEARCH)
    }

    /// Like [Self::new] but scanning at most `max_search` bytes.
    ///
    /// # Errors
    /// [Error::Format] if no frame is found within the search window, or I/O errors.
    pub fn with_max_search(
        mut source: S,
        driver: Arc<dyn Driver>,
        params: FormatParams,
        max_search: usize,
    ) -> Result<Self> {
        let from = source.stream_position()?;
        let sync = Synchronizer::new(driver.clone(), params.clone());
        let loc = sync.scan(&mut source, from, max_search)?.ok_or_else(|| {
            Error::Format(format!(
                "no {} frame within {max_search} bytes of offset {from}",
                driver.name()
            ))
        })?;
        let mut reader = Self::at(source, driver, params, loc.offset)?;
        reader.max_search = max_search;
        Ok(reader)
    }

    /// Create a reader whose frame 0 starts at `start`, without scanning.
    ///
    /// # Errors
    /// On I/O errors determining the source length.
    pub fn at(
        mut source: S,
        driver: Arc<dyn Driver>,
        params: FormatParams,
        start: u64,
    ) -> Result<Self> {
        let len = source.seek(SeekFrom::End(0))?;
        let fixed_len = match driver.descriptor().frame_size {
            FrameSize::Fixed(n) => Some(n),
            FrameSize::Header => None,
        };
        debug!(format = driver.name(), start, len, "frame reader positioned");
        Ok(FrameReader {
            source,
            driver,
            params,
            state: ReaderState::Positioned,
            start,
            index: 0,
            offset: start,
            pos: Some(len),
            len,
            fixed_len,
            anchors: BTreeMap::from([(0, start)]),
            max_search: DEFAULT_MAX_SEARCH,
        })
    }

    #[must_use]
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Index of the next frame to be read.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Byte offset of the next frame to be read.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    #[must_use]
    pub fn params(&self) -> &FormatParams {
        &self.params
    }

    pub fn into_inner(self) -> S {
        self.source
    }

    fn seek_source(&mut self, offset: u64) -> Result<()> {
        if self.pos != Some(offset) {
            self.pos = None;
            self.source.seek(SeekFrom::Start(offset))?;
        }
        self.pos = Some(offset);
        Ok(())
    }

    fn read_source(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = read_full(&mut self.source, buf)?;
        self.pos = self.pos.map(|p| p + n as u64);
        Ok(n)
    }

    /// The nearest known frame at or before `index`.
    fn anchor(&self, index: u64) -> (u64, u64) {
        self.anchors
            .range(..=index)
            .next_back()
            .map_or((0, self.start), |(i, o)| (*i, *o))
    }

    fn truncated(&mut self, expected: usize, actual: usize) -> Error {
        self.state = ReaderState::Error;
        warn!(offset = self.offset, expected, actual, "truncated frame");
        Error::TruncatedFrame {
            offset: self.offset,
            expected,
            actual,
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        self.state = ReaderState::Error;
        debug!(offset = self.offset, index = self.index, "frame error: {err}");
        err
    }

    fn read_header(&mut self) -> Result<Option<RawHeader>> {
        let min = self.driver.min_header_len();
        self.seek_source(self.offset)?;
        let mut buf = vec![0u8; min];
        let n = self.read_source(&mut buf)?;
        if n == 0 {
            self.state = ReaderState::Eof;
            return Ok(None);
        }
        buf.truncate(n);

        let header_len = match self.driver.header_len(&buf) {
            Ok(len) => len,
            Err(_) if n < min => return Err(self.truncated(min, n)),
            Err(err) => return Err(self.fail(err)),
        };
        if header_len > buf.len() {
            let have = buf.len();
            buf.resize(header_len, 0);
            let m = self.read_source(&mut buf[have..])?;
            if have + m < header_len {
                return Err(self.truncated(header_len, have + m));
            }
        }
        let header = match self.driver.parse_header(&buf[..header_len]) {
            Ok(header) => header,
            Err(err) => return Err(self.fail(err)),
        };
        let info = match self.driver.info(&header, &self.params) {
            Ok(info) => info,
            Err(err) => return Err(self.fail(err)),
        };
        let extra = buf.split_off(header_len);
        Ok(Some(RawHeader {
            header,
            info,
            extra,
        }))
    }

    fn advance(&mut self, frame_len: usize) {
        self.offset += frame_len as u64;
        self.index += 1;
        if self.fixed_len.is_none() {
            self.anchors.insert(self.index, self.offset);
        }
        self.state = ReaderState::Positioned;
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when no bytes remain. On error the reader stays at the failed
    /// frame.
    ///
    /// # Errors
    /// [Error::TruncatedFrame] if the source ends inside the frame, [Error::Format] for
    /// invalid headers, or I/O errors.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(raw) = self.read_header()? else {
            return Ok(None);
        };
        let header_len = raw.header.len();
        let payload_len = raw.info.payload_len;
        let frame_len = header_len.saturating_add(payload_len);

        let mut payload = raw.extra;
        if payload.len() >= payload_len {
            payload.truncate(payload_len);
            // the source read ahead of the frame end
            self.pos = None;
        } else {
            let have = payload.len();
            let consumed = self.offset + (header_len + have) as u64;
            let available = self.len.saturating_sub(consumed);
            if (payload_len - have) as u64 > available {
                return Err(self.truncated(frame_len, header_len + have + available as usize));
            }
            payload.resize(payload_len, 0);
            let m = self.read_source(&mut payload[have..])?;
            if have + m < payload_len {
                return Err(self.truncated(frame_len, header_len + have + m));
            }
        }
        let frame = Frame::new(raw.header, raw.info, payload)?;
        trace!(index = self.index, offset = self.offset, frame_len, "read frame");
        self.advance(frame_len);
        Ok(Some(frame))
    }

    /// Skip the next frame reading only its header.
    ///
    /// # Errors
    /// As for [Self::next_frame].
    pub fn skip_frame(&mut self) -> Result<Option<FrameInfo>> {
        let Some(raw) = self.read_header()? else {
            return Ok(None);
        };
        let frame_len = raw.header.len().saturating_add(raw.info.payload_len);
        let available = self.len.saturating_sub(self.offset);
        if (frame_len as u64) > available {
            return Err(self.truncated(frame_len, available as usize));
        }
        self.pos = None;
        self.advance(frame_len);
        Ok(Some(raw.info))
    }

    /// Position the reader at frame `index`.
    ///
    /// Fixed-size frames are located directly; otherwise frames are skipped forward from
    /// the nearest frame already seen. Seeking past the last frame leaves the reader at
    /// the end of the data.
    ///
    /// # Errors
    /// If a frame on the way cannot be read.
    pub fn seek_frame(&mut self, index: u64) -> Result<()> {
        self.state = ReaderState::Positioned;
        let (anchor, offset) = self.anchor(index);
        if let Some(len) = self.fixed_len {
            self.index = index;
            self.offset = offset + (index - anchor) * len as u64;
            return Ok(());
        }
        self.index = anchor;
        self.offset = offset;
        while self.index < index {
            if self.skip_frame()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    /// Scan for the next valid frame after the one that failed at the current offset.
    ///
    /// For fixed-size formats the scan starts just past the previous frame's start, so a
    /// frame shifted back by lost bytes is found again; frames after it are aligned to
    /// its new offset. For variable-size formats the scan starts just past the current
    /// offset and the skipped bytes count as a single frame. Returns whether a frame was
    /// found; if not, the reader is left at the end of the data.
    ///
    /// # Errors
    /// On I/O errors.
    pub fn resync(&mut self) -> Result<bool> {
        let sync = Synchronizer::new(self.driver.clone(), self.params.clone());
        let (anchor, anchor_offset) = self.anchor(self.index);
        let from = match self.fixed_len {
            Some(len) => (self.offset + 1)
                .saturating_sub(len as u64)
                .max(anchor_offset + 1),
            None => self.offset + 1,
        };
        self.pos = None;
        let found = sync.scan(&mut self.source, from, self.max_search)?;
        let Some(loc) = found else {
            debug!(from, "no frame found while resynchronizing");
            self.offset = self.len;
            self.state = ReaderState::Eof;
            return Ok(false);
        };
        self.index = match self.fixed_len {
            Some(len) => anchor + (loc.offset - anchor_offset).div_ceil(len as u64),
            None => self.index + 1,
        };
        debug!(from, offset = loc.offset, index = self.index, "resynchronized");
        self.offset = loc.offset;
        self.state = ReaderState::Positioned;
        let index = self.index;
        self.anchors.retain(|i, _| *i < index);
        self.anchors.insert(index, self.offset);
        Ok(true)
    }

    /// Number of complete frames in the source.
    ///
    /// # Errors
    /// If a frame header cannot be read.
    pub fn frame_count(&mut self) -> Result<u64> {
        let (last, last_offset) = self
            .anchors
            .last_key_value()
            .map_or((0, self.start), |(i, o)| (*i, *o));
        if let Some(len) = self.fixed_len {
            return Ok(last + self.len.saturating_sub(last_offset) / len as u64);
        }
        let (index, offset, state) = (self.index, self.offset, self.state);
        self.index = last;
        self.offset = last_offset;
        let mut result = Ok(());
        loop {
            match self.skip_frame() {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(Error::TruncatedFrame { .. }) => break,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        let count = self.index;
        self.index = index;
        self.offset = offset;
        self.state = state;
        result.map(|()| count)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::formats::{Generic, Registry};

    const TEN: &str = r#"{
        "name": "ten",
        "frame_size": {"fixed": 110},
        "header_size": {"fixed": 10},
        "layout": {
            "word_bytes": 2,
            "words": 5,
            "endian": "big",
            "fields": [
                {"name": "sync", "word": 0, "bit": 0, "width": 16, "default": 48879},
                {"name": "seconds", "word": 1, "bit": 0, "width": 32},
                {"name": "frame_nr", "word": 3, "bit": 0, "width": 16}
            ]
        },
        "quantization": {"bits": 8, "complex": false, "coding": "twos_complement"},
        "nchan": 1
    }"#;

    fn ten_frame(frame_nr: u8) -> Vec<u8> {
        let mut frame = vec![0xbe, 0xef, 0x53, 0x70, 0, 0, 0, frame_nr, 0, 0];
        frame.resize(110, frame_nr);
        frame
    }

    fn vdif_frame(seconds: u8, frame_nr: u8) -> Vec<u8> {
        // 1 channel, 8-bit real, 64-byte frames
        let mut frame = hex::decode("000000000000001c080000000000001c").unwrap();
        frame.resize(32, 0);
        frame[0] = seconds;
        frame[4] = frame_nr;
        frame.extend((0..32u8).map(|i| i.wrapping_mul(frame_nr + 1)));
        frame
    }

    fn reader(data: Vec<u8>) -> FrameReader<Cursor<Vec<u8>>> {
        let driver = Registry::default().lookup("vdif").unwrap();
        FrameReader::new(Cursor::new(data), driver, FormatParams::default()).unwrap()
    }

    #[test]
    fn reads_frames_until_eof() {
        let data: Vec<u8> = (0..3).flat_map(|i| vdif_frame(1, i)).collect();
        let mut reader = reader(data);
        for i in 0..3 {
            let frame = reader.next_frame().unwrap().unwrap();
            assert_eq!(frame.info.time.frame_nr, i);
            assert_eq!(frame.payload.len(), 32);
        }
        assert!(reader.next_frame().unwrap().is_none());
        assert_eq!(reader.state(), ReaderState::Eof);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut data: Vec<u8> = (0..2).flat_map(|i| vdif_frame(1, i)).collect();
        data.pop();
        let mut reader = reader(data);
        assert!(reader.next_frame().unwrap().is_some());
        let err = reader.next_frame().unwrap_err();
        assert!(matches!(
            err,
            Error::TruncatedFrame {
                offset: 64,
                expected: 64,
                actual: 63
            }
        ));
        assert_eq!(reader.state(), ReaderState::Error);
        assert_eq!(reader.offset(), 64);
    }

    #[test]
    fn seek_and_count_variable_frames() {
        let data: Vec<u8> = (0..5).flat_map(|i| vdif_frame(2, i)).collect();
        let mut reader = reader(data);
        assert_eq!(reader.frame_count().unwrap(), 5);
        reader.seek_frame(3).unwrap();
        assert_eq!(reader.offset(), 192);
        assert_eq!(reader.next_frame().unwrap().unwrap().info.time.frame_nr, 3);
        reader.seek_frame(1).unwrap();
        assert_eq!(reader.next_frame().unwrap().unwrap().info.time.frame_nr, 1);
        reader.seek_frame(9).unwrap();
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn resync_skips_corruption() {
        let mut data: Vec<u8> = (0..5).flat_map(|i| vdif_frame(2, i)).collect();
        // corrupt frame 2's header so its frame length is nonsense
        data[128 + 8] = 0xff;
        data[128 + 9] = 0xff;
        let mut reader = reader(data);
        assert!(reader.next_frame().unwrap().is_some());
        assert!(reader.next_frame().unwrap().is_some());
        assert!(reader.next_frame().is_err());
        assert!(reader.resync().unwrap());
        assert_eq!(reader.offset(), 192);
        assert_eq!(reader.next_frame().unwrap().unwrap().info.time.frame_nr, 3);
    }

    #[test]
    fn oversized_frame_length_is_truncation() {
        let mut data: Vec<u8> = (0..3).flat_map(|i| vdif_frame(2, i)).collect();
        data[128 + 8..128 + 11].copy_from_slice(&[0xff, 0xff, 0xff]);
        let mut reader = reader(data);
        assert!(reader.next_frame().unwrap().is_some());
        assert!(reader.next_frame().unwrap().is_some());
        assert!(matches!(
            reader.next_frame(),
            Err(Error::TruncatedFrame {
                offset: 128,
                expected: 134_217_720,
                actual: 64
            })
        ));
    }

    #[test]
    fn resync_realigns_fixed_frames() {
        let driver: Arc<dyn Driver> = Arc::new(Generic::from_json(TEN).unwrap());
        let mut data: Vec<u8> = (0..5).flat_map(ten_frame).collect();
        // frame 1 loses 30 payload bytes
        data.drain(140..170);
        let mut reader =
            FrameReader::new(Cursor::new(data), driver, FormatParams::default()).unwrap();
        assert_eq!(reader.frame_count().unwrap(), 4);

        reader.seek_frame(2).unwrap();
        assert_eq!(reader.offset(), 220);
        assert!(matches!(reader.next_frame(), Err(Error::Format(_))));
        assert!(reader.resync().unwrap());
        assert_eq!((reader.index(), reader.offset()), (2, 190));
        assert_eq!(reader.next_frame().unwrap().unwrap().info.time.frame_nr, 2);

        reader.seek_frame(4).unwrap();
        assert_eq!(reader.offset(), 410);
        assert_eq!(reader.next_frame().unwrap().unwrap().info.time.frame_nr, 4);
        reader.seek_frame(1).unwrap();
        assert_eq!(reader.offset(), 110);
        assert_eq!(reader.frame_count().unwrap(), 5);
    }
}
