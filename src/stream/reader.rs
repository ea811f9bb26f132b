use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::ops::Range;
use std::path::Path;

use hifitime::{Duration, Epoch};
use ndarray::{s, Array2, Array3};
use tracing::{debug, span, trace, Level};

use super::cursor::{Slot, SourceCursor};
use super::{ReadBlock, ReadPolicy, SeekTarget, StreamInfo, StreamOptions};
use crate::formats::{FormatParams, FrameTime, Registry};
use crate::framing::{FrameReader, Position};
use crate::prelude::*;
use crate::quantization::Quantization;
use crate::source::SequentialFile;

/// A seekable sequence of samples read from the frames of one or more sources.
///
/// With several sources, or one source per thread, the channels of each are concatenated
/// in source order. Sample 0 is the first sample of the earliest frame of any source.
pub struct SampleStream<S> {
    format: String,
    cursors: Vec<SourceCursor<S>>,
    /// Stream channels taken by each cursor.
    channels: Vec<Range<usize>>,
    options: StreamOptions,
    start: FrameTime,
    frame_rate: Option<f64>,
    samples_per_frame: usize,
    nchan: usize,
    ncomp: usize,
    quantization: Quantization,
    num_samples: u64,
    offset: u64,
}

impl<S> SampleStream<S>
where
    S: Read + Seek,
{
    /// Open a stream over `sources` using the built-in formats.
    ///
    /// # Errors
    /// See [Self::open_with].
    pub fn open(sources: Vec<S>, format: &str, options: StreamOptions) -> Result<Self> {
        Self::open_with(Registry::global(), sources, format, options)
    }

    /// Open a stream over `sources`, reading `format` from `registry`.
    ///
    /// # Errors
    /// [Error::UnsupportedFormat] if `format` is not registered, checked before any source
    /// is read. [Error::Config] if no sources are given or they differ in frame layout,
    /// and any error reading the first frames.
    pub fn open_with(
        registry: &Registry,
        sources: Vec<S>,
        format: &str,
        options: StreamOptions,
    ) -> Result<Self> {
        let driver = registry.lookup(format)?;
        if sources.is_empty() {
            return Err(Error::Config("no sources given".to_string()));
        }
        let span = span!(Level::DEBUG, "open", format, sources = sources.len());
        let _guard = span.enter();

        let params = FormatParams {
            nchan: options.nchan,
            quantization: options.quantization,
            ref_mjd: options.ref_mjd,
            ..FormatParams::default()
        };
        let mut cursors = Vec::with_capacity(sources.len());
        for (i, source) in sources.into_iter().enumerate() {
            let reader = FrameReader::with_max_search(
                source,
                driver.clone(),
                params.clone(),
                options.max_search,
            )?;
            let thread = options.threads.get(i).copied();
            cursors.push(SourceCursor::open(reader, thread, registry.codecs().clone())?);
        }

        let first = cursors[0].first().clone();
        let samples_per_frame = first.samples_per_frame()?;
        let ncomp = first.quantization.components();
        let mut channels = Vec::with_capacity(cursors.len());
        let mut nchan = 0;
        for cursor in &cursors {
            let info = cursor.first();
            if info.samples_per_frame()? != samples_per_frame
                || info.quantization.components() != ncomp
            {
                return Err(Error::Config(format!(
                    "thread {} has {} samples per frame and {} components, expected {} and {}",
                    cursor.thread(),
                    info.samples_per_frame()?,
                    info.quantization.components(),
                    samples_per_frame,
                    ncomp
                )));
            }
            channels.push(nchan..nchan + info.nchan);
            nchan += info.nchan;
        }

        let mut start = first.time;
        for cursor in &cursors {
            start = start.min(cursor.first().time);
        }

        let frame_rate = match options.sample_rate {
            Some(rate) => Some(rate / samples_per_frame as f64),
            None => match cursors[0].frame_rate_hint() {
                Some(rate) => Some(rate),
                None if driver.wraps_per_second() => cursors[0].infer_frame_rate()?,
                None => None,
            },
        };

        let mut num_samples = 0;
        for cursor in &mut cursors {
            cursor.configure(start, frame_rate)?;
            num_samples = num_samples.max(cursor.num_samples());
        }
        debug!(
            ?start,
            ?frame_rate,
            samples_per_frame,
            nchan,
            num_samples,
            "opened sample stream"
        );

        Ok(SampleStream {
            format: format.to_string(),
            cursors,
            channels,
            options,
            start,
            frame_rate,
            samples_per_frame,
            nchan,
            ncomp,
            quantization: first.quantization,
            num_samples,
            offset: 0,
        })
    }

    /// Read the next `n` samples and advance the offset by `n`.
    ///
    /// Samples without data take the fill value and are marked invalid; samples past the
    /// end of the data are also counted in [ReadBlock::exhausted]. On error the offset is
    /// unchanged.
    ///
    /// # Errors
    /// Under [ReadPolicy::Strict], [Error::Gap] for missing or invalid frames and
    /// [Error::Eof] past the end of the data. Under either policy,
    /// [Error::TruncatedFrame] when the read reaches a truncated final frame, and I/O
    /// errors.
    pub fn read(&mut self, n: usize) -> Result<ReadBlock> {
        let span = span!(Level::DEBUG, "read", offset = self.offset, n);
        let _guard = span.enter();

        let strict = self.options.policy == ReadPolicy::Strict;
        let spf = self.samples_per_frame;
        let mut data = Array3::from_elem((n, self.nchan, self.ncomp), self.options.fill_value);
        let mut valid = Array2::from_elem((n, self.nchan), false);

        for (cursor, chans) in self.cursors.iter_mut().zip(&self.channels) {
            let mut done = 0;
            while done < n {
                let pos = Position::from_offset(self.offset + done as u64, spf);
                let take = (spf - pos.sample).min(n - done);
                match cursor.frame_for(pos.frame)? {
                    Slot::Data(decoded) => {
                        let end = (pos.sample + take).min(decoded.valid);
                        if end > pos.sample {
                            let count = end - pos.sample;
                            data.slice_mut(s![done..done + count, chans.clone(), ..])
                                .assign(&decoded.data.slice(s![pos.sample..end, .., ..]));
                            valid
                                .slice_mut(s![done..done + count, chans.clone()])
                                .fill(true);
                        }
                        if strict && end < pos.sample + take {
                            let offset = Position {
                                frame: pos.frame,
                                sample: end.max(pos.sample),
                            };
                            return Err(Error::Eof {
                                offset: offset.to_offset(spf),
                            });
                        }
                    }
                    Slot::Gap if strict => return Err(Error::Gap { frame: pos.frame }),
                    Slot::Eof if strict => {
                        return Err(Error::Eof {
                            offset: self.offset + done as u64,
                        })
                    }
                    Slot::Gap | Slot::Eof => {}
                }
                done += take;
            }
        }

        let end = self.offset + n as u64;
        let exhausted = end.saturating_sub(self.num_samples.max(self.offset)) as usize;
        self.offset = end;
        let block = ReadBlock {
            data,
            valid,
            exhausted,
        };
        trace!(filled = block.filled(), exhausted, "read samples");
        Ok(block)
    }

    /// Move the offset, returning the new offset. Seeking past the end is allowed.
    ///
    /// # Errors
    /// [Error::InvalidSeek] for a target before the start, [Error::UnknownFrameRate] for a
    /// time target when the sample rate is unknown.
    pub fn seek(&mut self, target: SeekTarget) -> Result<u64> {
        let offset = match target {
            SeekTarget::Start(offset) => {
                self.offset = offset;
                return Ok(offset);
            }
            SeekTarget::Current(delta) => self.offset as i64 + delta,
            SeekTarget::End(delta) => self.num_samples as i64 + delta,
            SeekTarget::Time(epoch) => {
                let rate = self.sample_rate().ok_or(Error::UnknownFrameRate)?;
                let elapsed = (epoch - self.start_time()?).to_seconds();
                (elapsed * rate).round() as i64
            }
        };
        if offset < 0 {
            return Err(Error::InvalidSeek(offset));
        }
        self.offset = offset as u64;
        trace!(offset = self.offset, "seek");
        Ok(self.offset)
    }

    /// Current sample offset.
    #[must_use]
    pub fn tell(&self) -> u64 {
        self.offset
    }

    /// Time of the sample at the current offset.
    ///
    /// # Errors
    /// [Error::UnknownFrameRate] if the offset is non-zero and no rate is known.
    pub fn tell_time(&self) -> Result<Epoch> {
        let start = self.start_time()?;
        if self.offset == 0 {
            return Ok(start);
        }
        let rate = self.sample_rate().ok_or(Error::UnknownFrameRate)?;
        Ok(start + Duration::from_seconds(self.offset as f64 / rate))
    }

    /// Time of sample 0.
    ///
    /// # Errors
    /// [Error::UnknownFrameRate] if the first frame is not at a whole second and no rate
    /// is known.
    pub fn start_time(&self) -> Result<Epoch> {
        self.start.to_epoch(self.frame_rate)
    }

    /// Samples per second per channel, if known.
    #[must_use]
    pub fn sample_rate(&self) -> Option<f64> {
        self.frame_rate.map(|r| r * self.samples_per_frame as f64)
    }

    #[must_use]
    pub fn frame_rate(&self) -> Option<f64> {
        self.frame_rate
    }

    #[must_use]
    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    /// Samples up to the end of the last complete frame of any source.
    #[must_use]
    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    #[must_use]
    pub fn nchan(&self) -> usize {
        self.nchan
    }

    /// (samples, channels, components).
    #[must_use]
    pub fn shape(&self) -> (u64, usize, usize) {
        (self.num_samples, self.nchan, self.ncomp)
    }

    #[must_use]
    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            format: self.format.clone(),
            sources: self.cursors.len(),
            threads: self.cursors.iter().map(SourceCursor::thread).collect(),
            start: self.start,
            start_time: self.start_time().ok().map(|t| t.to_string()),
            sample_rate: self.sample_rate(),
            frame_rate: self.frame_rate,
            samples_per_frame: self.samples_per_frame,
            num_samples: self.num_samples,
            nchan: self.nchan,
            quantization: self.quantization,
            policy: self.options.policy,
        }
    }

    /// Release the sources.
    pub fn close(self) {
        debug!(format = %self.format, offset = self.offset, "closing sample stream");
    }
}

impl SampleStream<BufReader<File>> {
    /// Open one source per path.
    ///
    /// # Errors
    /// As for [Self::open], plus [Error::Io] if a file cannot be opened.
    pub fn open_paths<P: AsRef<Path>>(
        paths: &[P],
        format: &str,
        options: StreamOptions,
    ) -> Result<Self> {
        Registry::global().lookup(format)?;
        let mut sources = Vec::with_capacity(paths.len());
        for path in paths {
            sources.push(BufReader::new(File::open(path)?));
        }
        Self::open(sources, format, options)
    }
}

impl SampleStream<SequentialFile> {
    /// Open the concatenation of `paths` as a single source.
    ///
    /// # Errors
    /// As for [Self::open], plus [Error::Io] if a file cannot be opened.
    pub fn open_sequential<P: AsRef<Path>>(
        paths: &[P],
        format: &str,
        options: StreamOptions,
    ) -> Result<Self> {
        Registry::global().lookup(format)?;
        Self::open(vec![SequentialFile::open(paths)?], format, options)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn vdif_frame(seconds: u8, frame_nr: u8, thread: u8) -> Vec<u8> {
        // 1 channel, 8-bit real, 64-byte frames
        let mut frame = hex::decode("000000000000001c080000000000001c").unwrap();
        frame.resize(32, 0);
        frame[0] = seconds;
        frame[4] = frame_nr;
        frame[14] = thread;
        frame.extend((0..32u8).map(|i| i + frame_nr));
        frame
    }

    fn stream(data: Vec<u8>, options: StreamOptions) -> SampleStream<Cursor<Vec<u8>>> {
        SampleStream::open(vec![Cursor::new(data)], "vdif", options).unwrap()
    }

    #[test]
    fn reads_across_frames() {
        let data: Vec<u8> = (0..3).flat_map(|i| vdif_frame(0, i, 0)).collect();
        let mut stream = stream(
            data,
            StreamOptions::builder().sample_rate(3200.0).build(),
        );
        assert_eq!(stream.samples_per_frame(), 32);
        assert_eq!(stream.shape(), (96, 1, 1));

        let block = stream.read(40).unwrap();
        assert!(block.is_complete());
        assert_eq!(block.exhausted, 0);
        // 8-bit offset binary: level = code - 128
        assert_eq!(block.data[[0, 0, 0]], -128.0);
        assert_eq!(block.data[[33, 0, 0]], -126.0);
        assert_eq!(stream.tell(), 40);
    }

    #[test]
    fn missing_frame_is_filled() {
        let data: Vec<u8> = [0, 2].iter().flat_map(|i| vdif_frame(0, *i, 0)).collect();
        let mut stream = stream(
            data,
            StreamOptions::builder()
                .sample_rate(3200.0)
                .fill_value(0.0)
                .build(),
        );
        let block = stream.read(96).unwrap();
        assert_eq!(block.filled(), 32);
        assert!(!block.valid[[40, 0]]);
        assert_eq!(block.data[[40, 0, 0]], 0.0);
        assert!(block.valid[[64, 0]]);
        assert_eq!(block.exhausted, 0);
    }

    #[test]
    fn strict_policy_reports_gaps() {
        let data: Vec<u8> = [0, 2].iter().flat_map(|i| vdif_frame(0, *i, 0)).collect();
        let mut stream = stream(
            data,
            StreamOptions::builder()
                .sample_rate(3200.0)
                .policy(ReadPolicy::Strict)
                .build(),
        );
        stream.read(32).unwrap();
        assert!(matches!(stream.read(32), Err(Error::Gap { frame: 1 })));
        assert_eq!(stream.tell(), 32);
        stream.seek(SeekTarget::Start(64)).unwrap();
        stream.read(32).unwrap();
        assert!(matches!(stream.read(1), Err(Error::Eof { offset: 96 })));
    }

    #[test]
    fn seek_targets() {
        let data: Vec<u8> = (0..4).flat_map(|i| vdif_frame(0, i, 0)).collect();
        let mut stream = stream(
            data,
            StreamOptions::builder().sample_rate(3200.0).build(),
        );
        assert_eq!(stream.seek(SeekTarget::End(-10)).unwrap(), 118);
        assert_eq!(stream.seek(SeekTarget::Current(-18)).unwrap(), 100);
        assert!(matches!(
            stream.seek(SeekTarget::Current(-101)),
            Err(Error::InvalidSeek(-1))
        ));
        assert_eq!(stream.tell(), 100);

        let later = stream.start_time().unwrap() + Duration::from_seconds(0.01);
        assert_eq!(stream.seek(SeekTarget::Time(later)).unwrap(), 32);

        stream.seek(SeekTarget::Start(120)).unwrap();
        let block = stream.read(16).unwrap();
        assert_eq!(block.exhausted, 8);
        assert_eq!(block.filled(), 8);
    }

    #[test]
    fn interleaved_threads_are_concatenated() {
        let data: Vec<u8> = (0..3)
            .flat_map(|i| [vdif_frame(0, i, 0), vdif_frame(0, i, 1)])
            .flatten()
            .collect();
        let options = StreamOptions::builder()
            .sample_rate(3200.0)
            .threads(vec![0, 1])
            .build();
        let mut stream =
            SampleStream::open(vec![Cursor::new(data.clone()), Cursor::new(data)], "vdif", options)
                .unwrap();
        assert_eq!(stream.shape(), (96, 2, 1));
        assert_eq!(stream.info().threads, vec![0, 1]);

        stream.seek(SeekTarget::Start(64)).unwrap();
        let block = stream.read(32).unwrap();
        assert!(block.is_complete());
        assert_eq!(block.data[[0, 0, 0]], block.data[[0, 1, 0]]);
        assert_eq!(block.data[[0, 0, 0]], -126.0);
    }

    #[test]
    fn infers_frame_rate_from_second_change() {
        let data: Vec<u8> = [(0, 0), (0, 1), (1, 0), (1, 1)]
            .iter()
            .flat_map(|(s, n)| vdif_frame(*s, *n, 0))
            .collect();
        let stream = stream(data, StreamOptions::default());
        assert_eq!(stream.frame_rate(), Some(2.0));
        assert_eq!(stream.sample_rate(), Some(64.0));
        assert_eq!(stream.num_samples(), 128);
    }

    #[test]
    fn unknown_format_is_rejected() {
        let err = SampleStream::open(vec![Cursor::new(Vec::new())], "vdif2000", StreamOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }
}
