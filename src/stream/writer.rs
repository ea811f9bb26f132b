use std::io::Write;
use std::sync::Arc;

use hifitime::Epoch;
use ndarray::ArrayView3;
use tracing::{debug, trace, warn};
use typed_builder::TypedBuilder;

use crate::formats::{Driver, FormatParams, FrameInfo, FrameTime, Registry};
use crate::framing::{Frame, FrameWriter};
use crate::prelude::*;
use crate::quantization::{Codec, Quantization};

/// Options for creating a [StreamWriter].
#[derive(Debug, Clone, TypedBuilder)]
pub struct WriterOptions {
    /// Time of the first sample. Rounded to the nearest frame boundary.
    pub start_time: Epoch,
    /// Samples per second per channel.
    pub sample_rate: f64,
    pub nchan: usize,
    pub quantization: Quantization,
    /// Required for formats whose frame size is not fixed.
    #[builder(default, setter(strip_option))]
    pub samples_per_frame: Option<usize>,
    #[builder(default)]
    pub thread_id: u16,
    #[builder(default, setter(strip_option))]
    pub station_id: Option<u16>,
}

/// What [StreamWriter::close] hands back.
#[derive(Debug)]
pub struct WriteSummary<W> {
    pub sink: W,
    /// Frames written, including a padded final frame.
    pub frames: u64,
    /// Zero samples appended to fill the final frame.
    pub padded_samples: usize,
}

/// Cuts sample blocks into frames of one format and writes them to a sink.
///
/// Samples are buffered until a frame is full. On [Self::close], or drop, a partial final
/// frame is padded with zero samples; formats that can record it note how many samples
/// are real.
pub struct StreamWriter<W: Write> {
    writer: Option<FrameWriter<W>>,
    driver: Arc<dyn Driver>,
    codec: Arc<Codec>,
    options: WriterOptions,
    params: FormatParams,
    start: FrameTime,
    /// Frames per second, for formats numbering frames within each second.
    wrap: Option<u64>,
    samples_per_frame: usize,
    payload_len: usize,
    ncomp: usize,
    pending: Vec<f32>,
    frames: u64,
}

impl<W: Write> StreamWriter<W> {
    /// # Errors
    /// See [Self::create_with].
    pub fn create(sink: W, format: &str, options: WriterOptions) -> Result<Self> {
        Self::create_with(Registry::global(), sink, format, options)
    }

    /// Create a writer for `format` from `registry`.
    ///
    /// # Errors
    /// [Error::UnsupportedFormat] if `format` is not registered, [Error::Config] if the
    /// frame size cannot be determined or does not suit the format, and
    /// [Error::Quantization] for unsupported quantization.
    pub fn create_with(
        registry: &Registry,
        sink: W,
        format: &str,
        options: WriterOptions,
    ) -> Result<Self> {
        let driver = registry.lookup(format)?;
        let quant = options.quantization;
        quant.validate()?;
        if options.nchan == 0 {
            return Err(Error::Config("nchan must be positive".to_string()));
        }
        if options.sample_rate.is_nan() || options.sample_rate <= 0.0 {
            return Err(Error::Config(format!(
                "sample rate must be positive, got {}",
                options.sample_rate
            )));
        }
        let codec = registry.codecs().get(&quant)?;

        let fixed = driver.descriptor().fixed_payload_len();
        let samples_per_frame = match (options.samples_per_frame, fixed) {
            (Some(n), _) => n,
            (None, Some(len)) => quant.samples_in(len, options.nchan)?,
            (None, None) => {
                return Err(Error::Config(format!(
                    "samples per frame must be given for {format}"
                )))
            }
        };
        if samples_per_frame == 0 {
            return Err(Error::Config("samples per frame must be positive".to_string()));
        }
        let payload_len = quant.payload_len(samples_per_frame, options.nchan)?;
        if let Some(len) = fixed {
            if len != payload_len {
                return Err(Error::Config(format!(
                    "{format} payloads are {len} bytes, {samples_per_frame} samples need {payload_len}"
                )));
            }
        }

        let frame_rate = options.sample_rate / samples_per_frame as f64;
        let wrap = if driver.wraps_per_second() {
            if frame_rate.fract() != 0.0 {
                return Err(Error::Config(format!(
                    "{format} needs a whole number of frames per second, got {frame_rate}"
                )));
            }
            Some(frame_rate as u64)
        } else {
            None
        };
        let start = FrameTime::from_epoch(options.start_time, frame_rate);
        let params = FormatParams {
            nchan: Some(options.nchan),
            quantization: Some(quant),
            frame_rate: Some(frame_rate),
            station_id: options.station_id,
            ..FormatParams::default()
        };
        debug!(
            format,
            samples_per_frame, payload_len, frame_rate, "created stream writer"
        );

        Ok(StreamWriter {
            writer: Some(FrameWriter::new(sink)),
            driver,
            codec,
            ncomp: quant.components(),
            options,
            params,
            start,
            wrap,
            samples_per_frame,
            payload_len,
            pending: Vec::new(),
            frames: 0,
        })
    }

    #[must_use]
    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    /// Frames written so far.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Samples buffered towards the next frame.
    #[must_use]
    pub fn pending_samples(&self) -> usize {
        self.pending.len() / (self.options.nchan * self.ncomp)
    }

    /// Append `block` with shape (time, channel, component), writing each frame it
    /// completes.
    ///
    /// # Errors
    /// [Error::Shape] if the channels or components differ from the writer's, and I/O
    /// errors from the sink. Samples of a frame that failed to write stay buffered.
    pub fn write(&mut self, block: ArrayView3<f32>) -> Result<()> {
        let (_, nchan, ncomp) = block.dim();
        if (nchan, ncomp) != (self.options.nchan, self.ncomp) {
            return Err(Error::Shape {
                expected: (self.options.nchan, self.ncomp),
                actual: (nchan, ncomp),
            });
        }
        self.pending.extend(block.iter().copied());

        let frame_values = self.samples_per_frame * nchan * ncomp;
        while self.pending.len() >= frame_values {
            let mut values: Vec<f32> = self.pending.drain(..frame_values).collect();
            if let Err(err) = self.emit(&values, None) {
                // keep the samples so a retry or close can still write them
                values.append(&mut self.pending);
                self.pending = values;
                return Err(err);
            }
        }
        Ok(())
    }

    fn emit(&mut self, values: &[f32], valid_samples: Option<usize>) -> Result<()> {
        let mut payload = vec![0u8; self.payload_len];
        self.codec.encode(values, &mut payload)?;

        let info = FrameInfo {
            time: self.start.advance(self.frames, self.wrap),
            thread_id: self.options.thread_id,
            invalid: false,
            nchan: self.options.nchan,
            quantization: self.options.quantization,
            payload_len: self.payload_len,
            valid_samples,
        };
        let header = self.driver.build_header(&info, &self.params)?;
        let frame = Frame::new(header, info, payload)?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Config("writer is closed".to_string()))?;
        writer.write_frame(&frame)?;
        self.frames += 1;
        Ok(())
    }

    /// Write any partial frame and flush, returning the number of padding samples.
    fn finish(&mut self) -> Result<usize> {
        let mut padded = 0;
        if !self.pending.is_empty() {
            let filled = self.pending_samples();
            padded = self.samples_per_frame - filled;
            let mut values = std::mem::take(&mut self.pending);
            values.resize(self.samples_per_frame * self.options.nchan * self.ncomp, 0.0);
            self.emit(&values, Some(filled))?;
            debug!(filled, padded, "wrote partial final frame");
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(padded)
    }

    /// Write any partial final frame and return the sink.
    ///
    /// # Errors
    /// I/O errors from the sink, or header errors for the final frame.
    pub fn close(mut self) -> Result<WriteSummary<W>> {
        let padded_samples = self.finish()?;
        let writer = self
            .writer
            .take()
            .ok_or_else(|| Error::Config("writer is closed".to_string()))?;
        trace!(frames = self.frames, bytes = writer.bytes(), "closed stream writer");
        Ok(WriteSummary {
            sink: writer.into_inner(),
            frames: self.frames,
            padded_samples,
        })
    }
}

impl<W: Write> Drop for StreamWriter<W> {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(err) = self.finish() {
                warn!("failed to finish stream on drop: {err}");
            }
        }
    }
}
