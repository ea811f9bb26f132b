//! Formats described entirely by a [Descriptor].
//!
//! The header layout may declare any of the fields `sync`, `seconds`, `frame_nr`,
//! `thread_id`, `invalid` and `frame_length`; missing fields read as zero. A `sync`
//! field must hold its declared default. When the frame size comes from headers,
//! `frame_length` times the descriptor's `length_unit` gives the frame size in bytes.
use std::sync::Arc;

use super::{
    BinaryHeader, Descriptor, Driver, FormatParams, FrameInfo, FrameSize, FrameTime, Header,
    HeaderLayout,
};
use crate::prelude::*;

#[derive(Debug)]
pub struct Generic {
    descriptor: Descriptor,
    layout: Arc<HeaderLayout>,
    header_len: usize,
}

impl Generic {
    /// # Errors
    /// [Error::Config] if the descriptor lacks a fixed header size or a valid layout.
    pub fn new(descriptor: Descriptor) -> Result<Self> {
        let layout = descriptor
            .layout
            .clone()
            .ok_or_else(|| Error::Config(format!("{} has no header layout", descriptor.name)))?;
        layout.validate()?;
        let FrameSize::Fixed(header_len) = descriptor.header_size else {
            return Err(Error::Config(format!(
                "{} must have a fixed header size",
                descriptor.name
            )));
        };
        if layout.len() != header_len {
            return Err(Error::Config(format!(
                "{} layout is {} bytes but the header is {header_len}",
                descriptor.name,
                layout.len()
            )));
        }
        match descriptor.frame_size {
            FrameSize::Fixed(frame) if frame <= header_len => {
                return Err(Error::Config(format!(
                    "{} frames of {frame} bytes leave no payload",
                    descriptor.name
                )));
            }
            FrameSize::Header if !layout.has("frame_length") => {
                return Err(Error::Config(format!(
                    "{} takes its frame size from headers but has no frame_length field",
                    descriptor.name
                )));
            }
            _ => {}
        }
        if let Some(quant) = &descriptor.quantization {
            quant.validate()?;
        }
        Ok(Generic {
            descriptor,
            layout: Arc::new(layout),
            header_len,
        })
    }

    /// # Errors
    /// [Error::Descriptor] for malformed JSON, otherwise as [Self::new].
    pub fn from_json(json: &str) -> Result<Self> {
        Self::new(serde_json::from_str(json)?)
    }
}

impl Driver for Generic {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn min_header_len(&self) -> usize {
        self.header_len
    }

    fn header_len(&self, _prefix: &[u8]) -> Result<usize> {
        Ok(self.header_len)
    }

    fn check_sync(&self, buf: &[u8]) -> bool {
        if let Some(sync) = &self.descriptor.sync {
            if !buf.starts_with(sync) {
                return false;
            }
        }
        match self.layout.field("sync") {
            Some(field) => self
                .layout
                .words_from_bytes(buf)
                .and_then(|words| self.layout.get(&words, "sync"))
                .is_ok_and(|value| value == field.default),
            None => true,
        }
    }

    fn parse_header(&self, buf: &[u8]) -> Result<Header> {
        let header = BinaryHeader::from_bytes(self.layout.clone(), buf)?;
        if !self.check_sync(buf) {
            return Err(Error::Format(format!(
                "{} sync pattern mismatch",
                self.descriptor.name
            )));
        }
        Ok(Header::Binary(header))
    }

    fn info(&self, header: &Header, params: &FormatParams) -> Result<FrameInfo> {
        let h = header.binary()?;
        let payload_len = match self.descriptor.frame_size {
            FrameSize::Fixed(frame) => frame - self.header_len,
            FrameSize::Header => usize::try_from(h.get("frame_length")?)
                .ok()
                .and_then(|len| len.checked_mul(self.descriptor.length_unit))
                .and_then(|len| len.checked_sub(self.header_len))
                .filter(|len| *len > 0)
                .ok_or_else(|| {
                    Error::Format(format!(
                        "{} frame length is out of range",
                        self.descriptor.name
                    ))
                })?,
        };
        let nchan = self
            .descriptor
            .nchan
            .or(params.nchan)
            .ok_or_else(|| Error::Config(format!("{} needs a channel count", self.name())))?;
        let quantization = self
            .descriptor
            .quantization
            .or(params.quantization)
            .ok_or_else(|| Error::Config(format!("{} needs a quantization", self.name())))?;

        Ok(FrameInfo {
            time: FrameTime::new(h.get_or("seconds", 0) as i64, h.get_or("frame_nr", 0)),
            thread_id: h.get_or("thread_id", 0) as u16,
            invalid: h.get_or("invalid", 0) != 0,
            nchan,
            quantization,
            payload_len,
            valid_samples: None,
        })
    }

    fn build_header(&self, info: &FrameInfo, _params: &FormatParams) -> Result<Header> {
        let mut h = BinaryHeader::new(self.layout.clone());
        match self.descriptor.frame_size {
            FrameSize::Fixed(frame) if frame - self.header_len != info.payload_len => {
                return Err(Error::Format(format!(
                    "{} payloads are {} bytes, got {}",
                    self.name(),
                    frame - self.header_len,
                    info.payload_len
                )));
            }
            FrameSize::Fixed(_) => {}
            FrameSize::Header => {
                let frame = info.payload_len + self.header_len;
                let unit = self.descriptor.length_unit.max(1);
                if frame % unit != 0 {
                    return Err(Error::Format(format!(
                        "frame of {frame} bytes is not a multiple of {unit}"
                    )));
                }
                h.set("frame_length", (frame / unit) as u64)?;
            }
        }
        let seconds = u64::try_from(info.time.seconds)
            .map_err(|_| Error::Format(format!("negative time {}", info.time.seconds)))?;
        h.set_if_present("seconds", seconds)?;
        h.set_if_present("frame_nr", info.time.frame_nr)?;
        h.set_if_present("thread_id", u64::from(info.thread_id))?;
        h.set_if_present("invalid", u64::from(info.invalid))?;

        let bytes = h.to_bytes();
        if !self.check_sync(&bytes) {
            return Err(Error::Config(format!(
                "{} layout defaults do not produce its sync pattern",
                self.name()
            )));
        }
        Ok(Header::Binary(h))
    }
}
