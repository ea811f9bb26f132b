//! Frames and frame-level I/O.
mod reader;
mod synchronizer;
mod writer;

pub use reader::{FrameReader, ReaderState};
pub use synchronizer::{Loc, Synchronizer, DEFAULT_MAX_SEARCH};
pub use writer::FrameWriter;

use std::io::{ErrorKind, Read};

use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::formats::{FrameInfo, Header};
use crate::prelude::*;
use crate::quantization::{decode_payload, CodecSet};

/// One header and its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Header,
    pub info: FrameInfo,
    pub payload: Vec<u8>,
}

impl Frame {
    /// # Errors
    /// [Error::Format] if the payload length differs from the header's.
    pub fn new(header: Header, info: FrameInfo, payload: Vec<u8>) -> Result<Self> {
        if payload.len() != info.payload_len {
            return Err(Error::Format(format!(
                "payload is {} bytes but the header declares {}",
                payload.len(),
                info.payload_len
            )));
        }
        Ok(Frame {
            header,
            info,
            payload,
        })
    }

    /// Total frame length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.header.len() + self.payload.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.header.to_bytes();
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode the payload into a (time, channel, component) block.
    ///
    /// # Errors
    /// If the quantization is unsupported or the payload does not hold whole samples.
    pub fn decode(&self, codecs: &CodecSet) -> Result<Array3<f32>> {
        let codec = codecs.get(&self.info.quantization)?;
        decode_payload(
            &codec,
            &self.info.quantization,
            self.info.nchan,
            &self.payload,
        )
    }
}

/// Location of a sample as (frame index, sample within frame).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub frame: u64,
    pub sample: usize,
}

impl Position {
    #[must_use]
    pub fn from_offset(offset: u64, samples_per_frame: usize) -> Self {
        let spf = samples_per_frame as u64;
        Position {
            frame: offset / spf,
            sample: (offset % spf) as usize,
        }
    }

    #[must_use]
    pub fn to_offset(&self, samples_per_frame: usize) -> u64 {
        self.frame * samples_per_frame as u64 + self.sample as u64
    }
}

/// Fill `buf` as far as the reader allows, returning the number of bytes read.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(Error::Io(err)),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_offsets() {
        let pos = Position::from_offset(250, 100);
        assert_eq!(
            pos,
            Position {
                frame: 2,
                sample: 50
            }
        );
        assert_eq!(pos.to_offset(100), 250);
        assert_eq!(Position::from_offset(0, 7).to_offset(7), 0);
    }

    #[test]
    fn read_full_stops_at_eof() {
        let mut src: &[u8] = &[1, 2, 3];
        let mut buf = [0u8; 5];
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3, 0, 0]);
    }
}
