use std::io::Write;

use tracing::trace;

use super::Frame;
use crate::prelude::*;

/// Writes frames to a byte sink.
pub struct FrameWriter<W: Write> {
    sink: W,
    frames: u64,
    bytes: u64,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(sink: W) -> Self {
        FrameWriter {
            sink,
            frames: 0,
            bytes: 0,
        }
    }

    /// # Errors
    /// On I/O errors from the sink.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.sink.write_all(&frame.header.to_bytes())?;
        self.sink.write_all(&frame.payload)?;
        self.frames += 1;
        self.bytes += frame.len() as u64;
        trace!(frames = self.frames, bytes = self.bytes, "wrote frame");
        Ok(())
    }

    /// # Errors
    /// On I/O errors from the sink.
    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }

    /// Frames written so far.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn get_ref(&self) -> &W {
        &self.sink
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::formats::{Driver, FormatParams, Mark5B};
    use crate::framing::FrameReader;

    #[test]
    fn written_frames_read_back() {
        let driver = Mark5B::default();
        let params = FormatParams {
            nchan: Some(2),
            ref_mjd: Some(57_000),
            ..FormatParams::default()
        };
        let header = driver
            .parse_header(&hex::decode("eddeadab000000000907448200000000").unwrap())
            .unwrap();
        let info = driver.info(&header, &params).unwrap();
        let frame = Frame::new(header, info, vec![0x33; 10_000]).unwrap();

        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(&frame).unwrap();
        writer.write_frame(&frame).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.frames(), 2);
        assert_eq!(writer.bytes(), 20_032);

        let bytes = writer.into_inner();
        let mut reader = FrameReader::new(
            Cursor::new(bytes),
            std::sync::Arc::new(Mark5B::default()),
            params,
        )
        .unwrap();
        assert_eq!(reader.next_frame().unwrap().unwrap(), frame);
        assert_eq!(reader.next_frame().unwrap().unwrap(), frame);
        assert!(reader.next_frame().unwrap().is_none());
    }
}
