//! Mark 5B.
//!
//! Frames are 10016 bytes: a 16-byte header of four little-endian 32-bit words followed
//! by 10000 bytes of payload. Times are BCD-coded and only give the MJD modulo 1000, so
//! the full date is resolved against a reference MJD. Channel count and sample width are
//! not recorded and must come from the stream parameters.
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crc::{Crc, CRC_16_UMTS};
use tracing::trace;

use super::{
    BinaryHeader, BitField, Descriptor, Driver, Endian, FormatParams, FrameInfo, FrameSize,
    FrameTime, Header, HeaderLayout, SECONDS_PER_DAY, UNIX_EPOCH_MJD,
};
use crate::prelude::*;
use crate::quantization::{Coding, Quantization};

pub const SYNC: u32 = 0xABAD_DEED;
pub const HEADER_LEN: usize = 16;
pub const PAYLOAD_LEN: usize = 10_000;
pub const FRAME_LEN: usize = HEADER_LEN + PAYLOAD_LEN;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_UMTS);

/// Decode a BCD value.
fn bcd_decode(value: u64) -> Result<u64> {
    let mut out = 0;
    let mut scale = 1;
    let mut rest = value;
    while rest != 0 {
        let digit = rest & 0xf;
        if digit > 9 {
            return Err(Error::Format(format!("{value:#x} is not BCD")));
        }
        out += digit * scale;
        scale *= 10;
        rest >>= 4;
    }
    Ok(out)
}

fn bcd_encode(value: u64) -> u64 {
    let mut out = 0;
    let mut shift = 0;
    let mut rest = value;
    while rest != 0 {
        out |= (rest % 10) << shift;
        shift += 4;
        rest /= 10;
    }
    out
}

/// MJD within 500 days of `ref_mjd` whose last three digits are `jday`.
fn resolve_mjd(jday: i64, ref_mjd: i64) -> i64 {
    let mut mjd = ref_mjd - ref_mjd.rem_euclid(1000) + jday;
    if mjd - ref_mjd > 500 {
        mjd -= 1000;
    } else if ref_mjd - mjd > 500 {
        mjd += 1000;
    }
    mjd
}

fn current_mjd() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    now / SECONDS_PER_DAY + UNIX_EPOCH_MJD
}

#[derive(Debug)]
pub struct Mark5B {
    descriptor: Descriptor,
    layout: Arc<HeaderLayout>,
}

impl Default for Mark5B {
    fn default() -> Self {
        let layout = HeaderLayout::new(
            HEADER_LEN / 4,
            Endian::Little,
            vec![
                BitField::new("sync", 0, 0, 32).with_default(u64::from(SYNC)),
                BitField::new("frame_nr", 1, 0, 15),
                BitField::new("tvg", 1, 15, 1),
                BitField::new("user", 1, 16, 16),
                BitField::new("bcd_seconds", 2, 0, 20),
                BitField::new("bcd_jday", 2, 20, 12),
                BitField::new("crcc", 3, 0, 16),
                BitField::new("bcd_fraction", 3, 16, 16),
            ],
        );
        Mark5B {
            descriptor: Descriptor {
                name: "mark5b".to_string(),
                frame_size: FrameSize::Fixed(FRAME_LEN),
                header_size: FrameSize::Fixed(HEADER_LEN),
                sync: Some(SYNC.to_le_bytes().to_vec()),
                layout: Some(layout.clone()),
                quantization: Some(Quantization {
                    bits: 2,
                    complex: false,
                    coding: Coding::SignMagnitude,
                }),
                nchan: None,
                length_unit: 1,
            },
            layout: Arc::new(layout),
        }
    }
}

impl Mark5B {
    /// CRC-16 of the time code: word 2 and the upper half of word 3.
    fn crc(words: &[u64]) -> u16 {
        let code = (words[2] << 16) | (words[3] >> 16);
        CRC16.checksum(&code.to_be_bytes()[2..])
    }

    /// Whether the header's CRC matches its time code.
    #[must_use]
    pub fn crc_ok(header: &BinaryHeader) -> bool {
        let expected = Self::crc(header.words());
        let actual = header.get_or("crcc", 0) as u16;
        if expected != actual {
            trace!(expected, actual, "Mark 5B CRC mismatch");
        }
        expected == actual
    }
}

impl Driver for Mark5B {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn min_header_len(&self) -> usize {
        HEADER_LEN
    }

    fn header_len(&self, _prefix: &[u8]) -> Result<usize> {
        Ok(HEADER_LEN)
    }

    fn parse_header(&self, buf: &[u8]) -> Result<Header> {
        if !self.check_sync(buf) {
            return Err(Error::Format("Mark 5B sync word mismatch".to_string()));
        }
        let header = BinaryHeader::from_bytes(self.layout.clone(), buf)?;
        // reported, not enforced; many recorders leave it zero
        Self::crc_ok(&header);
        Ok(Header::Binary(header))
    }

    fn info(&self, header: &Header, params: &FormatParams) -> Result<FrameInfo> {
        let h = header.binary()?;
        let nchan = params.nchan.ok_or_else(|| {
            Error::Config("Mark 5B needs the number of channels".to_string())
        })?;
        let quantization = params
            .quantization
            .or(self.descriptor.quantization)
            .ok_or_else(|| Error::Config("Mark 5B needs a quantization".to_string()))?;

        let jday = bcd_decode(h.get("bcd_jday")?)? as i64;
        let seconds_of_day = bcd_decode(h.get("bcd_seconds")?)? as i64;
        bcd_decode(h.get("bcd_fraction")?)?;
        let mjd = resolve_mjd(jday, params.ref_mjd.unwrap_or_else(current_mjd));
        let seconds = (mjd - UNIX_EPOCH_MJD) * SECONDS_PER_DAY + seconds_of_day;

        Ok(FrameInfo {
            time: FrameTime::new(seconds, h.get("frame_nr")?),
            thread_id: 0,
            invalid: false,
            nchan,
            quantization,
            payload_len: PAYLOAD_LEN,
            valid_samples: None,
        })
    }

    fn build_header(&self, info: &FrameInfo, params: &FormatParams) -> Result<Header> {
        if info.payload_len != PAYLOAD_LEN {
            return Err(Error::Format(format!(
                "Mark 5B payloads are {PAYLOAD_LEN} bytes, got {}",
                info.payload_len
            )));
        }
        let days = info.time.seconds.div_euclid(SECONDS_PER_DAY);
        let seconds_of_day = info.time.seconds.rem_euclid(SECONDS_PER_DAY);
        let mjd = days + UNIX_EPOCH_MJD;
        // 0.1 ms units
        let fraction = match params.frame_rate {
            Some(rate) => ((info.time.frame_nr as f64 / rate * 1e4).round() as u64).min(9999),
            None => 0,
        };

        let mut h = BinaryHeader::new(self.layout.clone());
        h.set("frame_nr", info.time.frame_nr)?;
        h.set("bcd_jday", bcd_encode(mjd.rem_euclid(1000) as u64))?;
        h.set("bcd_seconds", bcd_encode(seconds_of_day as u64))?;
        h.set("bcd_fraction", bcd_encode(fraction))?;
        let crc = Self::crc(h.words());
        h.set("crcc", u64::from(crc))?;
        Ok(Header::Binary(h))
    }

    fn is_plausible(&self, info: &FrameInfo) -> bool {
        info.samples_per_frame().is_ok() && info.time.seconds >= 0
    }
}
