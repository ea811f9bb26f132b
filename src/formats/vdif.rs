//! VLBI Data Interchange Format.
//!
//! Headers are 8 little-endian 32-bit words, or 4 for legacy headers. The frame length
//! is declared by each header in units of 8 bytes and includes the header. There is no
//! sync word, so frames are recognized by header consistency alone.
use std::sync::Arc;

use tracing::trace;

use super::{
    civil_from_days, days_from_civil, BinaryHeader, BitField, Descriptor, Driver, Endian,
    FormatParams, FrameInfo, FrameSize, FrameTime, Header, HeaderLayout, SECONDS_PER_DAY,
};
use crate::prelude::*;
use crate::quantization::{Coding, Quantization};

pub const HEADER_LEN: usize = 32;
pub const LEGACY_HEADER_LEN: usize = 16;
const LENGTH_UNIT: usize = 8;
const MAX_REF_EPOCH: u64 = 63;

fn fields() -> Vec<BitField> {
    vec![
        BitField::new("seconds", 0, 0, 30),
        BitField::new("legacy", 0, 30, 1),
        BitField::new("invalid", 0, 31, 1),
        BitField::new("frame_nr", 1, 0, 24),
        BitField::new("ref_epoch", 1, 24, 6),
        BitField::new("frame_length", 2, 0, 24),
        BitField::new("lg2_nchan", 2, 24, 5),
        BitField::new("vdif_version", 2, 29, 3),
        BitField::new("station_id", 3, 0, 16),
        BitField::new("thread_id", 3, 16, 10),
        BitField::new("bits_per_sample", 3, 26, 5),
        BitField::new("complex", 3, 31, 1),
    ]
}

/// Unix seconds at the start of VDIF reference epoch `n` (half-years since 2000).
fn ref_epoch_seconds(n: u64) -> i64 {
    let year = 2000 + (n / 2) as i64;
    let month = if n % 2 == 0 { 1 } else { 7 };
    days_from_civil(year, month, 1) * SECONDS_PER_DAY
}

/// Latest reference epoch at or before `seconds`.
fn ref_epoch_for(seconds: i64) -> Result<u64> {
    let (year, month, _) = civil_from_days(seconds.div_euclid(SECONDS_PER_DAY));
    let n = (year - 2000) * 2 + i64::from(month >= 7);
    if !(0..=MAX_REF_EPOCH as i64).contains(&n) {
        return Err(Error::Format(format!(
            "time {seconds} is outside the VDIF reference epochs"
        )));
    }
    Ok(n as u64)
}

#[derive(Debug)]
pub struct Vdif {
    descriptor: Descriptor,
    layout: Arc<HeaderLayout>,
    legacy_layout: Arc<HeaderLayout>,
}

impl Default for Vdif {
    fn default() -> Self {
        let mut standard = fields();
        standard.push(BitField::new("edv", 4, 24, 8));
        let layout = HeaderLayout::new(HEADER_LEN / 4, Endian::Little, standard);
        let legacy_layout = HeaderLayout::new(LEGACY_HEADER_LEN / 4, Endian::Little, fields());
        Vdif {
            descriptor: Descriptor {
                name: "vdif".to_string(),
                frame_size: FrameSize::Header,
                header_size: FrameSize::Header,
                sync: None,
                layout: Some(layout.clone()),
                quantization: None,
                nchan: None,
                length_unit: LENGTH_UNIT,
            },
            layout: Arc::new(layout),
            legacy_layout: Arc::new(legacy_layout),
        }
    }
}

impl Driver for Vdif {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn min_header_len(&self) -> usize {
        4
    }

    fn header_len(&self, prefix: &[u8]) -> Result<usize> {
        if prefix.len() < 4 {
            return Err(Error::NotEnoughData {
                actual: prefix.len(),
                minimum: 4,
            });
        }
        if prefix[3] & 0x40 != 0 {
            Ok(LEGACY_HEADER_LEN)
        } else {
            Ok(HEADER_LEN)
        }
    }

    fn parse_header(&self, buf: &[u8]) -> Result<Header> {
        let layout = if self.header_len(buf)? == LEGACY_HEADER_LEN {
            self.legacy_layout.clone()
        } else {
            self.layout.clone()
        };
        let header = BinaryHeader::from_bytes(layout, buf)?;
        let frame_len = header.get("frame_length")? as usize * LENGTH_UNIT;
        if frame_len <= header.layout().len() {
            return Err(Error::Format(format!(
                "VDIF frame length {frame_len} does not exceed its header"
            )));
        }
        Ok(Header::Binary(header))
    }

    fn info(&self, header: &Header, _params: &FormatParams) -> Result<FrameInfo> {
        let h = header.binary()?;
        let seconds = ref_epoch_seconds(h.get("ref_epoch")?) + h.get("seconds")? as i64;
        let frame_len = h.get("frame_length")? as usize * LENGTH_UNIT;
        let payload_len = frame_len
            .checked_sub(header.len())
            .ok_or_else(|| Error::Format(format!("VDIF frame length {frame_len} too short")))?;
        let quantization = Quantization::new(
            h.get("bits_per_sample")? as u8 + 1,
            h.get("complex")? == 1,
            Coding::OffsetBinary,
        )?;

        Ok(FrameInfo {
            time: FrameTime::new(seconds, h.get("frame_nr")?),
            thread_id: h.get("thread_id")? as u16,
            invalid: h.get("invalid")? == 1,
            nchan: 1 << h.get("lg2_nchan")?,
            quantization,
            payload_len,
            valid_samples: None,
        })
    }

    fn build_header(&self, info: &FrameInfo, params: &FormatParams) -> Result<Header> {
        if !info.nchan.is_power_of_two() {
            return Err(Error::Format(format!(
                "VDIF needs a power of two channels, got {}",
                info.nchan
            )));
        }
        if info.quantization.coding != Coding::OffsetBinary {
            return Err(Error::Quantization(format!(
                "VDIF samples are offset binary, not {:?}",
                info.quantization.coding
            )));
        }
        let frame_len = info.payload_len + HEADER_LEN;
        if frame_len % LENGTH_UNIT != 0 {
            return Err(Error::Format(format!(
                "VDIF frame length {frame_len} is not a multiple of {LENGTH_UNIT}"
            )));
        }
        let ref_epoch = ref_epoch_for(info.time.seconds)?;

        let mut h = BinaryHeader::new(self.layout.clone());
        h.set("invalid", u64::from(info.invalid))?;
        h.set("seconds", (info.time.seconds - ref_epoch_seconds(ref_epoch)) as u64)?;
        h.set("ref_epoch", ref_epoch)?;
        h.set("frame_nr", info.time.frame_nr)?;
        h.set("frame_length", (frame_len / LENGTH_UNIT) as u64)?;
        h.set("lg2_nchan", u64::from(info.nchan.trailing_zeros()))?;
        h.set("station_id", u64::from(params.station_id.unwrap_or(0)))?;
        h.set("thread_id", u64::from(info.thread_id))?;
        h.set("bits_per_sample", u64::from(info.quantization.bits - 1))?;
        h.set("complex", u64::from(info.quantization.complex))?;
        trace!(ref_epoch, frame_len, thread_id = info.thread_id, "built VDIF header");
        Ok(Header::Binary(h))
    }

    fn is_plausible(&self, info: &FrameInfo) -> bool {
        info.payload_len > 0
            && info.payload_len % LENGTH_UNIT == 0
            && info.samples_per_frame().is_ok()
    }
}
