//! PSRDADA.
//!
//! Each frame is an ASCII header of `KEY value` lines, NUL padded to `HDR_SIZE` bytes,
//! followed by `FILE_SIZE` bytes of two's complement samples. Frame numbers count
//! payloads since `UTC_START` and do not restart each second.
use tracing::trace;

use super::{
    civil_from_days, days_from_civil, Descriptor, Driver, FormatParams, FrameInfo, FrameSize,
    FrameTime, Header, TextHeader, SECONDS_PER_DAY,
};
use crate::prelude::*;
use crate::quantization::{Coding, Quantization};

/// Default header size, also the amount read to find `HDR_SIZE`.
pub const DEFAULT_HEADER_LEN: usize = 4096;
const VERSION_KEY: &[u8] = b"HDR_VERSION";

fn numbers(s: &str, sep: char) -> Option<Vec<u32>> {
    s.split(sep).map(|x| x.parse().ok()).collect()
}

/// Parse `YYYY-MM-DD-hh:mm:ss` into Unix seconds.
fn parse_utc_start(value: &str) -> Result<i64> {
    let invalid = || Error::Format(format!("invalid UTC_START {value:?}"));
    let (date, time) = value
        .get(..10)
        .zip(value.get(11..))
        .ok_or_else(invalid)?;
    let date = numbers(date, '-').filter(|v| v.len() == 3).ok_or_else(invalid)?;
    let time = numbers(time, ':').filter(|v| v.len() == 3).ok_or_else(invalid)?;
    let (year, month, day) = (i64::from(date[0]), date[1], date[2]);
    if !(1..=12).contains(&month) || time[0] > 23 || time[1] > 59 || time[2] > 60 {
        return Err(invalid());
    }
    let days = days_from_civil(year, month, day);
    // rejects days past the end of the month
    if civil_from_days(days) != (year, month, day) {
        return Err(invalid());
    }
    Ok(days * SECONDS_PER_DAY
        + i64::from(time[0]) * 3600
        + i64::from(time[1]) * 60
        + i64::from(time[2]))
}

fn format_utc_start(seconds: i64) -> String {
    let (year, month, day) = civil_from_days(seconds.div_euclid(SECONDS_PER_DAY));
    let sod = seconds.rem_euclid(SECONDS_PER_DAY);
    format!(
        "{year:04}-{month:02}-{day:02}-{:02}:{:02}:{:02}",
        sod / 3600,
        sod % 3600 / 60,
        sod % 60
    )
}

#[derive(Debug)]
pub struct Dada {
    descriptor: Descriptor,
}

impl Default for Dada {
    fn default() -> Self {
        Dada {
            descriptor: Descriptor {
                name: "dada".to_string(),
                frame_size: FrameSize::Header,
                header_size: FrameSize::Header,
                sync: None,
                layout: None,
                quantization: None,
                nchan: None,
                length_unit: 1,
            },
        }
    }
}

impl Driver for Dada {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn min_header_len(&self) -> usize {
        DEFAULT_HEADER_LEN
    }

    fn header_len(&self, prefix: &[u8]) -> Result<usize> {
        let size: usize = TextHeader::parse(prefix).parse_value("HDR_SIZE")?;
        if size == 0 {
            return Err(Error::Format("HDR_SIZE is zero".to_string()));
        }
        Ok(size)
    }

    fn check_sync(&self, buf: &[u8]) -> bool {
        buf.windows(VERSION_KEY.len()).any(|w| w == VERSION_KEY)
    }

    fn parse_header(&self, buf: &[u8]) -> Result<Header> {
        let len = self.header_len(buf)?;
        if buf.len() < len {
            return Err(Error::NotEnoughData {
                actual: buf.len(),
                minimum: len,
            });
        }
        if !self.check_sync(&buf[..len]) {
            return Err(Error::Format("DADA header has no HDR_VERSION".to_string()));
        }
        Ok(Header::Text(TextHeader::parse(&buf[..len])))
    }

    fn info(&self, header: &Header, _params: &FormatParams) -> Result<FrameInfo> {
        let h = header.text()?;
        let bits: u8 = h.parse_value("NBIT")?;
        let complex = match h.parse_or::<u8>("NDIM", 1)? {
            1 => false,
            2 => true,
            ndim => return Err(Error::Format(format!("unsupported NDIM {ndim}"))),
        };
        let quantization = Quantization::new(bits, complex, Coding::TwosComplement)?;
        let nchan = h.parse_or::<usize>("NPOL", 1)? * h.parse_or::<usize>("NCHAN", 1)?;
        let payload_len: usize = h.parse_value("FILE_SIZE")?;
        if payload_len == 0 {
            return Err(Error::Format("FILE_SIZE is zero".to_string()));
        }
        let offset: u64 = h.parse_or("OBS_OFFSET", 0)?;
        let seconds = parse_utc_start(h.get("UTC_START").unwrap_or_default())?;
        let valid_samples = match h.get("VALID_BYTES") {
            Some(_) => {
                let valid: usize = h.parse_value("VALID_BYTES")?;
                Some(quantization.samples_in(valid.min(payload_len), nchan)?)
            }
            None => None,
        };

        Ok(FrameInfo {
            time: FrameTime::new(seconds, offset / payload_len as u64),
            thread_id: 0,
            invalid: false,
            nchan,
            quantization,
            payload_len,
            valid_samples,
        })
    }

    fn build_header(&self, info: &FrameInfo, params: &FormatParams) -> Result<Header> {
        if info.quantization.coding != Coding::TwosComplement {
            return Err(Error::Quantization(format!(
                "DADA samples are two's complement, not {:?}",
                info.quantization.coding
            )));
        }
        let quant = &info.quantization;
        let mut cards = vec![
            ("HDR_VERSION", "1.0".to_string()),
            ("HDR_SIZE", DEFAULT_HEADER_LEN.to_string()),
            ("UTC_START", format_utc_start(info.time.seconds)),
            (
                "OBS_OFFSET",
                (info.time.frame_nr * info.payload_len as u64).to_string(),
            ),
            ("FILE_SIZE", info.payload_len.to_string()),
            ("NBIT", quant.bits.to_string()),
            ("NDIM", quant.components().to_string()),
            ("NPOL", "1".to_string()),
            ("NCHAN", info.nchan.to_string()),
        ];
        if let Some(rate) = params.frame_rate {
            let tsamp = 1e6 / (rate * info.samples_per_frame()? as f64);
            cards.push(("TSAMP", tsamp.to_string()));
        }
        if let Some(valid) = info.valid_samples {
            cards.push(("VALID_BYTES", quant.payload_len(valid, info.nchan)?.to_string()));
        }
        let cards = cards
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        trace!(frame_nr = info.time.frame_nr, "built DADA header");
        Ok(Header::Text(TextHeader::new(DEFAULT_HEADER_LEN, cards)?))
    }

    /// From `TSAMP`, the sample interval in microseconds.
    fn frame_rate(&self, header: &Header, info: &FrameInfo) -> Option<f64> {
        let tsamp: f64 = header.text().ok()?.parse_value("TSAMP").ok()?;
        let samples = info.samples_per_frame().ok()?;
        (tsamp > 0.0).then(|| 1e6 / (tsamp * samples as f64))
    }

    fn wraps_per_second(&self) -> bool {
        false
    }
}
