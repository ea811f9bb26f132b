//! Sample quantization.
//!
//! Converts between packed n-bit codes and `f32` sample levels. Codes are packed
//! least-significant bit first within each byte, which is the same as first-sample-lowest
//! within little-endian 32-bit words as used by VDIF and Mark 5B. Samples are ordered by
//! time, then channel, then component (real before imaginary).
//!
//! Widths of 1, 2 and 4 bits decode through a 256-entry per-byte lookup table, built once
//! per (width, coding) by [CodecSet]. Wider codes are decoded arithmetically.
use std::collections::HashMap;
use std::sync::Arc;

use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// High level for optimally spaced 2-bit samples, in units of the low level.
pub const OPTIMAL_2BIT_HIGH: f32 = 3.316_505;

/// How an n-bit code maps onto a signed level.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Coding {
    /// Code 0 is the most negative level.
    OffsetBinary,
    /// Code 0 is the smallest non-negative level; the top bit is the sign.
    TwosComplement,
    /// Bit 0 is the sign (1 is positive) and bit 1 the magnitude (1 is high). 1 and 2 bit only.
    SignMagnitude,
}

/// Quantization parameters of a payload.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quantization {
    /// Bits per component.
    pub bits: u8,
    pub complex: bool,
    pub coding: Coding,
}

impl Quantization {
    pub const SUPPORTED_BITS: [u8; 6] = [1, 2, 4, 8, 16, 32];

    /// Create validated quantization parameters.
    ///
    /// # Errors
    /// [Error::Quantization] for unsupported bit widths or coding combinations.
    pub fn new(bits: u8, complex: bool, coding: Coding) -> Result<Self> {
        let quant = Quantization {
            bits,
            complex,
            coding,
        };
        quant.validate()?;
        Ok(quant)
    }

    /// # Errors
    /// [Error::Quantization] for unsupported bit widths or coding combinations.
    pub fn validate(&self) -> Result<()> {
        if !Self::SUPPORTED_BITS.contains(&self.bits) {
            return Err(Error::Quantization(format!(
                "{} bits per sample is not supported",
                self.bits
            )));
        }
        if self.coding == Coding::SignMagnitude && self.bits > 2 {
            return Err(Error::Quantization(format!(
                "sign-magnitude coding needs 1 or 2 bits, got {}",
                self.bits
            )));
        }
        Ok(())
    }

    /// 1 for real samples, 2 for complex.
    #[must_use]
    pub fn components(&self) -> usize {
        if self.complex {
            2
        } else {
            1
        }
    }

    /// Number of complete samples per channel held by `payload_len` bytes.
    ///
    /// # Errors
    /// [Error::Format] if the payload does not hold a whole number of samples.
    pub fn samples_in(&self, payload_len: usize, nchan: usize) -> Result<usize> {
        let sample_bits = self.bits as usize * self.components() * nchan;
        if sample_bits == 0 || (payload_len * 8) % sample_bits != 0 {
            return Err(Error::Format(format!(
                "payload of {payload_len} bytes does not hold whole samples of {sample_bits} bits"
            )));
        }
        Ok(payload_len * 8 / sample_bits)
    }

    /// Number of payload bytes needed for `samples` samples per channel.
    ///
    /// # Errors
    /// [Error::Format] if the samples do not fill a whole number of bytes.
    pub fn payload_len(&self, samples: usize, nchan: usize) -> Result<usize> {
        let bits = samples * self.bits as usize * self.components() * nchan;
        if bits % 8 != 0 {
            return Err(Error::Format(format!(
                "{samples} samples of {nchan} channels do not fill whole bytes"
            )));
        }
        Ok(bits / 8)
    }
}

/// Level for `code` at `bits` wide with `coding`.
fn level(bits: u8, coding: Coding, code: u32) -> f32 {
    match (bits, coding) {
        (1, _) => {
            if code & 1 == 1 {
                1.0
            } else {
                -1.0
            }
        }
        (2, Coding::SignMagnitude) => {
            let mag = if code & 0b10 == 0 { 1.0 } else { OPTIMAL_2BIT_HIGH };
            if code & 0b01 == 1 {
                mag
            } else {
                -mag
            }
        }
        (2, Coding::OffsetBinary) => {
            [-OPTIMAL_2BIT_HIGH, -1.0, 1.0, OPTIMAL_2BIT_HIGH][(code & 0b11) as usize]
        }
        (_, Coding::TwosComplement) => {
            // twos-complement is offset binary with the sign bit flipped
            level(bits, Coding::OffsetBinary, code ^ (1 << (bits - 1)))
        }
        (_, _) => {
            let offset = 1i64 << (bits - 1);
            (i64::from(code) - offset) as f32
        }
    }
}

/// Decoder/encoder for one (width, coding) combination.
///
/// Complex samples use the same codec; components are simply interleaved codes.
#[derive(Debug)]
pub struct Codec {
    bits: u8,
    coding: Coding,
    // all levels, indexed by code; only for narrow widths
    levels: Vec<f32>,
    // decoded values for each byte value, lowest code first
    lut: Option<Box<[[f32; 8]; 256]>>,
}

impl Codec {
    fn new(bits: u8, coding: Coding) -> Self {
        if bits > 4 {
            return Codec {
                bits,
                coding,
                levels: Vec::new(),
                lut: None,
            };
        }

        let levels: Vec<f32> = (0..1u32 << bits).map(|c| level(bits, coding, c)).collect();
        let per_byte = 8 / bits as usize;
        let mask = (1u32 << bits) - 1;
        let mut lut = Box::new([[0f32; 8]; 256]);
        for (byte, entry) in lut.iter_mut().enumerate() {
            for (i, slot) in entry.iter_mut().take(per_byte).enumerate() {
                let code = (byte as u32 >> (i * bits as usize)) & mask;
                *slot = levels[code as usize];
            }
        }
        Codec {
            bits,
            coding,
            levels,
            lut: Some(lut),
        }
    }

    #[must_use]
    pub fn bits(&self) -> u8 {
        self.bits
    }

    #[must_use]
    pub fn coding(&self) -> Coding {
        self.coding
    }

    /// Number of payload bytes holding `codes` codes.
    #[must_use]
    pub fn bytes_for(&self, codes: usize) -> usize {
        (codes * self.bits as usize).div_ceil(8)
    }

    /// Decode `out.len()` codes from `payload`.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if `payload` holds fewer than `out.len()` codes.
    pub fn decode(&self, payload: &[u8], out: &mut [f32]) -> Result<()> {
        let need = self.bytes_for(out.len());
        if payload.len() < need {
            return Err(Error::NotEnoughData {
                actual: payload.len(),
                minimum: need,
            });
        }

        if let Some(lut) = &self.lut {
            let per_byte = 8 / self.bits as usize;
            for (chunk, byte) in out.chunks_mut(per_byte).zip(payload) {
                let n = chunk.len();
                chunk.copy_from_slice(&lut[*byte as usize][..n]);
            }
            return Ok(());
        }

        let twos = self.coding == Coding::TwosComplement;
        match self.bits {
            8 => {
                for (v, b) in out.iter_mut().zip(payload) {
                    *v = if twos {
                        f32::from(*b as i8)
                    } else {
                        f32::from(*b) - 128.0
                    };
                }
            }
            16 => {
                for (v, b) in out.iter_mut().zip(payload.chunks_exact(2)) {
                    let code = u16::from_le_bytes([b[0], b[1]]);
                    *v = if twos {
                        f32::from(code as i16)
                    } else {
                        f32::from(code) - 32768.0
                    };
                }
            }
            _ => {
                for (v, b) in out.iter_mut().zip(payload.chunks_exact(4)) {
                    let code = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                    *v = if twos {
                        code as i32 as f32
                    } else {
                        (i64::from(code) - (1i64 << 31)) as f32
                    };
                }
            }
        }
        Ok(())
    }

    /// Code of the level nearest `value`, ties away from zero, clipped to range.
    #[must_use]
    pub fn quantize(&self, value: f32) -> u32 {
        let value = if value.is_nan() { 0.0 } else { value };

        if !self.levels.is_empty() {
            let mut best = 0usize;
            for (code, lvl) in self.levels.iter().enumerate() {
                let cur = self.levels[best];
                let (d_new, d_cur) = ((lvl - value).abs(), (cur - value).abs());
                let closer = d_new < d_cur
                    || (d_new == d_cur
                        && (lvl.abs() > cur.abs() || (lvl.abs() == cur.abs() && *lvl > cur)));
                if closer {
                    best = code;
                }
            }
            return best as u32;
        }

        let half = 1i64 << (self.bits - 1);
        let n = (f64::from(value).round() as i64).clamp(-half, half - 1);
        let mask = if self.bits == 32 {
            u32::MAX
        } else {
            (1u32 << self.bits) - 1
        };
        match self.coding {
            Coding::TwosComplement => (n as u32) & mask,
            _ => (n + half) as u32,
        }
    }

    /// Encode `values` into `out`, which must be zeroed and hold at least
    /// [Self::bytes_for] `values.len()` bytes.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if `out` is too short.
    pub fn encode(&self, values: &[f32], out: &mut [u8]) -> Result<()> {
        let need = self.bytes_for(values.len());
        if out.len() < need {
            return Err(Error::NotEnoughData {
                actual: out.len(),
                minimum: need,
            });
        }
        match self.bits {
            1 | 2 | 4 => {
                let per_byte = 8 / self.bits as usize;
                for (i, v) in values.iter().enumerate() {
                    let shift = (i % per_byte) * self.bits as usize;
                    out[i / per_byte] |= (self.quantize(*v) << shift) as u8;
                }
            }
            8 => {
                for (b, v) in out.iter_mut().zip(values) {
                    *b = self.quantize(*v) as u8;
                }
            }
            16 => {
                for (b, v) in out.chunks_exact_mut(2).zip(values) {
                    b.copy_from_slice(&(self.quantize(*v) as u16).to_le_bytes());
                }
            }
            _ => {
                for (b, v) in out.chunks_exact_mut(4).zip(values) {
                    b.copy_from_slice(&self.quantize(*v).to_le_bytes());
                }
            }
        }
        Ok(())
    }
}

/// All codecs for the supported (width, coding) combinations, built once.
#[derive(Debug)]
pub struct CodecSet {
    codecs: HashMap<(u8, Coding), Arc<Codec>>,
}

impl Default for CodecSet {
    fn default() -> Self {
        let mut codecs = HashMap::new();
        for bits in Quantization::SUPPORTED_BITS {
            for coding in [
                Coding::OffsetBinary,
                Coding::TwosComplement,
                Coding::SignMagnitude,
            ] {
                if Quantization::new(bits, false, coding).is_ok() {
                    codecs.insert((bits, coding), Arc::new(Codec::new(bits, coding)));
                }
            }
        }
        CodecSet { codecs }
    }
}

impl CodecSet {
    /// # Errors
    /// [Error::Quantization] if `quant` is not supported.
    pub fn get(&self, quant: &Quantization) -> Result<Arc<Codec>> {
        self.codecs
            .get(&(quant.bits, quant.coding))
            .cloned()
            .ok_or_else(|| Error::Quantization(format!("no codec for {quant:?}")))
    }
}

/// Decode a full payload into a (time, channel, component) block.
///
/// # Errors
/// If the payload does not hold whole samples for `nchan` channels.
pub fn decode_payload(
    codec: &Codec,
    quant: &Quantization,
    nchan: usize,
    payload: &[u8],
) -> Result<Array3<f32>> {
    let nsamp = quant.samples_in(payload.len(), nchan)?;
    let ncomp = quant.components();
    let mut values = vec![0f32; nsamp * nchan * ncomp];
    codec.decode(payload, &mut values)?;
    Array3::from_shape_vec((nsamp, nchan, ncomp), values)
        .map_err(|e| Error::Format(format!("decoded payload shape: {e}")))
}

/// Encode a (time, channel, component) block into payload bytes.
///
/// # Errors
/// If the block does not fill a whole number of bytes.
pub fn encode_payload(
    codec: &Codec,
    quant: &Quantization,
    block: ArrayView3<f32>,
) -> Result<Vec<u8>> {
    let (nsamp, nchan, ncomp) = block.dim();
    if ncomp != quant.components() {
        return Err(Error::Shape {
            expected: (nchan, quant.components()),
            actual: (nchan, ncomp),
        });
    }
    let values: Vec<f32> = block.iter().copied().collect();
    let mut out = vec![0u8; quant.payload_len(nsamp, nchan)?];
    codec.encode(&values, &mut out)?;
    Ok(out)
}
