#![allow(dead_code)]

use std::io::{self, Read, Seek, SeekFrom};

use baseband::quantization::OPTIMAL_2BIT_HIGH;
use baseband::{Quantization, StreamWriter, WriterOptions};
use hifitime::Epoch;
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const START: f64 = 1_400_000_000.0;

pub fn start() -> Epoch {
    Epoch::from_unix_seconds(START)
}

/// Random samples drawn from the 2-bit levels, so they survive encoding unchanged.
pub fn two_bit_block(seed: u64, shape: (usize, usize, usize)) -> Array3<f32> {
    let levels = [-OPTIMAL_2BIT_HIGH, -1.0, 1.0, OPTIMAL_2BIT_HIGH];
    let mut rng = StdRng::seed_from_u64(seed);
    Array3::from_shape_simple_fn(shape, || levels[rng.gen_range(0..4)])
}

/// Random whole numbers in the 8-bit range.
pub fn eight_bit_block(seed: u64, shape: (usize, usize, usize)) -> Array3<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array3::from_shape_simple_fn(shape, || f32::from(rng.gen::<i8>()))
}

/// Encode `block` with a fresh writer and return the bytes.
pub fn write_stream(format: &str, options: WriterOptions, block: &Array3<f32>) -> Vec<u8> {
    let mut writer = StreamWriter::create(Vec::new(), format, options).unwrap();
    writer.write(block.view()).unwrap();
    writer.close().unwrap().sink
}

pub fn vdif_options(
    nchan: usize,
    quantization: Quantization,
    samples_per_frame: usize,
    sample_rate: f64,
) -> WriterOptions {
    WriterOptions::builder()
        .start_time(start())
        .sample_rate(sample_rate)
        .nchan(nchan)
        .quantization(quantization)
        .samples_per_frame(samples_per_frame)
        .build()
}

/// A source that fails the test if it is ever read.
pub struct Untouchable;

impl Read for Untouchable {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        panic!("source was read");
    }
}

impl Seek for Untouchable {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        panic!("source was seeked");
    }
}
