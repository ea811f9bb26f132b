#![doc = include_str!("../README.md")]

mod error;

pub mod formats;
pub mod framing;
pub mod quantization;
pub mod source;
pub mod stream;

pub use error::{Error, Result};
pub use formats::Registry;
pub use quantization::{Coding, Quantization};
pub use stream::{
    ReadBlock, ReadPolicy, SampleStream, SeekTarget, StreamOptions, StreamWriter, WriterOptions,
};

pub(crate) mod prelude {
    pub use crate::error::{Error, Result};
}
