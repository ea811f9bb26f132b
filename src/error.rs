#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Not enough bytes")]
    NotEnoughData { actual: usize, minimum: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A header failed its sync or consistency checks.
    #[error("Invalid frame: {0}")]
    Format(String),

    /// No driver is registered under the requested name.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The source ended strictly inside a frame.
    #[error("Truncated frame at offset {offset}: expected {expected} bytes, got {actual}")]
    TruncatedFrame {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    /// Sample block shape does not match the stream. Shapes are (channels, components).
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    Shape {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// Strict read ran past the end of the data.
    #[error("End of data at sample {offset}")]
    Eof { offset: u64 },

    /// Strict read hit a missing or invalid frame.
    #[error("Missing or invalid frame {frame}")]
    Gap { frame: u64 },

    #[error("Unsupported quantization: {0}")]
    Quantization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid seek to sample {0}")]
    InvalidSeek(i64),

    /// Frame rate was not provided and could not be determined from the data.
    #[error("Unknown frame rate")]
    UnknownFrameRate,

    #[error("Invalid format descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
