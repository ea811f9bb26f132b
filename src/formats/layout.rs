//! Header bit fields declared as data.
//!
//! A [HeaderLayout] describes a header as a sequence of fixed-width words in a given byte
//! order. Each [BitField] names a run of bits starting at a word. A field may span
//! consecutive words, in which case the words are combined in header byte order: for
//! little-endian layouts the first word is the least significant, for big-endian the most.
use serde::{Deserialize, Serialize};

use crate::prelude::*;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    Little,
    Big,
}

/// A named field of `width` bits starting `bit` bits above the least significant bit of
/// word `word`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BitField {
    pub name: String,
    pub word: usize,
    pub bit: u32,
    pub width: u32,
    /// Value used when building a new header.
    #[serde(default)]
    pub default: u64,
}

impl BitField {
    #[must_use]
    pub fn new(name: &str, word: usize, bit: u32, width: u32) -> Self {
        BitField {
            name: name.to_string(),
            word,
            bit,
            width,
            default: 0,
        }
    }

    #[must_use]
    pub fn with_default(mut self, default: u64) -> Self {
        self.default = default;
        self
    }

    fn mask(&self) -> u64 {
        if self.width == 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HeaderLayout {
    /// Bytes per word; 1, 2, 4, or 8.
    pub word_bytes: usize,
    /// Number of words in the header.
    pub words: usize,
    pub endian: Endian,
    pub fields: Vec<BitField>,
}

impl HeaderLayout {
    /// Create a layout of 32-bit words.
    #[must_use]
    pub fn new(words: usize, endian: Endian, fields: Vec<BitField>) -> Self {
        HeaderLayout {
            word_bytes: 4,
            words,
            endian,
            fields,
        }
    }

    /// Header length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words * self.word_bytes
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words == 0
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&BitField> {
        self.fields.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    fn span(&self, field: &BitField) -> usize {
        (field.bit + field.width).div_ceil(self.word_bytes as u32 * 8) as usize
    }

    /// Check that all fields fit within the header and within 64 bits.
    ///
    /// # Errors
    /// [Error::Config] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if ![1, 2, 4, 8].contains(&self.word_bytes) {
            return Err(Error::Config(format!(
                "word size must be 1, 2, 4, or 8 bytes; got {}",
                self.word_bytes
            )));
        }
        for field in &self.fields {
            let span = self.span(field);
            if field.width == 0
                || field.bit + field.width > 64
                || span * self.word_bytes > 8
                || field.word + span > self.words
            {
                return Err(Error::Config(format!(
                    "field {} (word={} bit={} width={}) does not fit the header",
                    field.name, field.word, field.bit, field.width
                )));
            }
        }
        Ok(())
    }

    /// Split header bytes into words.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if `buf` is shorter than the header.
    pub fn words_from_bytes(&self, buf: &[u8]) -> Result<Vec<u64>> {
        if buf.len() < self.len() {
            return Err(Error::NotEnoughData {
                actual: buf.len(),
                minimum: self.len(),
            });
        }
        let words = buf[..self.len()]
            .chunks_exact(self.word_bytes)
            .map(|chunk| {
                let mut x = 0u64;
                match self.endian {
                    Endian::Little => {
                        for b in chunk.iter().rev() {
                            x = (x << 8) | u64::from(*b);
                        }
                    }
                    Endian::Big => {
                        for b in chunk {
                            x = (x << 8) | u64::from(*b);
                        }
                    }
                }
                x
            })
            .collect();
        Ok(words)
    }

    #[must_use]
    pub fn bytes_from_words(&self, words: &[u64]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for word in words {
            let bytes = word.to_le_bytes();
            let bytes = &bytes[..self.word_bytes];
            match self.endian {
                Endian::Little => out.extend_from_slice(bytes),
                Endian::Big => out.extend(bytes.iter().rev()),
            }
        }
        out
    }

    // Combined value of the words a field spans.
    fn window(&self, words: &[u64], field: &BitField) -> u64 {
        let bits = self.word_bytes as u32 * 8;
        let span = self.span(field);
        let mut x = 0u64;
        for i in 0..span {
            let w = words[field.word + i];
            x = match self.endian {
                Endian::Little => x | (w << (i as u32 * bits)),
                Endian::Big if bits == 64 => w,
                Endian::Big => (x << bits) | w,
            };
        }
        x
    }

    fn store(&self, words: &mut [u64], field: &BitField, window: u64) {
        let bits = self.word_bytes as u32 * 8;
        let span = self.span(field);
        let word_mask = if bits == 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        };
        for i in 0..span {
            let shift = match self.endian {
                Endian::Little => i as u32 * bits,
                Endian::Big => (span - 1 - i) as u32 * bits,
            };
            words[field.word + i] = (window.checked_shr(shift).unwrap_or(0)) & word_mask;
        }
    }

    /// Value of the field `name`.
    ///
    /// # Errors
    /// [Error::Config] if the layout has no such field.
    pub fn get(&self, words: &[u64], name: &str) -> Result<u64> {
        let field = self
            .field(name)
            .ok_or_else(|| Error::Config(format!("no header field {name}")))?;
        Ok((self.window(words, field) >> field.bit) & field.mask())
    }

    /// Set the field `name` to `value`, leaving all other bits untouched.
    ///
    /// # Errors
    /// [Error::Config] if the layout has no such field, or [Error::Format] if the value
    /// does not fit in the field.
    pub fn set(&self, words: &mut [u64], name: &str, value: u64) -> Result<()> {
        let field = self
            .field(name)
            .ok_or_else(|| Error::Config(format!("no header field {name}")))?;
        if value & !field.mask() != 0 {
            return Err(Error::Format(format!(
                "value {value} does not fit {}-bit field {name}",
                field.width
            )));
        }
        let window = self.window(words, field);
        let cleared = window & !(field.mask() << field.bit);
        self.store(words, field, cleared | (value << field.bit));
        Ok(())
    }

    /// Words of a new header with every field at its default.
    #[must_use]
    pub fn default_words(&self) -> Vec<u64> {
        let mut words = vec![0u64; self.words];
        for field in &self.fields {
            if field.default != 0 {
                let window = self.window(&words, field);
                let value = (field.default & field.mask()) << field.bit;
                self.store(&mut words, field, window | value);
            }
        }
        words
    }
}
