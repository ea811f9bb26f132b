use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use super::layout::HeaderLayout;
use crate::prelude::*;

/// Raw frame header.
///
/// Headers keep the exact bytes they were parsed from; field updates rewrite only the
/// affected bits (binary) or cards (text), so serializing an unmodified header reproduces
/// its input.
#[derive(Debug, Clone, PartialEq)]
pub enum Header {
    /// Header of fixed-width words described by a [HeaderLayout].
    Binary(BinaryHeader),
    /// ASCII `KEY value` header padded to a fixed size.
    Text(TextHeader),
}

impl Header {
    /// Header length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Header::Binary(h) => h.layout.len(),
            Header::Text(h) => h.raw.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Header::Binary(h) => h.to_bytes(),
            Header::Text(h) => h.raw.clone(),
        }
    }

    /// # Errors
    /// [Error::Format] if this is not a binary header.
    pub fn binary(&self) -> Result<&BinaryHeader> {
        match self {
            Header::Binary(h) => Ok(h),
            Header::Text(_) => Err(Error::Format("expected a binary header".to_string())),
        }
    }

    /// # Errors
    /// [Error::Format] if this is not a text header.
    pub fn text(&self) -> Result<&TextHeader> {
        match self {
            Header::Text(h) => Ok(h),
            Header::Binary(_) => Err(Error::Format("expected a text header".to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryHeader {
    layout: Arc<HeaderLayout>,
    words: Vec<u64>,
}

impl BinaryHeader {
    /// New header with every field at its layout default.
    #[must_use]
    pub fn new(layout: Arc<HeaderLayout>) -> Self {
        let words = layout.default_words();
        BinaryHeader { layout, words }
    }

    /// # Errors
    /// [Error::NotEnoughData] if `buf` is shorter than the layout.
    pub fn from_bytes(layout: Arc<HeaderLayout>, buf: &[u8]) -> Result<Self> {
        let words = layout.words_from_bytes(buf)?;
        Ok(BinaryHeader { layout, words })
    }

    #[must_use]
    pub fn layout(&self) -> &HeaderLayout {
        &self.layout
    }

    #[must_use]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// # Errors
    /// [Error::Config] if the layout has no field `name`.
    pub fn get(&self, name: &str) -> Result<u64> {
        self.layout.get(&self.words, name)
    }

    /// Value of `name`, or `default` if the layout does not declare it.
    #[must_use]
    pub fn get_or(&self, name: &str, default: u64) -> u64 {
        self.layout.get(&self.words, name).unwrap_or(default)
    }

    /// # Errors
    /// If the field does not exist or the value does not fit.
    pub fn set(&mut self, name: &str, value: u64) -> Result<()> {
        self.layout.set(&mut self.words, name, value)
    }

    /// Set `name` if the layout declares it.
    ///
    /// # Errors
    /// If the value does not fit.
    pub fn set_if_present(&mut self, name: &str, value: u64) -> Result<()> {
        if self.layout.has(name) {
            self.set(name, value)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.layout.bytes_from_words(&self.words)
    }
}

/// `KEY value` header cards, one per line, padded with NUL bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct TextHeader {
    raw: Vec<u8>,
    cards: Vec<(String, String)>,
}

impl TextHeader {
    /// Parse the cards of `raw`, which must be the complete padded header.
    #[must_use]
    pub fn parse(raw: &[u8]) -> Self {
        let text_len = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        let text = String::from_utf8_lossy(&raw[..text_len]);
        let cards = parse_cards(&text);
        TextHeader {
            raw: raw.to_vec(),
            cards,
        }
    }

    /// New header of `size` bytes holding `cards`.
    ///
    /// # Errors
    /// [Error::Format] if the cards do not fit in `size` bytes.
    pub fn new(size: usize, cards: Vec<(String, String)>) -> Result<Self> {
        let mut header = TextHeader {
            raw: vec![0u8; size],
            cards,
        };
        header.render()?;
        Ok(header)
    }

    #[must_use]
    pub fn cards(&self) -> &[(String, String)] {
        &self.cards
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.cards
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parse the value of `key`.
    ///
    /// # Errors
    /// [Error::Format] if the key is missing or its value does not parse.
    pub fn parse_value<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let value = self
            .get(key)
            .ok_or_else(|| Error::Format(format!("header is missing {key}")))?;
        value
            .parse()
            .map_err(|e| Error::Format(format!("invalid {key} value {value:?}: {e}")))
    }

    /// Like [Self::parse_value] but `default` when the key is missing.
    ///
    /// # Errors
    /// [Error::Format] if the value does not parse.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        if self.get(key).is_none() {
            return Ok(default);
        }
        self.parse_value(key)
    }

    /// Replace or append the card for `key`.
    ///
    /// # Errors
    /// [Error::Format] if the header no longer fits its size.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let previous = self.cards.clone();
        match self.cards.iter_mut().find(|(k, _)| k == key) {
            Some(card) => card.1 = value.to_string(),
            None => self.cards.push((key.to_string(), value.to_string())),
        }
        if let Err(err) = self.render() {
            self.cards = previous;
            return Err(err);
        }
        Ok(())
    }

    fn render(&mut self) -> Result<()> {
        let mut text = String::new();
        for (key, value) in &self.cards {
            text.push_str(&format!("{key:<15} {value}\n"));
        }
        if text.len() > self.raw.len() {
            return Err(Error::Format(format!(
                "header text of {} bytes does not fit {} bytes",
                text.len(),
                self.raw.len()
            )));
        }
        self.raw.fill(0);
        self.raw[..text.len()].copy_from_slice(text.as_bytes());
        Ok(())
    }
}

fn parse_cards(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.split_once(char::is_whitespace) {
            Some((key, value)) => (key.to_string(), value.trim().to_string()),
            None => (line.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::layout::{BitField, Endian};

    #[test]
    fn binary_header_round_trips_unknown_bits() {
        let layout = Arc::new(HeaderLayout::new(
            2,
            Endian::Little,
            vec![BitField::new("frame_nr", 1, 0, 8)],
        ));
        let bytes = hex::decode("deadbeef01ffffff").unwrap();
        let mut header = BinaryHeader::from_bytes(layout, &bytes).unwrap();
        assert_eq!(header.to_bytes(), bytes);

        header.set("frame_nr", 2).unwrap();
        assert_eq!(header.to_bytes(), hex::decode("deadbeef02ffffff").unwrap());
    }

    #[test]
    fn text_header_parses_cards() {
        let mut raw = b"HDR_VERSION 1.0\n# comment\nNCHAN   4\nUTC_START 2013-07-02-01:37:40\n"
            .to_vec();
        raw.resize(256, 0);
        let header = TextHeader::parse(&raw);

        assert_eq!(header.get("HDR_VERSION"), Some("1.0"));
        assert_eq!(header.parse_value::<usize>("NCHAN").unwrap(), 4);
        assert_eq!(header.get("UTC_START"), Some("2013-07-02-01:37:40"));
        assert_eq!(header.parse_or::<usize>("NPOL", 1).unwrap(), 1);
        assert!(header.parse_value::<usize>("NBIT").is_err());
        assert_eq!(Header::Text(header).to_bytes(), raw);
    }

    #[test]
    fn text_header_set_rerenders() {
        let mut header =
            TextHeader::new(64, vec![("HDR_SIZE".to_string(), "64".to_string())]).unwrap();
        header.set("NBIT", "8").unwrap();
        let reparsed = TextHeader::parse(&Header::Text(header.clone()).to_bytes());
        assert_eq!(reparsed, header);
        assert_eq!(reparsed.get("NBIT"), Some("8"));

        assert!(header.set("TOO_LONG", &"x".repeat(64)).is_err());
    }
}
