//! Byte sources.
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::prelude::*;

/// Several files read as one contiguous stream, e.g., a recording split into chunks.
pub struct SequentialFile {
    paths: Vec<PathBuf>,
    /// Start offset of each file, plus the total length.
    starts: Vec<u64>,
    current: Option<(usize, BufReader<File>)>,
    pos: u64,
}

impl SequentialFile {
    /// Open `paths` in order.
    ///
    /// # Errors
    /// [Error::Io] if any file cannot be opened, [Error::Config] if `paths` is empty.
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        if paths.is_empty() {
            return Err(Error::Config("no files given".to_string()));
        }
        let mut starts = Vec::with_capacity(paths.len() + 1);
        let mut total = 0;
        for path in paths {
            starts.push(total);
            total += std::fs::metadata(path.as_ref())?.len();
        }
        starts.push(total);
        debug!(files = paths.len(), total, "opened sequential file");
        Ok(SequentialFile {
            paths: paths.iter().map(|p| p.as_ref().to_path_buf()).collect(),
            starts,
            current: None,
            pos: 0,
        })
    }

    /// Total length of all files.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.starts[self.paths.len()]
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Index of the file holding `pos`.
    fn file_index(&self, pos: u64) -> Option<usize> {
        (0..self.paths.len()).find(|i| pos >= self.starts[*i] && pos < self.starts[i + 1])
    }

    fn reader_at(&mut self, index: usize, pos: u64) -> io::Result<&mut BufReader<File>> {
        let within = pos - self.starts[index];
        let reopen = !matches!(self.current, Some((i, _)) if i == index);
        if reopen {
            trace!(path = %self.paths[index].display(), "opening file");
            let file = File::open(&self.paths[index])?;
            self.current = Some((index, BufReader::new(file)));
        }
        let Some((_, reader)) = self.current.as_mut() else {
            return Err(io::Error::other("no current file"));
        };
        if reopen || reader.stream_position()? != within {
            reader.seek(SeekFrom::Start(within))?;
        }
        Ok(reader)
    }
}

impl Read for SequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(index) = self.file_index(self.pos) else {
            return Ok(0);
        };
        let pos = self.pos;
        let n = self.reader_at(index, pos)?.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SequentialFile {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let pos = match target {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(n) => self.len().checked_add_signed(n),
            SeekFrom::Current(n) => self.pos.checked_add_signed(n),
        };
        let pos = pos.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of data")
        })?;
        self.pos = pos;
        Ok(pos)
    }
}
