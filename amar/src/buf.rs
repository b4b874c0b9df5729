use std::cmp;
use std::io::{self, ErrorKind, IoSlice, Read, Seek, SeekFrom, Write};

use log::debug;

/// Read until `buf` is full or the source is exhausted.
///
/// Returns `(true, n)` if end of input was hit after `n` bytes, otherwise
/// `(false, buf.len())`.
pub fn fill_buf<R: Read + ?Sized>(data: &mut R, buf: &mut [u8]) -> io::Result<(bool, usize)> {
    let mut buf_read = 0;

    while buf_read < buf.len() {
        match data.read(&mut buf[buf_read..]) {
            Ok(0) => return Ok((true, buf_read)),
            Ok(x) => buf_read += x,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
    }
    Ok((false, buf_read))
}

/// Write every slice in order, preferring one `write_vectored` call.
///
/// Sinks without native scatter/gather support fall back to the default
/// `write_vectored`, which writes the first non-empty slice per call.
pub fn write_all_vectored<W: Write + ?Sized>(
    out: &mut W,
    mut bufs: &mut [IoSlice<'_>],
) -> io::Result<()> {
    IoSlice::advance_slices(&mut bufs, 0);

    while !bufs.is_empty() {
        match out.write_vectored(bufs) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => IoSlice::advance_slices(&mut bufs, n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// Initial size of the read staging area, grown on demand
const STAGING_SIZE: usize = 1024;

/// Whether skipping may use `seek`, decided once per reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seekability {
    Seekable,
    NotSeekable,
}

/// Read side staging buffer.
///
/// Holds `len` live bytes starting at `offset` within `storage`; the size of
/// `storage` is the buffer's capacity.
pub struct StagingBuf<'a, R: Read + Seek> {
    inner: &'a mut R,
    seekable: &'a mut Seekability,

    storage: Vec<u8>,
    offset: usize,
    len: usize,

    got_eof: bool,
    just_seeked: bool,
}

impl<'a, R: Read + Seek> StagingBuf<'a, R> {
    pub fn new(inner: &'a mut R, seekable: &'a mut Seekability) -> Self {
        StagingBuf {
            inner,
            seekable,
            storage: vec![0; STAGING_SIZE],
            offset: 0,
            len: 0,
            got_eof: false,
            just_seeked: false,
        }
    }

    /// The unconsumed bytes currently buffered.
    pub fn avail(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    /// Make sure at least `atleast` bytes are buffered, reading more input
    /// if needed. `Ok(false)` means the input ended first.
    pub fn atleast(&mut self, atleast: usize) -> io::Result<bool> {
        if self.len >= atleast {
            return Ok(true);
        }
        if self.got_eof {
            return Ok(false);
        }

        if self.storage.len() < atleast {
            // Not enough room at all, grow to fit exactly
            let mut grown = vec![0; atleast];
            grown[..self.len].copy_from_slice(self.avail());
            self.storage = grown;
            self.offset = 0;
        } else if self.storage.len() - self.offset < atleast {
            // Enough room but not past the offset, move the live bytes down
            self.storage.copy_within(self.offset..self.offset + self.len, 0);
            self.offset = 0;
        }

        // Right after a seek only read what was asked for, the caller may
        // want to seek again
        let start = self.offset + self.len;
        let end = if self.just_seeked {
            self.offset + atleast
        } else {
            self.storage.len()
        };

        let (eof, read) = fill_buf(self.inner, &mut self.storage[start..end])?;
        if eof {
            self.got_eof = true;
        }
        self.just_seeked = false;
        self.len += read;

        Ok(self.len >= atleast)
    }

    /// Consume `skipbytes`, dropping buffered bytes first and seeking or
    /// reading past the remainder. `Ok(false)` means the input ended first.
    pub fn skip(&mut self, skipbytes: usize) -> io::Result<bool> {
        if skipbytes <= self.len {
            self.len -= skipbytes;
            self.offset += skipbytes;
            return Ok(true);
        }

        let mut remaining = (skipbytes - self.len) as u64;
        self.len = 0;
        self.offset = 0;

        if *self.seekable == Seekability::Seekable {
            match self.inner.seek(SeekFrom::Current(remaining as i64)) {
                Ok(_) => {
                    self.just_seeked = true;
                    return Ok(true);
                }
                Err(e) if e.kind() == ErrorKind::NotSeekable => {
                    debug!("source is not seekable, skipping by reading");
                    *self.seekable = Seekability::NotSeekable;
                }
                Err(e) => return Err(e),
            }
        }

        while remaining > 0 {
            let toread = cmp::min(remaining, self.storage.len() as u64) as usize;
            let (_, read) = fill_buf(self.inner, &mut self.storage[..toread])?;

            if read < toread {
                self.got_eof = true;
                return Ok(false);
            }
            remaining -= read as u64;
        }
        Ok(true)
    }
}
