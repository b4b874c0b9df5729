use std::io::{self, IoSlice, Write};

use crate::buf::write_all_vectored;
use crate::raw::{encode_header, Record, HEADER_SIZE, RECORD_SIZE};

pub(crate) const WRITE_BUFFER_SIZE: usize = 512 * 1024;

/// Bounded write buffer in front of the archive sink.
///
/// The buffer never holds more than `WRITE_BUFFER_SIZE - RECORD_SIZE`
/// bytes between calls, so a record header always fits.
pub(crate) struct RecordSink<W: Write> {
    inner: W,
    buf: Vec<u8>,
    position: u64,
}

impl<W: Write> RecordSink<W> {
    pub fn new(inner: W) -> Self {
        RecordSink {
            inner,
            buf: Vec::with_capacity(WRITE_BUFFER_SIZE),
            position: 0,
        }
    }

    /// Bytes accepted so far, buffered or not.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn write_header(&mut self, version: i64) -> io::Result<()> {
        if self.buf.len() + HEADER_SIZE >= WRITE_BUFFER_SIZE - RECORD_SIZE {
            self.flush()?;
        }

        self.buf.extend_from_slice(&encode_header(version));
        self.position += HEADER_SIZE as u64;
        Ok(())
    }

    pub fn write_record(&mut self, record: Record, data: &[u8]) -> io::Result<()> {
        debug_assert_eq!(record.size, data.len());
        self.buf.extend_from_slice(&record.encode());

        if self.buf.len() + RECORD_SIZE + data.len() < WRITE_BUFFER_SIZE - RECORD_SIZE {
            self.buf.extend_from_slice(data);
        } else {
            // Flush and hand the payload straight through in one call
            let mut bufs = [IoSlice::new(&self.buf), IoSlice::new(data)];
            write_all_vectored(&mut self.inner, &mut bufs)?;
            self.buf.clear();
        }

        self.position += (RECORD_SIZE + data.len()) as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
