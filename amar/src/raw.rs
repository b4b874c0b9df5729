use std::io;

use byteorder::{ByteOrder, NetworkEndian};
use thiserror::Error;

use crate::{HEADER_VERSION, MAX_RECORD_DATA_SIZE};

pub(crate) const HEADER_MAGIC: &str = "AMANDA ARCHIVE FORMAT";
pub(crate) const HEADER_SIZE: usize = 28;
pub(crate) const RECORD_SIZE: usize = 8;

// The first two bytes of every header record, read as a record's filenum
pub(crate) const MAGIC_FILENUM: u16 =
    u16::from_be_bytes([HEADER_MAGIC.as_bytes()[0], HEADER_MAGIC.as_bytes()[1]]);

const EOA_BIT: u32 = 0x8000_0000;

#[derive(Error, Debug)]
pub enum AmarError {
    #[error(transparent)]
    IO(#[from] io::Error),
    #[error("Error reading from data source: {0}")]
    Source(#[source] io::Error),

    // Writer
    #[error("filename must not be empty")]
    EmptyFilename,
    #[error("filename is too long for an amanda archive")]
    FilenameTooLong,
    #[error("No more file numbers available")]
    FileNumbersExhausted,

    // Format
    #[error("Archive read does not begin at a header record")]
    NoHeader,
    #[error("Invalid archive header")]
    InvalidHeader,
    #[error("Archive version {0} is not supported")]
    UnsupportedVersion(i64),
    #[error("Invalid record: data size must be less than {max}", max = MAX_RECORD_DATA_SIZE)]
    RecordTooLarge,
    #[error("Archive contains an EOF record with nonzero size")]
    EofWithData,
    #[error("Archive file {0} has an empty filename")]
    EmptyFileEntry(u16),
    #[error("Filename record for fileid {0} does not have its EOA bit set")]
    FilenameWithoutEoa(u16),
    #[error("Unknown attribute id {attrid} in archive file {filenum}")]
    UnknownAttribute { filenum: u16, attrid: u16 },
}

impl AmarError {
    /// The archive ran out of room for a file entry (ENOSPC in amanda terms).
    pub fn is_no_space(&self) -> bool {
        matches!(self, AmarError::FilenameTooLong | AmarError::FileNumbersExhausted)
    }

    /// The input stream is malformed or from an unsupported version.
    pub fn is_format(&self) -> bool {
        matches!(
            self,
            AmarError::NoHeader
                | AmarError::InvalidHeader
                | AmarError::UnsupportedVersion(_)
                | AmarError::RecordTooLarge
                | AmarError::EofWithData
                | AmarError::EmptyFileEntry(_)
                | AmarError::FilenameWithoutEoa(_)
                | AmarError::UnknownAttribute { .. }
        )
    }
}

// Decoded record header, the EOA bit is split out of the size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Record {
    pub filenum: u16,
    pub attrid: u16,
    pub size: usize,
    pub eoa: bool,
}

impl Record {
    pub fn new(filenum: u16, attrid: u16, size: usize, eoa: bool) -> Self {
        debug_assert!(size <= MAX_RECORD_DATA_SIZE);
        Record {
            filenum,
            attrid,
            size,
            eoa,
        }
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut size = self.size as u32;
        if self.eoa {
            size |= EOA_BIT;
        }

        let mut buf = [0u8; RECORD_SIZE];
        NetworkEndian::write_u16(&mut buf[0..2], self.filenum);
        NetworkEndian::write_u16(&mut buf[2..4], self.attrid);
        NetworkEndian::write_u32(&mut buf[4..8], size);
        buf
    }

    // Caller guarantees at least RECORD_SIZE bytes
    pub fn decode(buf: &[u8]) -> Self {
        let size = NetworkEndian::read_u32(&buf[4..8]);

        Record {
            filenum: NetworkEndian::read_u16(&buf[0..2]),
            attrid: NetworkEndian::read_u16(&buf[2..4]),
            size: (size & !EOA_BIT) as usize,
            eoa: size & EOA_BIT != 0,
        }
    }

    pub fn is_header(&self) -> bool {
        self.filenum == MAGIC_FILENUM
    }
}

pub(crate) fn encode_header(version: i64) -> [u8; HEADER_SIZE] {
    let text = format!("{} {}", HEADER_MAGIC, version);

    // Always leave room for at least one NUL
    let len = text.len().min(HEADER_SIZE - 1);
    let mut hdr = [0u8; HEADER_SIZE];
    hdr[..len].copy_from_slice(&text.as_bytes()[..len]);
    hdr
}

/// Parse `AMANDA ARCHIVE FORMAT <n>` and check that `n` is supported.
pub(crate) fn decode_header(buf: &[u8]) -> Result<i64, AmarError> {
    let rest = buf.strip_prefix(HEADER_MAGIC.as_bytes()).ok_or(AmarError::InvalidHeader)?;

    let blank = rest.iter().take_while(|b| b.is_ascii_whitespace()).count();
    let rest = &rest[blank..];

    let (negative, rest) = match rest.first() {
        Some(b'-') => (true, &rest[1..]),
        Some(b'+') => (false, &rest[1..]),
        _ => (false, rest),
    };

    let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return Err(AmarError::InvalidHeader);
    }

    let version = rest[..digits]
        .iter()
        .try_fold(0i64, |acc, d| acc.checked_mul(10)?.checked_add(i64::from(d - b'0')))
        .ok_or(AmarError::InvalidHeader)?;
    let version = if negative { -version } else { version };

    if version > HEADER_VERSION {
        return Err(AmarError::UnsupportedVersion(version));
    }
    Ok(version)
}
