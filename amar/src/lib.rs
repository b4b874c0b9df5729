//! Amanda Archive (amar) container format
//!
//! A streaming container that multiplexes many independent "files", each
//! carrying any number of numbered attributes. The data of one attribute may
//! be split across many records and interleaved with the records of other
//! attributes and other files, so an archive can be produced and consumed as
//! a single pass over a pipe or tape without ever holding a whole file in
//! memory.
//!
//! # Top Level
//!
//! An archive is a sequence of records. Everything is stored in network
//! (big endian) byte order. There are two kinds of record, told apart by
//! their first two bytes.
//!
//! ## Header record
//!
//! | Type     | Name  | Description |
//! | -------: | ----- | ----------- |
//! | [u8; 28] | magic | `AMANDA ARCHIVE FORMAT <version>`, NUL padded |
//!
//! The stream must begin with a header record. Writers may emit more of
//! them later (before a file's first record) so that a reader can seek into
//! the middle of an archive and resynchronise. The first two bytes, `AM`
//! (`0x414d`), are the reason that value is never used as a file number.
//!
//! ## Data record
//!
//! | Type    | Name    | Description |
//! | ------: | ------- | ----------- |
//! | u16     | filenum | The file this record belongs to |
//! | u16     | attrid  | The attribute of that file |
//! | u32     | size    | Payload length, high bit set on the last record of an attribute (EOA) |
//! | [u8; N] | data    | `size` bytes of payload, at most [`MAX_RECORD_DATA_SIZE`] |
//!
//! # Attribute ids
//!
//! | Id   | Name      | Description |
//! | :--: | --------- | ----------- |
//! | 0    | filename  | Opens a file; one record with EOA set |
//! | 1    | EOF       | Closes a file; zero length |
//! | 2-15 | reserved  | Rejected by readers |
//! | 16+  | app       | Application data, see [`ATTR_GENERIC_DATA`] |
//!
//! Writing goes through [`builder::AmarBuilder`], reading through
//! [`reader::AmarReader`] driven by a [`handling::HandlingTable`] and an
//! [`handling::AmarHandler`].
pub mod builder;
pub mod handling;
pub mod reader;

mod buf;
mod raw;
mod sink;

pub use builder::{AmarBuilder, AttrHandle, FileHandle};
pub use handling::{AmarHandler, FileStart, Fragment, Handling, HandlingTable, ATTR_ANY};
pub use raw::AmarError;
pub use reader::{AmarReader, ReadOutcome, Unseekable};

/// Highest archive version understood, and the one written.
pub const HEADER_VERSION: i64 = 1;

/// Largest payload a single record may carry (4 MiB).
pub const MAX_RECORD_DATA_SIZE: usize = 4 * 1024 * 1024;

/// Filename attribute, internal only.
pub const ATTR_FILENAME: u16 = 0;
/// End of file attribute, internal only.
pub const ATTR_EOF: u16 = 1;
/// Application attribute ids start here.
pub const ATTR_APP_START: u16 = 16;
/// Conventional attribute for the content of a file.
pub const ATTR_GENERIC_DATA: u16 = ATTR_APP_START;
