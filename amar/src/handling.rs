//! Caller side of a read: which attributes to deliver and how.
//!
//! A [`HandlingTable`] maps attribute ids to a [`Handling`] entry, an
//! [`AmarHandler`] receives the events. Three kinds of caller state travel
//! with the events:
//!
//! * `FileData`, produced by [`AmarHandler::file_start`] and handed back
//!   by value to [`AmarHandler::file_finish`].
//! * `AttrData`, created empty for each attribute instance and dropped when
//!   that attribute ends.
//! * `Policy`, stored in the table entry and lent to every fragment it
//!   selects.
use std::ops::ControlFlow;

/// Attribute id of the catch-all entry in [`HandlingTable::from_entries`].
pub const ATTR_ANY: u16 = 0;

/// How to treat the data of an attribute.
#[derive(Debug, Clone)]
pub struct Handling<P> {
    pub attrid: u16,

    /// Reassemble until at least this many bytes are pending (or the
    /// attribute ends) before delivering. Zero delivers each record as it
    /// arrives.
    pub min_size: usize,

    /// `None` skips the attribute's data without buffering it.
    pub policy: Option<P>,
}

impl<P> Handling<P> {
    pub fn new(attrid: u16, min_size: usize, policy: P) -> Self {
        Handling {
            attrid,
            min_size,
            policy: Some(policy),
        }
    }

    pub fn skip(attrid: u16) -> Self {
        Handling {
            attrid,
            min_size: 0,
            policy: None,
        }
    }
}

/// Ordered attribute id lookup with a catch-all.
#[derive(Debug, Clone)]
pub struct HandlingTable<P> {
    entries: Vec<Handling<P>>,
    otherwise: Handling<P>,
}

impl<P> Default for HandlingTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> HandlingTable<P> {
    /// Empty table, every attribute is skipped.
    pub fn new() -> Self {
        HandlingTable {
            entries: Vec::new(),
            otherwise: Handling::skip(ATTR_ANY),
        }
    }

    /// Build from an ordered list. The first entry with id [`ATTR_ANY`] is
    /// the catch-all and ends the list, without one the catch-all skips.
    pub fn from_entries(entries: Vec<Handling<P>>) -> Self {
        let mut table = Self::new();

        for entry in entries {
            if entry.attrid == ATTR_ANY {
                table.otherwise = entry;
                break;
            }
            table.entries.push(entry);
        }
        table
    }

    pub fn on(mut self, attrid: u16, min_size: usize, policy: P) -> Self {
        self.entries.push(Handling::new(attrid, min_size, policy));
        self
    }

    pub fn skip(mut self, attrid: u16) -> Self {
        self.entries.push(Handling::skip(attrid));
        self
    }

    pub fn otherwise(mut self, min_size: usize, policy: P) -> Self {
        self.otherwise = Handling::new(ATTR_ANY, min_size, policy);
        self
    }

    /// First exact match, or the catch-all.
    pub fn lookup(&self, attrid: u16) -> &Handling<P> {
        self.entries
            .iter()
            .find(|h| h.attrid == attrid)
            .unwrap_or(&self.otherwise)
    }
}

/// Answer to [`AmarHandler::file_start`].
#[derive(Debug, PartialEq, Eq)]
pub enum FileStart<F> {
    /// Deliver the file's attributes, `F` is kept until the file finishes.
    Accept(F),

    /// Skip every record of this file, it gets no further callbacks.
    Ignore,
}

/// One piece of an attribute's data.
///
/// Fragment sizes follow the record layout and the `min_size` of the
/// handling entry, they are never guaranteed to be a fixed size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub filenum: u16,
    pub attrid: u16,
    pub data: &'a [u8],

    /// Last fragment of this attribute.
    pub eoa: bool,

    /// The attribute ended without its EOA record.
    pub truncated: bool,
}

/// Receiver of read events. Returning `ControlFlow::Break` from any
/// callback stops the read with [`ReadOutcome::Stopped`](crate::ReadOutcome::Stopped).
pub trait AmarHandler {
    type FileData: Default;
    type AttrData: Default;
    type Policy;

    /// A new file entry. The default accepts every file.
    fn file_start(
        &mut self,
        _filenum: u16,
        _filename: &[u8],
    ) -> ControlFlow<(), FileStart<Self::FileData>> {
        ControlFlow::Continue(FileStart::Accept(Self::FileData::default()))
    }

    fn fragment(
        &mut self,
        file: &mut Self::FileData,
        policy: &Self::Policy,
        attr: &mut Self::AttrData,
        fragment: Fragment<'_>,
    ) -> ControlFlow<()>;

    /// An accepted file ended, `truncated` unless its EOF record was seen.
    fn file_finish(
        &mut self,
        _filenum: u16,
        _file: Self::FileData,
        _truncated: bool,
    ) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}
