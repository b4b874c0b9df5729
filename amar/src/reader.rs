use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use std::ops::ControlFlow;

use log::{debug, trace, warn};

use crate::buf::{Seekability, StagingBuf};
use crate::handling::{AmarHandler, FileStart, Fragment, Handling, HandlingTable};
use crate::raw::{decode_header, AmarError, Record, HEADER_SIZE, RECORD_SIZE};
use crate::{ATTR_APP_START, ATTR_EOF, ATTR_FILENAME, MAX_RECORD_DATA_SIZE};

// An empty filename followed by this much NUL (less the record header) is
// taken to be block padding at the end of the archive
const PADDING_BLOCK: usize = 512;

/// How a read ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The whole input was consumed.
    Finished,

    /// A handler callback asked to stop.
    Stopped,
}

/// Adapts a plain reader (stdin, a pipe) whose every seek fails with
/// [`ErrorKind::NotSeekable`], so skipping reads and discards instead.
pub struct Unseekable<R>(pub R);

impl<R: Read> Read for Unseekable<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R> Seek for Unseekable<R> {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::from(ErrorKind::NotSeekable))
    }
}

/// Read side of an archive.
///
/// Seeking is attempted to skip unwanted data until the first time the
/// source reports [`ErrorKind::NotSeekable`], after that it reads and
/// discards.
pub struct AmarReader<R: Read + Seek> {
    inner: R,
    seekable: Seekability,
}

impl<R: Read + Seek> AmarReader<R> {
    pub fn new(reader: R) -> Self {
        AmarReader {
            inner: reader,
            seekable: Seekability::Seekable,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Consume the archive in one pass, delivering events to `handler`.
    ///
    /// When the input ends, files still open are finished as truncated in
    /// the order they were opened. Nothing is finished after an error or a
    /// stop.
    pub fn read<H: AmarHandler>(
        &mut self,
        handling: &HandlingTable<H::Policy>,
        handler: &mut H,
    ) -> Result<ReadOutcome, AmarError> {
        let mut buf = StagingBuf::new(&mut self.inner, &mut self.seekable);
        let mut session = Session {
            handling,
            handler,
            files: Vec::new(),
        };

        if session.scan(&mut buf)?.is_break() {
            return Ok(ReadOutcome::Stopped);
        }

        for fs in session.files.drain(..) {
            if finish_file(session.handler, fs, true).is_break() {
                return Ok(ReadOutcome::Stopped);
            }
        }
        Ok(ReadOutcome::Finished)
    }
}

struct AttrState<'h, H: AmarHandler> {
    attrid: u16,
    handling: &'h Handling<H::Policy>,

    // Reassembly, pending until min_size is reached
    buf: Vec<u8>,
    attr_data: H::AttrData,
    wrote_eoa: bool,
}

struct FileState<'h, H: AmarHandler> {
    filenum: u16,

    // None when the handler ignored the file
    data: Option<H::FileData>,
    attrs: Vec<AttrState<'h, H>>,
}

struct Session<'h, 'a, H: AmarHandler> {
    handling: &'h HandlingTable<H::Policy>,
    handler: &'a mut H,

    // In the order they were opened
    files: Vec<FileState<'h, H>>,
}

impl<'h, H: AmarHandler> Session<'h, '_, H> {
    fn file_index(&self, filenum: u16) -> Option<usize> {
        self.files.iter().position(|f| f.filenum == filenum)
    }

    /// Scan records until the input ends (`Continue`) or a callback stops
    /// (`Break`).
    fn scan<R: Read + Seek>(
        &mut self,
        buf: &mut StagingBuf<'_, R>,
    ) -> Result<ControlFlow<()>, AmarError> {
        // Check the first record without consuming it
        if buf.atleast(RECORD_SIZE)? && !Record::decode(buf.avail()).is_header() {
            return Err(AmarError::NoHeader);
        }

        loop {
            if !buf.atleast(RECORD_SIZE)? {
                return Ok(ControlFlow::Continue(()));
            }
            let rec = Record::decode(buf.avail());

            if rec.is_header() {
                // Cut off in the middle of the header
                if !buf.atleast(HEADER_SIZE)? {
                    return Ok(ControlFlow::Continue(()));
                }

                let version = decode_header(&buf.avail()[..HEADER_SIZE])?;
                debug!("skipping header record, version {}", version);
                buf.skip(HEADER_SIZE)?;
                continue;
            }

            trace!(
                "record file {} attr {} size {} eoa {}",
                rec.filenum,
                rec.attrid,
                rec.size,
                rec.eoa
            );
            buf.skip(RECORD_SIZE)?;

            if rec.size > MAX_RECORD_DATA_SIZE {
                return Err(AmarError::RecordTooLarge);
            }

            let flow = match rec.attrid {
                ATTR_EOF => self.end_of_file(rec)?,
                ATTR_FILENAME => match self.filename(buf, rec)? {
                    Some(flow) => flow,
                    None => return Ok(ControlFlow::Continue(())),
                },
                attrid if attrid < ATTR_APP_START => {
                    return Err(AmarError::UnknownAttribute {
                        filenum: rec.filenum,
                        attrid,
                    })
                }
                _ => match self.attr_data(buf, rec)? {
                    Some(flow) => flow,
                    None => return Ok(ControlFlow::Continue(())),
                },
            };

            if flow.is_break() {
                return Ok(flow);
            }
        }
    }

    fn end_of_file(&mut self, rec: Record) -> Result<ControlFlow<()>, AmarError> {
        if rec.size != 0 {
            return Err(AmarError::EofWithData);
        }

        match self.file_index(rec.filenum) {
            Some(idx) => {
                let fs = self.files.remove(idx);
                debug!("file {} finished", rec.filenum);
                Ok(finish_file(self.handler, fs, false))
            }
            None => Ok(ControlFlow::Continue(())),
        }
    }

    // `None` when the input ends before the filename is complete, or at
    // trailing padding
    fn filename<R: Read + Seek>(
        &mut self,
        buf: &mut StagingBuf<'_, R>,
        rec: Record,
    ) -> Result<Option<ControlFlow<()>>, AmarError> {
        if !buf.atleast(rec.size)? {
            return Ok(None);
        }

        if let Some(idx) = self.file_index(rec.filenum) {
            warn!("file {} did not end before its number was reused", rec.filenum);
            let fs = self.files.remove(idx);
            if finish_file(self.handler, fs, true).is_break() {
                return Ok(Some(ControlFlow::Break(())));
            }
        }

        if rec.size == 0 {
            let padding = PADDING_BLOCK - RECORD_SIZE;
            if !buf.atleast(padding)? {
                return Ok(None);
            }
            if buf.avail()[..padding].iter().all(|&b| b == 0) {
                warn!("treating empty filename for file {} as trailing padding", rec.filenum);
                return Ok(None);
            }
            return Err(AmarError::EmptyFileEntry(rec.filenum));
        }

        if !rec.eoa {
            return Err(AmarError::FilenameWithoutEoa(rec.filenum));
        }

        let data = match self.handler.file_start(rec.filenum, &buf.avail()[..rec.size]) {
            ControlFlow::Break(()) => return Ok(Some(ControlFlow::Break(()))),
            ControlFlow::Continue(FileStart::Accept(data)) => Some(data),
            ControlFlow::Continue(FileStart::Ignore) => {
                debug!("ignoring file {}", rec.filenum);
                None
            }
        };
        debug!("file {} started", rec.filenum);

        self.files.push(FileState {
            filenum: rec.filenum,
            data,
            attrs: Vec::new(),
        });
        buf.skip(rec.size)?;

        Ok(Some(ControlFlow::Continue(())))
    }

    // `None` when the input ends inside the record
    fn attr_data<R: Read + Seek>(
        &mut self,
        buf: &mut StagingBuf<'_, R>,
        rec: Record,
    ) -> Result<Option<ControlFlow<()>>, AmarError> {
        // Unknown or ignored files
        let fs = match self.file_index(rec.filenum) {
            Some(idx) => &mut self.files[idx],
            None => return skip_record(buf, rec),
        };
        let file_data = match fs.data.as_mut() {
            Some(data) => data,
            None => return skip_record(buf, rec),
        };

        let aidx = fs.attrs.iter().position(|a| a.attrid == rec.attrid);
        let handling = match aidx {
            Some(idx) => fs.attrs[idx].handling,
            None => self.handling.lookup(rec.attrid),
        };

        // A single record attribute goes straight from the staging buffer
        if rec.eoa && aidx.is_none() {
            let policy = match handling.policy.as_ref() {
                Some(policy) => policy,
                None => return skip_record(buf, rec),
            };

            let mut attr_data = H::AttrData::default();
            let mut deliver = |data: &[u8], eoa: bool| {
                self.handler.fragment(
                    file_data,
                    policy,
                    &mut attr_data,
                    Fragment {
                        filenum: rec.filenum,
                        attrid: rec.attrid,
                        data,
                        eoa,
                        truncated: false,
                    },
                )
            };

            let avail = buf.avail().len();
            if avail >= rec.size {
                let flow = deliver(&buf.avail()[..rec.size], true);
                buf.skip(rec.size)?;
                return Ok(Some(flow));
            }
            if avail >= handling.min_size {
                if avail > 0 {
                    if deliver(buf.avail(), false).is_break() {
                        return Ok(Some(ControlFlow::Break(())));
                    }
                    buf.skip(avail)?;
                }

                let rest = rec.size - avail;
                if !buf.atleast(rest)? {
                    return Ok(None);
                }
                let flow = deliver(&buf.avail()[..rest], true);
                buf.skip(rest)?;
                return Ok(Some(flow));
            }
        }

        let aidx = match aidx {
            Some(idx) => idx,
            None => {
                fs.attrs.push(AttrState {
                    attrid: rec.attrid,
                    handling,
                    buf: Vec::new(),
                    attr_data: H::AttrData::default(),
                    wrote_eoa: false,
                });
                fs.attrs.len() - 1
            }
        };

        if let Some(policy) = handling.policy.as_ref() {
            let attr = &mut fs.attrs[aidx];

            let avail = buf.avail().len();
            if avail >= rec.size {
                let data = &buf.avail()[..rec.size];
                let flow =
                    handle_hunk(self.handler, rec.filenum, file_data, attr, policy, data, rec.eoa);
                if flow.is_break() {
                    return Ok(Some(flow));
                }
                buf.skip(rec.size)?;
            } else {
                // What is buffered now, then the remainder
                let data = buf.avail();
                let flow =
                    handle_hunk(self.handler, rec.filenum, file_data, attr, policy, data, false);
                if flow.is_break() {
                    return Ok(Some(flow));
                }
                buf.skip(avail)?;

                let rest = rec.size - avail;
                if !buf.atleast(rest)? {
                    return Ok(None);
                }
                let data = &buf.avail()[..rest];
                let flow =
                    handle_hunk(self.handler, rec.filenum, file_data, attr, policy, data, rec.eoa);
                if flow.is_break() {
                    return Ok(Some(flow));
                }
                buf.skip(rest)?;
            }
        } else {
            buf.skip(rec.size)?;
        }

        if rec.eoa {
            let attr = fs.attrs.remove(aidx);
            return Ok(Some(finish_attr(self.handler, rec.filenum, file_data, attr, false)));
        }
        Ok(Some(ControlFlow::Continue(())))
    }
}

fn skip_record<R: Read + Seek>(
    buf: &mut StagingBuf<'_, R>,
    rec: Record,
) -> Result<Option<ControlFlow<()>>, AmarError> {
    buf.skip(rec.size)?;
    Ok(Some(ControlFlow::Continue(())))
}

// Deliver or buffer one piece of a record
fn handle_hunk<H: AmarHandler>(
    handler: &mut H,
    filenum: u16,
    file_data: &mut H::FileData,
    attr: &mut AttrState<'_, H>,
    policy: &H::Policy,
    data: &[u8],
    eoa: bool,
) -> ControlFlow<()> {
    let min_size = attr.handling.min_size;

    // Nothing pending and enough here, no need to copy
    if min_size == 0 || (attr.buf.is_empty() && data.len() >= min_size) {
        if data.is_empty() && !eoa {
            return ControlFlow::Continue(());
        }
        attr.wrote_eoa = eoa;
        return handler.fragment(
            file_data,
            policy,
            &mut attr.attr_data,
            Fragment {
                filenum,
                attrid: attr.attrid,
                data,
                eoa,
                truncated: false,
            },
        );
    }

    attr.buf.extend_from_slice(data);
    if attr.buf.len() >= min_size || eoa {
        let flow = handler.fragment(
            file_data,
            policy,
            &mut attr.attr_data,
            Fragment {
                filenum,
                attrid: attr.attrid,
                data: &attr.buf,
                eoa,
                truncated: false,
            },
        );
        attr.buf.clear();
        attr.wrote_eoa = eoa;
        return flow;
    }
    ControlFlow::Continue(())
}

// Flush an attribute that never delivered its EOA
fn finish_attr<H: AmarHandler>(
    handler: &mut H,
    filenum: u16,
    file_data: &mut H::FileData,
    mut attr: AttrState<'_, H>,
    truncated: bool,
) -> ControlFlow<()> {
    if attr.wrote_eoa {
        return ControlFlow::Continue(());
    }

    match attr.handling.policy.as_ref() {
        Some(policy) => handler.fragment(
            file_data,
            policy,
            &mut attr.attr_data,
            Fragment {
                filenum,
                attrid: attr.attrid,
                data: &attr.buf,
                eoa: true,
                truncated,
            },
        ),
        None => ControlFlow::Continue(()),
    }
}

fn finish_file<H: AmarHandler>(
    handler: &mut H,
    fs: FileState<'_, H>,
    truncated: bool,
) -> ControlFlow<()> {
    let FileState {
        filenum,
        data,
        attrs,
    } = fs;

    // Ignored files never hold attributes or get finished
    let mut data = match data {
        Some(data) => data,
        None => return ControlFlow::Continue(()),
    };

    for attr in attrs {
        finish_attr(handler, filenum, &mut data, attr, true)?;
    }
    handler.file_finish(filenum, data, truncated)
}
