use std::collections::HashMap;
use std::io::{Read, Write};

use log::debug;

use crate::buf::fill_buf;
use crate::raw::{AmarError, Record, MAGIC_FILENUM};
use crate::sink::RecordSink;
use crate::{ATTR_APP_START, ATTR_EOF, ATTR_FILENAME, HEADER_VERSION, MAX_RECORD_DATA_SIZE};

/// A file entry opened with [`AmarBuilder::new_file`], consumed by
/// [`AmarBuilder::close_file`].
#[derive(Debug, PartialEq, Eq)]
pub struct FileHandle {
    filenum: u16,
}

impl FileHandle {
    pub fn filenum(&self) -> u16 {
        self.filenum
    }
}

/// An attribute opened with [`AmarBuilder::new_attr`], consumed by
/// [`AmarBuilder::close_attr`].
#[derive(Debug, PartialEq, Eq)]
pub struct AttrHandle {
    filenum: u16,
    attrid: u16,
}

impl AttrHandle {
    pub fn attrid(&self) -> u16 {
        self.attrid
    }
}

struct OpenAttr {
    attrid: u16,
    wrote_eoa: bool,
}

// Attributes in the order they were opened
struct OpenFile {
    attrs: Vec<OpenAttr>,
}

/// Write side of an archive.
///
/// Closing a file closes its remaining attributes in the order they were
/// opened.
pub struct AmarBuilder<W: Write> {
    sink: RecordSink<W>,
    maxfilenum: u16,
    files: HashMap<u16, OpenFile>,
}

impl<W: Write> AmarBuilder<W> {
    /// Start an archive on `writer`, the header goes out first.
    pub fn new(writer: W) -> Result<Self, AmarError> {
        let mut sink = RecordSink::new(writer);
        sink.write_header(HEADER_VERSION)?;

        Ok(AmarBuilder {
            sink,
            maxfilenum: 0,
            files: HashMap::new(),
        })
    }

    /// Logical position in the archive, counting buffered bytes.
    pub fn position(&self) -> u64 {
        self.sink.position()
    }

    pub fn new_file<N: AsRef<[u8]>>(&mut self, filename: N) -> Result<FileHandle, AmarError> {
        self.create_file(filename.as_ref(), false).map(|(file, _)| file)
    }

    /// Like [`new_file`](Self::new_file) but a header record is written in
    /// front of the file entry, its offset is returned so a reader can seek
    /// straight to it later.
    pub fn new_file_with_anchor<N: AsRef<[u8]>>(
        &mut self,
        filename: N,
    ) -> Result<(FileHandle, u64), AmarError> {
        self.create_file(filename.as_ref(), true)
    }

    fn create_file(
        &mut self,
        filename: &[u8],
        anchor: bool,
    ) -> Result<(FileHandle, u64), AmarError> {
        if filename.is_empty() {
            return Err(AmarError::EmptyFilename);
        }
        if filename.len() > MAX_RECORD_DATA_SIZE {
            return Err(AmarError::FilenameTooLong);
        }

        let filenum = self.next_filenum()?;

        // Only tracked once both records made it into the buffer
        let offset = self.sink.position();
        if anchor {
            self.sink.write_header(HEADER_VERSION)?;
        }
        self.sink
            .write_record(Record::new(filenum, ATTR_FILENAME, filename.len(), true), filename)?;

        debug!("opened file {} at {}", filenum, offset);
        self.files.insert(filenum, OpenFile { attrs: Vec::new() });
        Ok((FileHandle { filenum }, offset))
    }

    fn next_filenum(&mut self) -> Result<u16, AmarError> {
        if self.files.len() >= usize::from(u16::MAX) {
            return Err(AmarError::FileNumbersExhausted);
        }

        loop {
            self.maxfilenum = self.maxfilenum.wrapping_add(1);

            // Would read back as a header record
            if self.maxfilenum == MAGIC_FILENUM {
                continue;
            }
            if self.files.contains_key(&self.maxfilenum) {
                continue;
            }
            return Ok(self.maxfilenum);
        }
    }

    fn find_file(files: &mut HashMap<u16, OpenFile>, filenum: u16) -> &mut OpenFile {
        match files.get_mut(&filenum) {
            Some(file) => file,
            None => panic!("file {} is not open in this archive", filenum),
        }
    }

    fn find_attr<'a>(files: &'a mut HashMap<u16, OpenFile>, attr: &AttrHandle) -> &'a mut OpenAttr {
        let file = Self::find_file(files, attr.filenum);
        match file.attrs.iter_mut().find(|a| a.attrid == attr.attrid) {
            Some(state) => state,
            None => panic!("attribute {} is not open on file {}", attr.attrid, attr.filenum),
        }
    }

    /// Open attribute `attrid` on `file`.
    ///
    /// Panics if `attrid` is reserved or already open on this file.
    pub fn new_attr(&mut self, file: &FileHandle, attrid: u16) -> AttrHandle {
        assert!(
            attrid >= ATTR_APP_START,
            "attribute id {} is reserved, application ids start at {}",
            attrid,
            ATTR_APP_START
        );

        let state = Self::find_file(&mut self.files, file.filenum);
        assert!(
            !state.attrs.iter().any(|a| a.attrid == attrid),
            "attribute {} is already open on file {}",
            attrid,
            file.filenum
        );

        state.attrs.push(OpenAttr {
            attrid,
            wrote_eoa: false,
        });
        AttrHandle {
            filenum: file.filenum,
            attrid,
        }
    }

    /// Append `data` to an attribute, split into records of at most
    /// [`MAX_RECORD_DATA_SIZE`]. With `eoa` the last record ends the
    /// attribute, even when `data` is empty.
    ///
    /// Panics if the attribute already ended.
    pub fn add_data(&mut self, attr: &AttrHandle, data: &[u8], eoa: bool) -> Result<(), AmarError> {
        let state = Self::find_attr(&mut self.files, attr);
        assert!(!state.wrote_eoa, "attribute {} already ended", attr.attrid);

        let mut rest = data;
        loop {
            let len = rest.len().min(MAX_RECORD_DATA_SIZE);
            let last = len == rest.len();

            if len == 0 && !eoa {
                break;
            }

            let rec = Record::new(attr.filenum, attr.attrid, len, last && eoa);
            self.sink.write_record(rec, &rest[..len])?;
            rest = &rest[len..];

            if last {
                break;
            }
        }

        if eoa {
            Self::find_attr(&mut self.files, attr).wrote_eoa = true;
        }
        Ok(())
    }

    /// Stream `source` into an attribute until it is exhausted, returning
    /// the number of bytes copied. With `eoa` the final (short) record ends
    /// the attribute.
    ///
    /// Panics if the attribute already ended.
    pub fn add_data_from<R: Read + ?Sized>(
        &mut self,
        attr: &AttrHandle,
        source: &mut R,
        eoa: bool,
    ) -> Result<u64, AmarError> {
        let state = Self::find_attr(&mut self.files, attr);
        assert!(!state.wrote_eoa, "attribute {} already ended", attr.attrid);

        let mut total = 0;
        let mut in_buf = vec![0u8; MAX_RECORD_DATA_SIZE];

        loop {
            let len = match fill_buf(source, &mut in_buf).map_err(AmarError::Source)? {
                (_, len) if len < MAX_RECORD_DATA_SIZE => len,
                (_, len) => {
                    self.sink
                        .write_record(Record::new(attr.filenum, attr.attrid, len, false), &in_buf)?;
                    total += len as u64;
                    continue;
                }
            };

            // Short read, the source is done. The final record goes out
            // even when empty.
            let rec = Record::new(attr.filenum, attr.attrid, len, eoa);
            self.sink.write_record(rec, &in_buf[..len])?;
            total += len as u64;
            break;
        }

        if eoa {
            Self::find_attr(&mut self.files, attr).wrote_eoa = true;
        }
        Ok(total)
    }

    /// End an attribute and release its id. Writes an empty EOA record
    /// unless the attribute already ended.
    pub fn close_attr(&mut self, attr: AttrHandle) -> Result<(), AmarError> {
        let file = Self::find_file(&mut self.files, attr.filenum);
        let idx = match file.attrs.iter().position(|a| a.attrid == attr.attrid) {
            Some(idx) => idx,
            None => panic!("attribute {} is not open on file {}", attr.attrid, attr.filenum),
        };
        let state = file.attrs.remove(idx);

        if !state.wrote_eoa {
            self.sink
                .write_record(Record::new(attr.filenum, attr.attrid, 0, true), &[])?;
        }
        Ok(())
    }

    /// Close every attribute still open on `file`, then write its EOF
    /// record. The file number is released even when this fails.
    pub fn close_file(&mut self, file: FileHandle) -> Result<(), AmarError> {
        let state = match self.files.remove(&file.filenum) {
            Some(state) => state,
            None => panic!("file {} is not open in this archive", file.filenum),
        };

        for attr in state.attrs.iter().filter(|a| !a.wrote_eoa) {
            self.sink
                .write_record(Record::new(file.filenum, attr.attrid, 0, true), &[])?;
        }
        self.sink
            .write_record(Record::new(file.filenum, ATTR_EOF, 0, true), &[])?;

        debug!("closed file {}", file.filenum);
        Ok(())
    }

    /// Flush and hand back the writer, which is never closed here.
    ///
    /// Panics if any file is still open.
    pub fn close(mut self) -> Result<W, AmarError> {
        assert!(
            self.files.is_empty(),
            "closing archive with {} file(s) still open",
            self.files.len()
        );

        self.sink.flush()?;
        Ok(self.sink.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod test_builder {
    use super::*;
    use crate::raw::{encode_header, HEADER_SIZE, RECORD_SIZE};
    use crate::ATTR_GENERIC_DATA;
    use std::io::{self, Cursor, Seek, SeekFrom};

    // Split an archive (after its leading header) into records
    pub(crate) fn records(buf: &[u8]) -> Vec<(Record, Vec<u8>)> {
        assert_eq!(&buf[..HEADER_SIZE], &encode_header(1));

        let mut out = Vec::new();
        let mut pos = HEADER_SIZE;
        while pos < buf.len() {
            let rec = Record::decode(&buf[pos..]);
            if rec.is_header() {
                pos += HEADER_SIZE;
                continue;
            }
            pos += RECORD_SIZE;
            out.push((rec, buf[pos..pos + rec.size].to_vec()));
            pos += rec.size;
        }
        out
    }

    #[test]
    fn header_first() {
        let out = AmarBuilder::new(Vec::new()).unwrap().close().unwrap();
        assert_eq!(&out[..], &encode_header(1));
    }

    #[test]
    fn file_with_attr() {
        let mut arch = AmarBuilder::new(Vec::new()).unwrap();
        let file = arch.new_file("foo").unwrap();
        assert_eq!(file.filenum(), 1);

        let attr = arch.new_attr(&file, ATTR_GENERIC_DATA);
        arch.add_data(&attr, b"hello", false).unwrap();
        arch.add_data(&attr, b"", false).unwrap();
        arch.add_data(&attr, b" world", true).unwrap();
        arch.close_attr(attr).unwrap();
        arch.close_file(file).unwrap();

        let pos = arch.position();
        let out = arch.close().unwrap();
        assert_eq!(pos, out.len() as u64);

        assert_eq!(
            records(&out),
            vec![
                (Record::new(1, ATTR_FILENAME, 3, true), b"foo".to_vec()),
                (Record::new(1, 16, 5, false), b"hello".to_vec()),
                (Record::new(1, 16, 6, true), b" world".to_vec()),
                (Record::new(1, ATTR_EOF, 0, true), vec![]),
            ]
        );
    }

    #[test]
    fn empty_attr_with_eoa() {
        let mut arch = AmarBuilder::new(Vec::new()).unwrap();
        let file = arch.new_file("f").unwrap();
        let attr = arch.new_attr(&file, 17);
        arch.add_data(&attr, b"", true).unwrap();
        arch.close_attr(attr).unwrap();
        arch.close_file(file).unwrap();

        let recs = records(&arch.close().unwrap());
        assert_eq!(recs[1], (Record::new(1, 17, 0, true), vec![]));
        assert_eq!(recs.len(), 3);
    }

    #[test]
    fn close_file_ends_open_attrs_in_order() {
        let mut arch = AmarBuilder::new(Vec::new()).unwrap();
        let file = arch.new_file("f").unwrap();
        let a = arch.new_attr(&file, 20);
        let b = arch.new_attr(&file, 18);
        let c = arch.new_attr(&file, 19);
        arch.add_data(&a, b"x", false).unwrap();
        arch.add_data(&b, b"y", true).unwrap();
        arch.add_data(&c, b"z", false).unwrap();
        arch.close_file(file).unwrap();

        let recs = records(&arch.close().unwrap());
        assert_eq!(
            recs[4..].iter().map(|(r, _)| *r).collect::<Vec<_>>(),
            vec![
                Record::new(1, 20, 0, true),
                Record::new(1, 19, 0, true),
                Record::new(1, ATTR_EOF, 0, true),
            ]
        );
    }

    #[test]
    fn close_attr_releases_id() {
        let mut arch = AmarBuilder::new(Vec::new()).unwrap();
        let file = arch.new_file("f").unwrap();
        let attr = arch.new_attr(&file, 16);
        arch.close_attr(attr).unwrap();

        let attr = arch.new_attr(&file, 16);
        arch.add_data(&attr, b"again", true).unwrap();
        arch.close_file(file).unwrap();
        arch.close().unwrap();
    }

    #[test]
    fn chunking_one_past_max() {
        let data: Vec<u8> = (0..=MAX_RECORD_DATA_SIZE).map(|i| (i % 251) as u8).collect();

        let mut arch = AmarBuilder::new(Vec::new()).unwrap();
        let file = arch.new_file("big").unwrap();
        let attr = arch.new_attr(&file, 16);
        arch.add_data(&attr, &data, true).unwrap();
        arch.close_attr(attr).unwrap();
        arch.close_file(file).unwrap();

        let recs = records(&arch.close().unwrap());
        assert_eq!(recs.len(), 4);
        assert_eq!(recs[1].0, Record::new(1, 16, MAX_RECORD_DATA_SIZE, false));
        assert_eq!(recs[2].0, Record::new(1, 16, 1, true));
        assert_eq!(&recs[1].1[..], &data[..MAX_RECORD_DATA_SIZE]);
        assert_eq!(recs[2].1, vec![data[MAX_RECORD_DATA_SIZE]]);
    }

    #[test]
    fn add_data_from_file() {
        let data: Vec<u8> = (0..(MAX_RECORD_DATA_SIZE + 100)).map(|i| (i % 13) as u8).collect();
        let mut src = tempfile::tempfile().unwrap();
        src.write_all(&data).unwrap();
        src.seek(SeekFrom::Start(0)).unwrap();

        let mut arch = AmarBuilder::new(Vec::new()).unwrap();
        let file = arch.new_file("from-fd").unwrap();
        let attr = arch.new_attr(&file, 16);
        assert_eq!(arch.add_data_from(&attr, &mut src, true).unwrap(), data.len() as u64);
        arch.close_attr(attr).unwrap();
        arch.close_file(file).unwrap();

        let recs = records(&arch.close().unwrap());
        assert_eq!(recs[1].0, Record::new(1, 16, MAX_RECORD_DATA_SIZE, false));
        assert_eq!(recs[2].0, Record::new(1, 16, 100, true));
        assert_eq!([&recs[1].1[..], &recs[2].1[..]].concat(), data);
        assert_eq!(recs[3].0, Record::new(1, ATTR_EOF, 0, true));
    }

    #[test]
    fn add_data_from_exact_multiple() {
        let data = vec![3u8; MAX_RECORD_DATA_SIZE];

        let mut arch = AmarBuilder::new(Vec::new()).unwrap();
        let file = arch.new_file("exact").unwrap();
        let attr = arch.new_attr(&file, 16);
        arch.add_data_from(&attr, &mut Cursor::new(&data), true).unwrap();
        arch.close_attr(attr).unwrap();
        arch.close_file(file).unwrap();

        let recs = records(&arch.close().unwrap());
        assert_eq!(recs[1].0, Record::new(1, 16, MAX_RECORD_DATA_SIZE, false));
        assert_eq!(recs[2].0, Record::new(1, 16, 0, true));
    }

    #[test]
    fn add_data_from_empty_source() {
        let mut arch = AmarBuilder::new(Vec::new()).unwrap();
        let file = arch.new_file("empty").unwrap();
        let attr = arch.new_attr(&file, 17);
        assert_eq!(attr.attrid(), 17);

        assert_eq!(arch.add_data_from(&attr, &mut io::empty(), false).unwrap(), 0);
        arch.close_attr(attr).unwrap();
        arch.close_file(file).unwrap();

        let recs = records(&arch.close().unwrap());
        assert_eq!(recs[1].0, Record::new(1, 17, 0, false));
        assert_eq!(recs[2].0, Record::new(1, 17, 0, true));
        assert_eq!(recs[3].0, Record::new(1, ATTR_EOF, 0, true));
        assert_eq!(recs.len(), 4);
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("disk on fire"))
        }
    }

    #[test]
    fn add_data_from_source_error() {
        let mut arch = AmarBuilder::new(Vec::new()).unwrap();
        let file = arch.new_file("f").unwrap();
        let attr = arch.new_attr(&file, 16);

        let err = arch.add_data_from(&attr, &mut Broken, true).unwrap_err();
        assert!(matches!(err, AmarError::Source(_)));
        assert_eq!(err.to_string(), "Error reading from data source: disk on fire");

        arch.close_file(file).unwrap();
        arch.close().unwrap();
    }

    #[test]
    fn filename_errors() {
        let mut arch = AmarBuilder::new(Vec::new()).unwrap();

        assert!(matches!(arch.new_file(""), Err(AmarError::EmptyFilename)));

        let long = vec![b'a'; MAX_RECORD_DATA_SIZE + 1];
        let err = arch.new_file(&long).unwrap_err();
        assert!(err.is_no_space());

        // Neither attempt wrote anything or used a number
        assert_eq!(arch.position(), HEADER_SIZE as u64);
        assert_eq!(arch.new_file("ok").unwrap().filenum(), 1);
    }

    #[test]
    fn anchor_offset() {
        let mut arch = AmarBuilder::new(Vec::new()).unwrap();
        let first = arch.new_file("a").unwrap();
        let before = arch.position();
        let (second, offset) = arch.new_file_with_anchor("b").unwrap();
        assert_eq!(offset, before);

        arch.close_file(first).unwrap();
        arch.close_file(second).unwrap();
        let out = arch.close().unwrap();

        let offset = offset as usize;
        assert_eq!(&out[offset..offset + HEADER_SIZE], &encode_header(1));
        let rec = Record::decode(&out[offset + HEADER_SIZE..]);
        assert_eq!(rec, Record::new(2, ATTR_FILENAME, 1, true));
    }

    #[test]
    fn filenum_skips_magic_and_wraps() {
        let mut arch = AmarBuilder::new(io::sink()).unwrap();

        arch.maxfilenum = MAGIC_FILENUM - 1;
        let f = arch.new_file("a").unwrap();
        assert_eq!(f.filenum(), MAGIC_FILENUM + 1);

        arch.maxfilenum = u16::MAX - 1;
        let g = arch.new_file("b").unwrap();
        assert_eq!(g.filenum(), u16::MAX);
        let h = arch.new_file("c").unwrap();
        assert_eq!(h.filenum(), 0);

        // 1 is free, 2 is not
        let i = arch.new_file("d").unwrap();
        assert_eq!(i.filenum(), 1);
        arch.maxfilenum = 0;
        let j = arch.new_file("e").unwrap();
        assert_eq!(j.filenum(), 2);

        for file in [f, g, h, i, j] {
            arch.close_file(file).unwrap();
        }
        arch.close().unwrap();
    }

    #[test]
    fn file_numbers_exhausted() {
        let mut arch = AmarBuilder::new(io::sink()).unwrap();

        let mut files = Vec::new();
        for _ in 0..u16::MAX {
            files.push(arch.new_file("x").unwrap());
        }
        assert!(files.iter().all(|f| f.filenum() != MAGIC_FILENUM));

        let err = arch.new_file("one too many").unwrap_err();
        assert!(matches!(err, AmarError::FileNumbersExhausted));
        assert!(err.is_no_space());

        // Freeing one number makes room again
        let freed = files.swap_remove(100);
        let freed_num = freed.filenum();
        arch.close_file(freed).unwrap();
        assert_eq!(arch.new_file("again").unwrap().filenum(), freed_num);
    }

    #[test]
    #[should_panic(expected = "already ended")]
    fn add_after_eoa() {
        let mut arch = AmarBuilder::new(Vec::new()).unwrap();
        let file = arch.new_file("f").unwrap();
        let attr = arch.new_attr(&file, 16);
        arch.add_data(&attr, b"done", true).unwrap();
        let _ = arch.add_data(&attr, b"more", false);
    }

    #[test]
    #[should_panic(expected = "already open")]
    fn reopen_open_attr() {
        let mut arch = AmarBuilder::new(Vec::new()).unwrap();
        let file = arch.new_file("f").unwrap();
        let _a = arch.new_attr(&file, 16);
        let _b = arch.new_attr(&file, 16);
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn reserved_attr() {
        let mut arch = AmarBuilder::new(Vec::new()).unwrap();
        let file = arch.new_file("f").unwrap();
        let _a = arch.new_attr(&file, 15);
    }

    #[test]
    #[should_panic(expected = "still open")]
    fn close_with_open_file() {
        let mut arch = AmarBuilder::new(Vec::new()).unwrap();
        let _file = arch.new_file("f").unwrap();
        let _ = arch.close();
    }
}
