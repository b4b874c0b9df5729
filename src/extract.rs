use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::ops::ControlFlow;
use std::path::{Component, Path, PathBuf};

use amar::{AmarHandler, AmarReader, FileStart, Fragment, HandlingTable, ReadOutcome};
use log::{error, info, warn};

use crate::cli::CliError;

/// Prints each filename, every file is ignored so nothing is buffered.
struct Lister<O: Write> {
    out: O,
    failed: Option<io::Error>,
}

impl<O: Write> AmarHandler for Lister<O> {
    type FileData = ();
    type AttrData = ();
    type Policy = ();

    fn file_start(&mut self, _filenum: u16, filename: &[u8]) -> ControlFlow<(), FileStart<()>> {
        let line = self.out.write_all(filename).and_then(|_| self.out.write_all(b"\n"));
        if let Err(e) = line {
            self.failed = Some(e);
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(FileStart::Ignore)
    }

    fn fragment(&mut self, _: &mut (), _: &(), _: &mut (), _: Fragment<'_>) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

pub fn list<R: Read + Seek, O: Write>(reader: &mut AmarReader<R>, out: O) -> Result<(), CliError> {
    let mut lister = Lister { out, failed: None };

    match reader.read(&HandlingTable::new(), &mut lister)? {
        ReadOutcome::Finished => Ok(lister.out.flush()?),
        ReadOutcome::Stopped => Err(stopped(lister.failed)),
    }
}

/// Per file state while extracting.
#[derive(Default)]
struct Entry {
    name: String,
}

/// Writes every attribute to `<filename>.<attrid>` below `dir`.
struct Extractor<'a> {
    dir: &'a Path,
    names: &'a [String],
    failed: Option<io::Error>,

    // Attributes that ended without their EOA record
    truncated: usize,
}

impl Extractor<'_> {
    fn write(&self, entry: &Entry, out: &mut Option<File>, f: &Fragment<'_>) -> io::Result<()> {
        if out.is_none() {
            let path = output_path(self.dir, &entry.name, f.attrid)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            info!("{}", path.display());
            *out = Some(File::create(&path)?);
        }

        if let Some(file) = out {
            file.write_all(f.data)?;
        }
        if f.eoa {
            *out = None;
        }
        Ok(())
    }
}

impl AmarHandler for Extractor<'_> {
    type FileData = Entry;
    type AttrData = Option<File>;
    type Policy = ();

    fn file_start(&mut self, _filenum: u16, filename: &[u8]) -> ControlFlow<(), FileStart<Entry>> {
        let name = String::from_utf8_lossy(filename).into_owned();

        if !self.names.is_empty() && !self.names.contains(&name) {
            return ControlFlow::Continue(FileStart::Ignore);
        }
        ControlFlow::Continue(FileStart::Accept(Entry { name }))
    }

    fn fragment(
        &mut self,
        entry: &mut Entry,
        _policy: &(),
        out: &mut Option<File>,
        fragment: Fragment<'_>,
    ) -> ControlFlow<()> {
        if fragment.truncated {
            warn!("{}: attribute {} is truncated", entry.name, fragment.attrid);
            self.truncated += 1;
        }

        if let Err(e) = self.write(entry, out, &fragment) {
            error!("{}: {}", entry.name, e);
            self.failed = Some(e);
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn file_finish(&mut self, _filenum: u16, entry: Entry, truncated: bool) -> ControlFlow<()> {
        if truncated {
            warn!("{}: file is truncated", entry.name);
        }
        ControlFlow::Continue(())
    }
}

/// Extract the archive below `dir`. With `names` only those files are
/// written, every other file is ignored. Returns how many attributes were
/// truncated.
pub fn extract<R: Read + Seek>(
    reader: &mut AmarReader<R>,
    dir: &Path,
    names: &[String],
    fragment_size: usize,
) -> Result<usize, CliError> {
    let handling = HandlingTable::new().otherwise(fragment_size, ());
    let mut extractor = Extractor {
        dir,
        names,
        failed: None,
        truncated: 0,
    };

    match reader.read(&handling, &mut extractor)? {
        ReadOutcome::Finished => Ok(extractor.truncated),
        ReadOutcome::Stopped => Err(stopped(extractor.failed)),
    }
}

/// Archived names are kept below `dir`, root and parent components are
/// dropped.
fn output_path(dir: &Path, name: &str, attrid: u16) -> io::Result<PathBuf> {
    let mut path = dir.to_path_buf();
    let mut parts = 0;

    for c in Path::new(name).components() {
        if let Component::Normal(part) = c {
            path.push(part);
            parts += 1;
        }
    }
    if parts == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no usable path in {:?}", name),
        ));
    }

    let mut path = path.into_os_string();
    path.push(format!(".{}", attrid));
    Ok(path.into())
}

fn stopped(failed: Option<io::Error>) -> CliError {
    CliError::Stopped(failed.unwrap_or_else(|| io::Error::other("stopped by handler")))
}
