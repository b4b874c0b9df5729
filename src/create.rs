use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use amar::{AmarBuilder, ATTR_GENERIC_DATA};
use log::{info, warn};

use crate::cli::{CliError, Config};

/// Archive every path into `out` and return it once the archive is closed.
///
/// Unopenable paths are skipped with a warning. Names are reported on
/// `report` when `verbose` is set, with the byte count from two on.
pub fn create<W: Write>(
    out: W,
    paths: &[PathBuf],
    config: &Config,
    verbose: u8,
    report: &mut dyn Write,
) -> Result<W, CliError> {
    let mut archive = AmarBuilder::new(out)?;

    for path in paths {
        let mut data = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                warn!("{}: {}", path.display(), e);
                continue;
            }
        };
        let name = path.as_os_str().as_encoded_bytes();

        let file = if config.anchors {
            let (file, offset) = archive.new_file_with_anchor(name)?;
            info!("{}: header anchor at {}", path.display(), offset);
            file
        } else {
            archive.new_file(name)?
        };

        let attr = archive.new_attr(&file, ATTR_GENERIC_DATA);
        let size = archive.add_data_from(&attr, &mut data, true)?;
        archive.close_attr(attr)?;
        archive.close_file(file)?;

        match verbose {
            0 => (),
            1 => writeln!(report, "{}", path.display())?,
            _ => writeln!(report, "{} {}", size, path.display())?,
        }
    }

    let mut out = archive.close()?;
    out.flush()?;
    Ok(out)
}

#[cfg(test)]
mod test_create {
    use super::*;
    use crate::extract::list;
    use amar::{AmarHandler, AmarReader, Fragment, HandlingTable};
    use std::io::{self, Cursor};
    use std::ops::ControlFlow;

    #[derive(Default)]
    struct Collect(Vec<(Vec<u8>, u16, Vec<u8>)>);

    impl AmarHandler for Collect {
        type FileData = Vec<u8>;
        type AttrData = Vec<u8>;
        type Policy = ();

        fn file_start(
            &mut self,
            _filenum: u16,
            filename: &[u8],
        ) -> ControlFlow<(), amar::FileStart<Vec<u8>>> {
            ControlFlow::Continue(amar::FileStart::Accept(filename.to_vec()))
        }

        fn fragment(
            &mut self,
            file: &mut Vec<u8>,
            _policy: &(),
            attr: &mut Vec<u8>,
            fragment: Fragment<'_>,
        ) -> ControlFlow<()> {
            attr.extend_from_slice(fragment.data);
            if fragment.eoa {
                assert!(!fragment.truncated);
                self.0.push((file.clone(), fragment.attrid, std::mem::take(attr)));
            }
            ControlFlow::Continue(())
        }
    }

    fn scratch(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn archives_contents() {
        let dir = tempfile::tempdir().unwrap();
        let a = scratch(&dir, "a", b"hello");
        let b = scratch(&dir, "b", &[]);
        let missing = dir.path().join("missing");

        let mut report: Vec<u8> = Vec::new();
        let out = create(
            Vec::<u8>::new(),
            &[a.clone(), missing, b.clone()],
            &Config::default(),
            2,
            &mut report,
        )
        .unwrap();

        let mut collect = Collect::default();
        let mut reader = AmarReader::new(Cursor::new(out));
        reader
            .read(&HandlingTable::new().otherwise(0, ()), &mut collect)
            .unwrap();

        let name = |p: &PathBuf| p.as_os_str().as_encoded_bytes().to_vec();
        assert_eq!(
            collect.0,
            vec![
                (name(&a), ATTR_GENERIC_DATA, b"hello".to_vec()),
                (name(&b), ATTR_GENERIC_DATA, Vec::new()),
            ]
        );

        let report = String::from_utf8(report).unwrap();
        assert_eq!(report, format!("5 {}\n0 {}\n", a.display(), b.display()));
    }

    #[test]
    fn anchors_are_skipped_by_readers() {
        let dir = tempfile::tempdir().unwrap();
        let a = scratch(&dir, "a", b"one");
        let b = scratch(&dir, "b", b"two");
        let config = Config {
            anchors: true,
            ..Config::default()
        };

        let paths = [a.clone(), b.clone()];
        let default = Config::default();
        let plain = create(Vec::<u8>::new(), &paths, &default, 0, &mut io::sink()).unwrap();
        let anchored = create(Vec::<u8>::new(), &paths, &config, 0, &mut io::sink()).unwrap();

        // One extra 28 byte header per file
        assert_eq!(anchored.len(), plain.len() + 2 * 28);

        let mut names: Vec<u8> = Vec::new();
        list(&mut AmarReader::new(Cursor::new(anchored)), &mut names).unwrap();
        assert_eq!(
            names,
            format!("{}\n{}\n", a.display(), b.display()).into_bytes()
        );
    }

    #[test]
    fn quiet_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let a = scratch(&dir, "a", b"x");

        let mut report: Vec<u8> = Vec::new();
        create(Vec::<u8>::new(), &[a], &Config::default(), 0, &mut report).unwrap();
        assert!(report.is_empty());
    }
}
