//! Blocking tar extraction.
//!
//! The engine walks the archive one 512-byte block at a time:
//!
//! ```text
//! AwaitingHeader --valid--> ParsingFile --> AwaitingHeader
//!       |  \--invalid--> Realigning --> AwaitingHeader
//!       \--short read--> Done
//! ```
//!
//! Entry failures are collected and the walk goes on; the operation only
//! fails when no file at all could be extracted.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::options::ExtractOptions;
use crate::outcome::{FaultExt, guarded};
use crate::report::{OperationReport, TarExtractionResult};
use crate::tar::cursor::{TarReaderInfo, TarState, entry_target, realignment_seek};
use crate::tar::{BLOCK_SIZE, EntryKind, HeaderBlock};

pub struct TarExtractor<'a, R> {
    input: &'a mut R,
    options: ExtractOptions,
    report: OperationReport,
    expected: usize,
    extracted: Vec<PathBuf>,
    failures: Vec<Error>,
}

impl<'a, R: Read + Seek> TarExtractor<'a, R> {
    pub fn new(report: OperationReport, input: &'a mut R, options: &ExtractOptions) -> Self {
        Self {
            input,
            options: options.clone(),
            report,
            expected: 0,
            extracted: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn run(mut self, output_dir: &Path) -> TarExtractionResult {
        let (dir, created) = match prepare_output_dir(output_dir) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.report.fail(e);
                return self.finish(output_dir.to_path_buf(), false);
            }
        };
        self.report.snapshot_mut().output_path = Some(dir.clone());

        let mut state = TarState::AwaitingHeader;
        let mut info = TarReaderInfo::new(&dir);
        while state != TarState::Done {
            (state, info) = self.step(state, info);
        }
        self.finish(dir, created)
    }

    fn step(&mut self, state: TarState, info: TarReaderInfo) -> (TarState, TarReaderInfo) {
        match state {
            TarState::AwaitingHeader => self.await_header(info),
            TarState::ParsingFile => self.parse_file(info),
            TarState::Realigning => self.realign(info),
            TarState::Done => (TarState::Done, info),
        }
    }

    fn await_header(&mut self, info: TarReaderInfo) -> (TarState, TarReaderInfo) {
        let raw = match read_block(self.input) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.report.debug("end of input");
                return (TarState::Done, info);
            }
            Err(e) => {
                self.report.fail(e);
                return (TarState::Done, info);
            }
        };
        let block = HeaderBlock::parse(raw);
        if block.is_zero() {
            self.report.debug("skipping zero block");
            return (TarState::AwaitingHeader, info);
        }
        if block.accepted(self.options.verify_checksum) {
            (TarState::ParsingFile, info.with_header(block))
        } else {
            (TarState::Realigning, info.with_header(block))
        }
    }

    fn parse_file(&mut self, info: TarReaderInfo) -> (TarState, TarReaderInfo) {
        let Some(block) = info.header() else {
            return (TarState::AwaitingHeader, info);
        };
        let name = block.header.path();
        let size = block.header.size;
        let (info, outcome) = match block.header.kind() {
            EntryKind::File => {
                self.expected += 1;
                self.write_file(info, &name)
            }
            EntryKind::Directory => {
                let outcome = self.make_directory(&info, &name);
                (info, outcome)
            }
            EntryKind::Other(flag) => {
                self.report.debug(format!(
                    "skipping '{name}' of type '{}' ({size} byte(s))",
                    flag.escape_ascii()
                ));
                (info, Ok(()))
            }
        };
        if let Err(source) = outcome {
            self.entry_failed(name, source);
        }

        let skip = info.distance_to_next_header() as i64;
        match self.input.seek(SeekFrom::Current(skip)) {
            Ok(_) => (TarState::AwaitingHeader, info),
            Err(e) => {
                self.report.fail(Error::exception("tar entry skip", e));
                (TarState::Done, info)
            }
        }
    }

    fn write_file(&mut self, info: TarReaderInfo, name: &str) -> (TarReaderInfo, Result<()>) {
        const ORIGIN: &str = "tar entry write";
        let target = match entry_target(info.output_dir(), name, self.options.sanitize_paths) {
            Ok(target) => target,
            Err(e) => return (info, Err(e)),
        };
        let mut info = info.with_target(target.clone());
        let input = &mut *self.input;
        let copied = guarded(ORIGIN, || {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).or_fault(ORIGIN)?;
            }
            let file = File::create(&target).map_err(|e| Error::OutputUnavailable {
                reason: format!("cannot create '{}': {e}", target.display()),
            })?;
            let mut writer = BufWriter::new(file);
            let mut chunk = [0u8; BLOCK_SIZE];
            loop {
                let want = info.next_chunk();
                if want == 0 {
                    break;
                }
                let n = read_some(input, &mut chunk[..want])?;
                if n == 0 {
                    break;
                }
                writer.write_all(&chunk[..n]).or_fault(ORIGIN)?;
                info = info.with_consumed(n as u64);
            }
            writer.flush().or_fault(ORIGIN)
        });

        let outcome = copied
            .and_then(|()| complete(&info))
            .and_then(|()| ensure_not_empty(&target));
        match outcome {
            Ok(()) => {
                self.report
                    .info(format!("extracted '{name}' ({} byte(s))", info.consumed()));
                self.extracted.push(target);
                (info, Ok(()))
            }
            Err(e) => {
                self.remove_partial(&target);
                (info, Err(e))
            }
        }
    }

    fn make_directory(&mut self, info: &TarReaderInfo, name: &str) -> Result<()> {
        let target = entry_target(info.output_dir(), name, self.options.sanitize_paths)?;
        fs::create_dir_all(&target).or_fault("tar directory entry")?;
        self.report
            .debug(format!("created directory '{}'", target.display()));
        Ok(())
    }

    fn realign(&mut self, info: TarReaderInfo) -> (TarState, TarReaderInfo) {
        let Some(block) = info.header() else {
            return (TarState::AwaitingHeader, info);
        };
        match block.junk_offset() {
            Some(offset) => match self.input.seek(SeekFrom::Current(realignment_seek(offset))) {
                Ok(position) => self.report.info(format!(
                    "skipped {offset} junk byte(s), next header at offset {position}"
                )),
                Err(e) => {
                    let err = Error::TarRealignmentFailedForCurrentHeader {
                        offset,
                        source: Box::new(Error::exception("tar realignment", e)),
                    };
                    self.report.error_line(err.to_string());
                    self.failures.push(err);
                }
            },
            None if block.valid_header => self.report.error_line(format!(
                "checksum mismatch in header of '{}', skipping one block",
                block.header.path()
            )),
            None => self
                .report
                .debug("no header magic in block, skipping one block"),
        }
        (TarState::AwaitingHeader, info)
    }

    fn entry_failed(&mut self, name: String, source: Error) {
        let err = Error::TarExtractionFailedForCurrentHeader {
            name,
            source: Box::new(source),
        };
        self.report.error_line(err.to_string());
        self.failures.push(err);
    }

    fn remove_partial(&mut self, target: &Path) {
        match fs::remove_file(target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => self.report.error_line(format!(
                "could not remove partial output '{}': {e}",
                target.display()
            )),
        }
    }

    fn finish(mut self, output_dir: PathBuf, created: bool) -> TarExtractionResult {
        if self.extracted.is_empty() {
            self.report.fail(Error::TarExtractionFailedForEntireArchive {
                expected: self.expected,
            });
            if created && dir_is_empty(&output_dir) && fs::remove_dir(&output_dir).is_ok() {
                let err = Error::OutputDirectoryEmpty {
                    path: output_dir.clone(),
                };
                self.report.error_line(err.to_string());
            }
        } else {
            self.report.info(format!(
                "extracted {} of {} file(s)",
                self.extracted.len(),
                self.expected
            ));
            self.report.succeed();
        }
        TarExtractionResult {
            output_dir,
            expected_files: self.expected,
            extracted_files: self.extracted,
            entry_failures: self.failures,
            report: self.report,
        }
    }
}

/// Absolute output directory, and whether it had to be created.
fn prepare_output_dir(dir: &Path) -> Result<(PathBuf, bool)> {
    let unavailable = |e: io::Error| Error::OutputUnavailable {
        reason: format!("'{}': {e}", dir.display()),
    };
    let dir = std::path::absolute(dir).map_err(unavailable)?;
    if dir.is_dir() {
        return Ok((dir, false));
    }
    if dir.exists() {
        return Err(Error::OutputUnavailable {
            reason: format!("'{}' is not a directory", dir.display()),
        });
    }
    fs::create_dir_all(&dir).map_err(unavailable)?;
    Ok((dir, true))
}

fn dir_is_empty(dir: &Path) -> bool {
    fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_none())
}

pub(super) fn complete(info: &TarReaderInfo) -> Result<()> {
    if info.remaining() > 0 {
        return Err(Error::TruncatedEntry {
            declared: info.declared_size(),
            read: info.consumed(),
        });
    }
    Ok(())
}

fn ensure_not_empty(target: &Path) -> Result<()> {
    let len = fs::metadata(target).or_fault("tar entry metadata")?.len();
    if len == 0 {
        return Err(Error::OutputEmpty {
            target: target.display().to_string(),
        });
    }
    Ok(())
}

fn read_some<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
    loop {
        match input.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::exception("tar read", e)),
        }
    }
}

/// Next full block, or `None` once fewer than 512 bytes are left.
fn read_block<R: Read>(input: &mut R) -> Result<Option<[u8; BLOCK_SIZE]>> {
    let mut block = [0u8; BLOCK_SIZE];
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = read_some(input, &mut block[filled..])?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
    }
    Ok(Some(block))
}

pub(crate) fn unavailable_input(report: OperationReport, output_dir: &Path) -> TarExtractionResult {
    TarExtractionResult {
        output_dir: output_dir.to_path_buf(),
        expected_files: 0,
        extracted_files: Vec::new(),
        entry_failures: Vec::new(),
        report,
    }
}

/// Extracts a tar archive file into `output_dir`.
pub fn extract_tar_file(
    archive: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    options: &ExtractOptions,
) -> TarExtractionResult {
    let archive = archive.as_ref();
    let mut report = OperationReport::new("extract_tar_file");
    report.snapshot_mut().input_path = Some(archive.to_path_buf());
    match File::open(archive) {
        Ok(file) => {
            let mut input = BufReader::new(file);
            TarExtractor::new(report, &mut input, options).run(output_dir.as_ref())
        }
        Err(e) => {
            report.fail(Error::InputUnavailable {
                reason: format!("'{}': {e}", archive.display()),
            });
            unavailable_input(report, output_dir.as_ref())
        }
    }
}

/// Extracts the tar archive that starts at the stream's current position.
pub fn extract_tar_stream<R: Read + Seek>(
    input: &mut R,
    output_dir: impl AsRef<Path>,
    options: &ExtractOptions,
) -> TarExtractionResult {
    let mut report = OperationReport::new("extract_tar_stream");
    report.snapshot_mut().input_is_stream = true;
    TarExtractor::new(report, input, options).run(output_dir.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tar::{TarEntry, TarHeader, write_tar};
    use std::io::Cursor;

    fn sample_entries() -> Vec<TarEntry> {
        vec![
            TarEntry::file("one.txt", b"1".to_vec()),
            TarEntry::directory("sub"),
            TarEntry::file("sub/two.bin", vec![2; 512]),
            TarEntry::file("sub/deeper/three.bin", vec![3; 1300]),
        ]
    }

    fn inserted(mut archive: Vec<u8>, at: usize, junk: &[u8]) -> Vec<u8> {
        archive.splice(at..at, junk.iter().copied());
        archive
    }

    #[test]
    fn extracts_every_valid_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.tar");
        fs::write(&path, write_tar(&sample_entries())).unwrap();

        let out = dir.path().join("out");
        let result = extract_tar_file(&path, &out, &ExtractOptions::default());
        assert!(result.success(), "{}", result.report.log());
        assert_eq!(result.expected_files, 3);
        assert_eq!(result.extracted_count(), 3);
        assert!(result.entry_failures.is_empty());

        let total: u64 = result
            .extracted_files
            .iter()
            .map(|p| fs::metadata(p).unwrap().len())
            .sum();
        assert_eq!(total, 1 + 512 + 1300);
        assert_eq!(fs::read(out.join("sub/deeper/three.bin")).unwrap(), vec![3; 1300]);
        assert!(out.join("sub").is_dir());
    }

    #[test]
    fn recovers_from_one_junk_byte_before_a_header() {
        let archive = write_tar(&[
            TarEntry::file("a.txt", b"first".to_vec()),
            TarEntry::file("b.txt", b"second".to_vec()),
        ]);
        // the second header starts after one header and one data block
        let archive = inserted(archive, BLOCK_SIZE * 2, &[0xFF]);

        let dir = tempfile::tempdir().unwrap();
        let mut input = Cursor::new(archive);
        let result = extract_tar_stream(&mut input, dir.path(), &ExtractOptions::default());
        assert!(result.success(), "{}", result.report.log());
        assert_eq!(result.extracted_count(), 2);
        assert_eq!(fs::read(dir.path().join("b.txt")).unwrap(), b"second");
        assert!(result.report.log().contains("skipped 1 junk byte(s)"));
    }

    #[test]
    fn recovers_from_leading_junk() {
        let archive = inserted(
            write_tar(&[TarEntry::file("a.txt", b"first".to_vec())]),
            0,
            b"abc",
        );
        let dir = tempfile::tempdir().unwrap();
        let result = extract_tar_stream(
            &mut Cursor::new(archive),
            dir.path(),
            &ExtractOptions::default(),
        );
        assert!(result.success());
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"first");
    }

    #[test]
    fn no_entries_fails_the_archive_and_removes_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("never");
        let result = extract_tar_stream(
            &mut Cursor::new(vec![0x41; BLOCK_SIZE * 4]),
            &out,
            &ExtractOptions::default(),
        );
        assert!(!result.success());
        assert_eq!(
            result.report.error().map(Error::kind),
            Some(ErrorKind::TarExtractionFailedForEntireArchive)
        );
        assert!(!out.exists());
        assert!(result.report.log().contains("is empty"));
    }

    #[test]
    fn existing_output_directory_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let result = extract_tar_stream(
            &mut Cursor::new(vec![0u8; BLOCK_SIZE * 2]),
            dir.path(),
            &ExtractOptions::default(),
        );
        assert!(!result.success());
        assert!(dir.path().is_dir());
    }

    #[test]
    fn truncated_entry_is_removed_and_recorded() {
        let archive = write_tar(&[
            TarEntry::file("a.txt", vec![b'a'; 100]),
            TarEntry::file("b.txt", vec![b'b'; 2000]),
        ]);
        let cut = BLOCK_SIZE * 3 + 700;
        let dir = tempfile::tempdir().unwrap();
        let result = extract_tar_stream(
            &mut Cursor::new(archive[..cut].to_vec()),
            dir.path(),
            &ExtractOptions::default(),
        );
        assert!(result.success());
        assert_eq!(result.expected_files, 2);
        assert_eq!(result.extracted_count(), 1);
        assert!(!dir.path().join("b.txt").exists());

        let failure = &result.entry_failures[0];
        assert_eq!(failure.kind(), ErrorKind::TarExtractionFailedForCurrentHeader);
        assert_eq!(failure.inner().map(Error::kind), Some(ErrorKind::TruncatedEntry));
    }

    #[test]
    fn unsafe_and_empty_entries_fail_alone() {
        let archive = write_tar(&[
            TarEntry::file("../escape.txt", b"nope".to_vec()),
            TarEntry::file("empty.txt", Vec::new()),
            TarEntry::file("ok.txt", b"fine".to_vec()),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let result = extract_tar_stream(&mut Cursor::new(archive), &out, &ExtractOptions::default());
        assert!(result.success());
        assert_eq!(result.extracted_count(), 1);
        assert!(!dir.path().join("escape.txt").exists());
        assert!(!out.join("empty.txt").exists());

        let kinds: Vec<_> = result
            .entry_failures
            .iter()
            .filter_map(|e| e.inner().map(Error::kind))
            .collect();
        assert_eq!(kinds, vec![ErrorKind::UnsafeEntryPath, ErrorKind::OutputEmpty]);
    }

    #[test]
    fn checksum_verification_skips_tampered_headers() {
        let mut archive = write_tar(&[
            TarEntry::file("a.txt", b"aaa".to_vec()),
            TarEntry::file("b.txt", b"bbb".to_vec()),
        ]);
        archive[0] = b'z';
        let dir = tempfile::tempdir().unwrap();

        let lenient = extract_tar_stream(
            &mut Cursor::new(archive.clone()),
            dir.path().join("lenient"),
            &ExtractOptions::default(),
        );
        assert_eq!(lenient.extracted_count(), 2);

        let strict = extract_tar_stream(
            &mut Cursor::new(archive),
            dir.path().join("strict"),
            &ExtractOptions::default().verify_checksum(true),
        );
        assert_eq!(strict.extracted_count(), 1);
        assert!(dir.path().join("strict/b.txt").exists());
    }

    #[test]
    fn other_entry_types_are_skipped() {
        let mut link = TarHeader::new("link", 0o777, 0);
        link.typeflag = b'2';
        link.linkname = "target".into();
        let archive = write_tar(&[
            TarEntry {
                header: link,
                data: Vec::new(),
            },
            TarEntry::file("real.txt", b"data".to_vec()),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let result =
            extract_tar_stream(&mut Cursor::new(archive), dir.path(), &ExtractOptions::default());
        assert!(result.success());
        assert_eq!(result.expected_files, 1);
        assert!(!dir.path().join("link").exists());
    }

    #[test]
    fn missing_archive_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let result = extract_tar_file(
            dir.path().join("missing.tar"),
            dir.path().join("out"),
            &ExtractOptions::default(),
        );
        assert_eq!(
            result.report.error().map(Error::kind),
            Some(ErrorKind::InputUnavailable)
        );
        assert!(!dir.path().join("out").exists());
    }
}
