//! Non-blocking tar extraction over tokio.
//!
//! Same walk as [`super::extract`]; only the I/O awaits.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter};

use crate::error::{Error, Result};
use crate::options::ExtractOptions;
use crate::outcome::{FaultExt, guarded_async};
use crate::report::{OperationReport, TarExtractionResult};
use crate::tar::cursor::{TarReaderInfo, TarState, entry_target, realignment_seek};
use crate::tar::extract::{complete, unavailable_input};
use crate::tar::{BLOCK_SIZE, EntryKind, HeaderBlock};

pub struct AsyncTarExtractor<'a, R> {
    input: &'a mut R,
    options: ExtractOptions,
    report: OperationReport,
    expected: usize,
    extracted: Vec<PathBuf>,
    failures: Vec<Error>,
}

impl<'a, R> AsyncTarExtractor<'a, R>
where
    R: AsyncRead + AsyncSeek + Unpin + Send,
{
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

    pub async fn run(mut self, output_dir: &Path) -> TarExtractionResult {
        let (dir, created) = match prepare_output_dir(output_dir).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.report.fail(e);
                return self.finish(output_dir.to_path_buf(), false).await;
            }
        };
        self.report.snapshot_mut().output_path = Some(dir.clone());

        let mut state = TarState::AwaitingHeader;
        let mut info = TarReaderInfo::new(&dir);
        while state != TarState::Done {
            (state, info) = match state {
                TarState::AwaitingHeader => self.await_header(info).await,
                TarState::ParsingFile => self.parse_file(info).await,
                TarState::Realigning => self.realign(info).await,
                TarState::Done => (TarState::Done, info),
            };
        }
        self.finish(dir, created).await
    }

    async fn await_header(&mut self, info: TarReaderInfo) -> (TarState, TarReaderInfo) {
        let raw = match read_block(self.input).await {
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

    async fn parse_file(&mut self, info: TarReaderInfo) -> (TarState, TarReaderInfo) {
        let Some(block) = info.header() else {
            return (TarState::AwaitingHeader, info);
        };
        let name = block.header.path();
        let size = block.header.size;
        let (info, outcome) = match block.header.kind() {
            EntryKind::File => {
                self.expected += 1;
                self.write_file(info, &name).await
            }
            EntryKind::Directory => {
                let outcome = self.make_directory(&info, &name).await;
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
            let err = Error::TarExtractionFailedForCurrentHeader {
                name,
                source: Box::new(source),
            };
            self.report.error_line(err.to_string());
            self.failures.push(err);
        }

        let skip = info.distance_to_next_header() as i64;
        match self.input.seek(SeekFrom::Current(skip)).await {
            Ok(_) => (TarState::AwaitingHeader, info),
            Err(e) => {
                self.report.fail(Error::exception("tar entry skip", e));
                (TarState::Done, info)
            }
        }
    }

    async fn write_file(&mut self, info: TarReaderInfo, name: &str) -> (TarReaderInfo, Result<()>) {
        const ORIGIN: &str = "tar entry write";
        let target = match entry_target(info.output_dir(), name, self.options.sanitize_paths) {
            Ok(target) => target,
            Err(e) => return (info, Err(e)),
        };
        let mut info = info.with_target(target.clone());
        let input = &mut *self.input;
        let copied = guarded_async(ORIGIN, async {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await.or_fault(ORIGIN)?;
            }
            let file = File::create(&target)
                .await
                .map_err(|e| Error::OutputUnavailable {
                    reason: format!("cannot create '{}': {e}", target.display()),
                })?;
            let mut writer = BufWriter::new(file);
            let mut chunk = [0u8; BLOCK_SIZE];
            loop {
                let want = info.next_chunk();
                if want == 0 {
                    break;
                }
                let n = read_some(input, &mut chunk[..want]).await?;
                if n == 0 {
                    break;
                }
                writer.write_all(&chunk[..n]).await.or_fault(ORIGIN)?;
                info = info.with_consumed(n as u64);
            }
            writer.flush().await.or_fault(ORIGIN)
        })
        .await;

        let outcome = match copied.and_then(|()| complete(&info)) {
            Ok(()) => ensure_not_empty(&target).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                self.report
                    .info(format!("extracted '{name}' ({} byte(s))", info.consumed()));
                self.extracted.push(target);
                (info, Ok(()))
            }
            Err(e) => {
                match fs::remove_file(&target).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => self.report.error_line(format!(
                        "could not remove partial output '{}': {err}",
                        target.display()
                    )),
                }
                (info, Err(e))
            }
        }
    }

    async fn make_directory(&mut self, info: &TarReaderInfo, name: &str) -> Result<()> {
        let target = entry_target(info.output_dir(), name, self.options.sanitize_paths)?;
        fs::create_dir_all(&target)
            .await
            .or_fault("tar directory entry")?;
        self.report
            .debug(format!("created directory '{}'", target.display()));
        Ok(())
    }

    async fn realign(&mut self, info: TarReaderInfo) -> (TarState, TarReaderInfo) {
        let Some(block) = info.header() else {
            return (TarState::AwaitingHeader, info);
        };
        let junk_offset = block.junk_offset();
        let checksum_only = block.valid_header;
        let name = block.header.path();
        match junk_offset {
            Some(offset) => {
                let seek = self
                    .input
                    .seek(SeekFrom::Current(realignment_seek(offset)))
                    .await;
                match seek {
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
                }
            }
            None if checksum_only => self.report.error_line(format!(
                "checksum mismatch in header of '{name}', skipping one block"
            )),
            None => self
                .report
                .debug("no header magic in block, skipping one block"),
        }
        (TarState::AwaitingHeader, info)
    }

    async fn finish(mut self, output_dir: PathBuf, created: bool) -> TarExtractionResult {
        if self.extracted.is_empty() {
            self.report.fail(Error::TarExtractionFailedForEntireArchive {
                expected: self.expected,
            });
            if created && dir_is_empty(&output_dir).await && fs::remove_dir(&output_dir).await.is_ok()
            {
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

async fn prepare_output_dir(dir: &Path) -> Result<(PathBuf, bool)> {
    let unavailable = |e: io::Error| Error::OutputUnavailable {
        reason: format!("'{}': {e}", dir.display()),
    };
    let dir = std::path::absolute(dir).map_err(unavailable)?;
    match fs::metadata(&dir).await {
        Ok(meta) if meta.is_dir() => Ok((dir, false)),
        Ok(_) => Err(Error::OutputUnavailable {
            reason: format!("'{}' is not a directory", dir.display()),
        }),
        Err(_) => {
            fs::create_dir_all(&dir).await.map_err(unavailable)?;
            Ok((dir, true))
        }
    }
}

async fn dir_is_empty(dir: &Path) -> bool {
    match fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

async fn ensure_not_empty(target: &Path) -> Result<()> {
    let len = fs::metadata(target)
        .await
        .or_fault("tar entry metadata")?
        .len();
    if len == 0 {
        return Err(Error::OutputEmpty {
            target: target.display().to_string(),
        });
    }
    Ok(())
}

async fn read_some<R: AsyncRead + Unpin>(input: &mut R, buf: &mut [u8]) -> Result<usize> {
    loop {
        match input.read(buf).await {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::exception("tar read", e)),
        }
    }
}

async fn read_block<R: AsyncRead + Unpin>(input: &mut R) -> Result<Option<[u8; BLOCK_SIZE]>> {
    let mut block = [0u8; BLOCK_SIZE];
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = read_some(input, &mut block[filled..]).await?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
    }
    Ok(Some(block))
}

pub async fn extract_tar_file_async(
    archive: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    options: &ExtractOptions,
) -> TarExtractionResult {
    let archive = archive.as_ref();
    let mut report = OperationReport::new("extract_tar_file_async");
    report.snapshot_mut().input_path = Some(archive.to_path_buf());
    match File::open(archive).await {
        Ok(file) => {
            let mut input = BufReader::new(file);
            AsyncTarExtractor::new(report, &mut input, options)
                .run(output_dir.as_ref())
                .await
        }
        Err(e) => {
            report.fail(Error::InputUnavailable {
                reason: format!("'{}': {e}", archive.display()),
            });
            unavailable_input(report, output_dir.as_ref())
        }
    }
}

pub async fn extract_tar_stream_async<R>(
    input: &mut R,
    output_dir: impl AsRef<Path>,
    options: &ExtractOptions,
) -> TarExtractionResult
where
    R: AsyncRead + AsyncSeek + Unpin + Send,
{
    let mut report = OperationReport::new("extract_tar_stream_async");
    report.snapshot_mut().input_is_stream = true;
    AsyncTarExtractor::new(report, input, options)
        .run(output_dir.as_ref())
        .await
}
