//! Byte sources and sinks the engines run over.
//!
//! An engine never knows whether it reads a file or a caller stream: it
//! talks to a [`ByteSource`] and a [`ByteSink`]. File adapters own the handles
//! they open and drop them before returning; stream adapters borrow the
//! caller's stream and never close it.

pub mod nonblocking;

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::gzip::GZipFormatData;
use crate::outcome::FaultExt;
use crate::report::InputSnapshot;

pub trait ByteSource {
    /// Records what kind of input this is.
    fn describe(&self, snapshot: &mut InputSnapshot);

    /// Checks the input can be read at all.
    fn verify(&mut self) -> Result<()>;

    fn format_data(&mut self) -> Result<GZipFormatData>;

    /// A reader positioned at the start of the input.
    fn reader(&mut self) -> Result<Box<dyn Read + '_>>;

    /// The whole input, in memory.
    fn read_all(&mut self) -> Result<Vec<u8>>;

    /// Makes later reads independent of anything an earlier attempt consumed.
    fn preserve(&mut self) -> Result<()>;
}

pub trait ByteSink {
    fn describe(&self, snapshot: &mut InputSnapshot);

    /// Checks the output can be written, creating what is missing.
    fn verify(&mut self) -> Result<()>;

    fn writer(&mut self) -> Result<Box<dyn Write + '_>>;

    /// Bytes written since verification or the last reset.
    fn written(&mut self) -> Result<u64>;

    /// Returns the sink to the state it had at verification.
    fn reset(&mut self) -> Result<()>;

    /// Removes what was written.
    fn discard(&mut self) -> Result<()>;
}

/// Absolute form of `path`, with its parent directories created.
pub fn resolve_output_path(path: &Path) -> Result<PathBuf> {
    let resolved = std::path::absolute(path).map_err(|e| Error::OutputUnavailable {
        reason: format!("cannot resolve '{}': {e}", path.display()),
    })?;
    if let Some(parent) = resolved.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::OutputUnavailable {
            reason: format!("cannot create '{}': {e}", parent.display()),
        })?;
    }
    Ok(resolved)
}

fn input_unavailable(path: &Path, reason: impl std::fmt::Display) -> Error {
    Error::InputUnavailable {
        reason: format!("'{}': {reason}", path.display()),
    }
}

/// Input read from a file the source opens itself.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File> {
        File::open(&self.path).map_err(|e| input_unavailable(&self.path, e))
    }
}

impl ByteSource for FileSource {
    fn describe(&self, snapshot: &mut InputSnapshot) {
        snapshot.input_path = Some(self.path.clone());
        snapshot.input_is_stream = false;
    }

    fn verify(&mut self) -> Result<()> {
        let meta = fs::metadata(&self.path).map_err(|e| input_unavailable(&self.path, e))?;
        if !meta.is_file() {
            return Err(input_unavailable(&self.path, "not a regular file"));
        }
        self.open().map(drop)
    }

    fn format_data(&mut self) -> Result<GZipFormatData> {
        let mut file = self.open()?;
        GZipFormatData::read_from(&mut file)
    }

    fn reader(&mut self) -> Result<Box<dyn Read + '_>> {
        Ok(Box::new(BufReader::new(self.open()?)))
    }

    fn read_all(&mut self) -> Result<Vec<u8>> {
        fs::read(&self.path).or_fault("input file read")
    }

    fn preserve(&mut self) -> Result<()> {
        // reopening the file gives every attempt pristine bytes
        Ok(())
    }
}

/// Input read from a stream owned by the caller.
///
/// The input starts at the stream position found at verification.
pub struct StreamSource<'a, R> {
    stream: &'a mut R,
    start: u64,
    copy: Option<Vec<u8>>,
}

impl<'a, R: Read + Seek> StreamSource<'a, R> {
    pub fn new(stream: &'a mut R) -> Self {
        Self {
            stream,
            start: 0,
            copy: None,
        }
    }
}

impl<R: Read + Seek> ByteSource for StreamSource<'_, R> {
    fn describe(&self, snapshot: &mut InputSnapshot) {
        snapshot.input_path = None;
        snapshot.input_is_stream = true;
    }

    fn verify(&mut self) -> Result<()> {
        self.start = self
            .stream
            .stream_position()
            .map_err(|e| Error::InputUnavailable {
                reason: format!("stream is not seekable: {e}"),
            })?;
        Ok(())
    }

    fn format_data(&mut self) -> Result<GZipFormatData> {
        match &self.copy {
            Some(copy) => GZipFormatData::from_slice(copy),
            None => {
                self.stream
                    .seek(SeekFrom::Start(self.start))
                    .or_fault("input stream seek")?;
                GZipFormatData::read_from(&mut *self.stream)
            }
        }
    }

    fn reader(&mut self) -> Result<Box<dyn Read + '_>> {
        match &self.copy {
            Some(copy) => Ok(Box::new(copy.as_slice())),
            None => {
                self.stream
                    .seek(SeekFrom::Start(self.start))
                    .or_fault("input stream seek")?;
                Ok(Box::new(&mut *self.stream))
            }
        }
    }

    fn read_all(&mut self) -> Result<Vec<u8>> {
        if let Some(copy) = &self.copy {
            return Ok(copy.clone());
        }
        self.stream
            .seek(SeekFrom::Start(self.start))
            .or_fault("input stream seek")?;
        let mut data = Vec::new();
        self.stream
            .read_to_end(&mut data)
            .or_fault("input stream read")?;
        Ok(data)
    }

    fn preserve(&mut self) -> Result<()> {
        if self.copy.is_none() {
            self.copy = Some(self.read_all()?);
        }
        Ok(())
    }
}

/// Output written to a file, created or truncated on demand.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The output path; absolute once verified.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create(&self) -> Result<File> {
        File::create(&self.path).map_err(|e| Error::OutputUnavailable {
            reason: format!("cannot create '{}': {e}", self.path.display()),
        })
    }
}

impl ByteSink for FileSink {
    fn describe(&self, snapshot: &mut InputSnapshot) {
        snapshot.output_path = Some(self.path.clone());
        snapshot.output_is_stream = false;
    }

    fn verify(&mut self) -> Result<()> {
        self.path = resolve_output_path(&self.path)?;
        if self.path.is_dir() {
            return Err(Error::OutputUnavailable {
                reason: format!("'{}' is a directory", self.path.display()),
            });
        }
        Ok(())
    }

    fn writer(&mut self) -> Result<Box<dyn Write + '_>> {
        Ok(Box::new(BufWriter::new(self.create()?)))
    }

    fn written(&mut self) -> Result<u64> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(Error::exception("output file metadata", e)),
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.create().map(drop)
    }

    fn discard(&mut self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::exception("output file removal", e)),
        }
    }
}

/// Output written to a stream owned by the caller.
///
/// Reset and discard rewind to the position found at verification; the
/// stream is never truncated.
pub struct StreamSink<'a, W> {
    stream: &'a mut W,
    start: u64,
}

impl<'a, W: Write + Seek> StreamSink<'a, W> {
    pub fn new(stream: &'a mut W) -> Self {
        Self { stream, start: 0 }
    }
}

impl<W: Write + Seek> ByteSink for StreamSink<'_, W> {
    fn describe(&self, snapshot: &mut InputSnapshot) {
        snapshot.output_path = None;
        snapshot.output_is_stream = true;
    }

    fn verify(&mut self) -> Result<()> {
        self.start = self
            .stream
            .stream_position()
            .map_err(|e| Error::OutputUnavailable {
                reason: format!("stream is not seekable: {e}"),
            })?;
        Ok(())
    }

    fn writer(&mut self) -> Result<Box<dyn Write + '_>> {
        Ok(Box::new(&mut *self.stream))
    }

    fn written(&mut self) -> Result<u64> {
        let position = self
            .stream
            .stream_position()
            .or_fault("output stream position")?;
        Ok(position.saturating_sub(self.start))
    }

    fn reset(&mut self) -> Result<()> {
        self.stream
            .seek(SeekFrom::Start(self.start))
            .or_fault("output stream reset")
            .map(drop)
    }

    fn discard(&mut self) -> Result<()> {
        self.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Cursor;

    #[test]
    fn missing_input_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = FileSource::new(dir.path().join("nope.gz"));
        assert_eq!(source.verify().unwrap_err().kind(), ErrorKind::InputUnavailable);

        let mut dir_source = FileSource::new(dir.path());
        assert_eq!(dir_source.verify().unwrap_err().kind(), ErrorKind::InputUnavailable);
    }

    #[test]
    fn file_sink_creates_parents_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path().join("a/b/out.bin"));
        sink.verify().unwrap();
        assert!(sink.path().is_absolute());
        assert!(dir.path().join("a/b").is_dir());

        {
            let mut writer = sink.writer().unwrap();
            writer.write_all(b"abc").unwrap();
            writer.flush().unwrap();
        }
        assert_eq!(sink.written().unwrap(), 3);
        sink.reset().unwrap();
        assert_eq!(sink.written().unwrap(), 0);
        sink.discard().unwrap();
        assert!(!sink.path().exists());
        // discarding twice is fine
        sink.discard().unwrap();
    }

    #[test]
    fn stream_sink_counts_from_its_start() {
        let mut out = Cursor::new(Vec::new());
        out.write_all(b"prefix").unwrap();
        let mut sink = StreamSink::new(&mut out);
        sink.verify().unwrap();
        sink.writer().unwrap().write_all(b"body").unwrap();
        assert_eq!(sink.written().unwrap(), 4);
        sink.reset().unwrap();
        assert_eq!(sink.written().unwrap(), 0);
        assert_eq!(out.position(), 6);
    }

    #[test]
    fn stream_source_preserve_detaches_from_the_stream() {
        let mut input = Cursor::new(b"xxhello world".to_vec());
        input.set_position(2);
        let mut source = StreamSource::new(&mut input);
        source.verify().unwrap();
        source.preserve().unwrap();

        let mut text = String::new();
        source.reader().unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello world");
        // a second reader still sees the same bytes
        assert_eq!(source.read_all().unwrap(), b"hello world");
    }
}
