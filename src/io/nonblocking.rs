//! Non-blocking sources and sinks on top of tokio.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{
    AsyncBufRead, AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, BufReader,
    BufWriter,
};

use crate::error::{Error, Result};
use crate::gzip::GZipFormatData;
use crate::outcome::FaultExt;
use crate::report::InputSnapshot;

pub type BoxedReader<'a> = Box<dyn AsyncBufRead + Unpin + Send + 'a>;
pub type BoxedWriter<'a> = Box<dyn AsyncWrite + Unpin + Send + 'a>;

#[allow(async_fn_in_trait)]
pub trait AsyncByteSource {
    fn describe(&self, snapshot: &mut InputSnapshot);

    async fn verify(&mut self) -> Result<()>;

    async fn format_data(&mut self) -> Result<GZipFormatData>;

    async fn reader(&mut self) -> Result<BoxedReader<'_>>;

    async fn read_all(&mut self) -> Result<Vec<u8>>;

    async fn preserve(&mut self) -> Result<()>;
}

#[allow(async_fn_in_trait)]
pub trait AsyncByteSink {
    fn describe(&self, snapshot: &mut InputSnapshot);

    async fn verify(&mut self) -> Result<()>;

    async fn writer(&mut self) -> Result<BoxedWriter<'_>>;

    async fn written(&mut self) -> Result<u64>;

    async fn reset(&mut self) -> Result<()>;

    async fn discard(&mut self) -> Result<()>;
}

/// Async counterpart of [`super::resolve_output_path`].
pub async fn resolve_output_path(path: &Path) -> Result<PathBuf> {
    let resolved = std::path::absolute(path).map_err(|e| Error::OutputUnavailable {
        reason: format!("cannot resolve '{}': {e}", path.display()),
    })?;
    if let Some(parent) = resolved.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::OutputUnavailable {
                reason: format!("cannot create '{}': {e}", parent.display()),
            })?;
    }
    Ok(resolved)
}

impl GZipFormatData {
    /// Async counterpart of [`GZipFormatData::read_from`].
    pub async fn read_from_async<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + AsyncSeek + Unpin,
    {
        const ORIGIN: &str = "gzip header/footer read";
        let start = reader.stream_position().await.or_fault(ORIGIN)?;
        let end = reader.seek(SeekFrom::End(0)).await.or_fault(ORIGIN)?;
        let available = end.saturating_sub(start);
        let outcome = if available < crate::gzip::FRAMING_LEN as u64 {
            Err(Error::ReadFailure {
                needed: crate::gzip::FRAMING_LEN,
                available,
            })
        } else {
            let mut framing = vec![0u8; crate::gzip::GZIP_HEADER_LEN];
            let mut footer = [0u8; crate::gzip::GZIP_FOOTER_LEN];
            let read = async {
                reader.seek(SeekFrom::Start(start)).await?;
                reader.read_exact(&mut framing).await?;
                reader
                    .seek(SeekFrom::Start(end - footer.len() as u64))
                    .await?;
                reader.read_exact(&mut footer).await?;
                Ok::<(), std::io::Error>(())
            }
            .await;
            read.or_fault(ORIGIN).and_then(|()| {
                framing.extend_from_slice(&footer);
                GZipFormatData::from_slice(&framing)
            })
        };
        reader.seek(SeekFrom::Start(start)).await.or_fault(ORIGIN)?;
        outcome
    }
}

fn input_unavailable(path: &Path, reason: impl std::fmt::Display) -> Error {
    Error::InputUnavailable {
        reason: format!("'{}': {reason}", path.display()),
    }
}

/// Input read from a file, opened with tokio.
#[derive(Debug, Clone)]
pub struct AsyncFileSource {
    path: PathBuf,
}

impl AsyncFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn open(&self) -> Result<File> {
        File::open(&self.path)
            .await
            .map_err(|e| input_unavailable(&self.path, e))
    }
}

impl AsyncByteSource for AsyncFileSource {
    fn describe(&self, snapshot: &mut InputSnapshot) {
        snapshot.input_path = Some(self.path.clone());
        snapshot.input_is_stream = false;
    }

    async fn verify(&mut self) -> Result<()> {
        let meta = fs::metadata(&self.path)
            .await
            .map_err(|e| input_unavailable(&self.path, e))?;
        if !meta.is_file() {
            return Err(input_unavailable(&self.path, "not a regular file"));
        }
        self.open().await.map(drop)
    }

    async fn format_data(&mut self) -> Result<GZipFormatData> {
        let mut file = self.open().await?;
        GZipFormatData::read_from_async(&mut file).await
    }

    async fn reader(&mut self) -> Result<BoxedReader<'_>> {
        Ok(Box::new(BufReader::new(self.open().await?)))
    }

    async fn read_all(&mut self) -> Result<Vec<u8>> {
        fs::read(&self.path).await.or_fault("input file read")
    }

    async fn preserve(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Input read from a caller-owned async stream, never closed here.
pub struct AsyncStreamSource<'a, R> {
    stream: &'a mut R,
    start: u64,
    copy: Option<Vec<u8>>,
}

impl<'a, R> AsyncStreamSource<'a, R>
where
    R: AsyncRead + AsyncSeek + Unpin + Send,
{
    pub fn new(stream: &'a mut R) -> Self {
        Self {
            stream,
            start: 0,
            copy: None,
        }
    }

    async fn rewind(&mut self) -> Result<()> {
        self.stream
            .seek(SeekFrom::Start(self.start))
            .await
            .or_fault("input stream seek")
            .map(drop)
    }
}

impl<R> AsyncByteSource for AsyncStreamSource<'_, R>
where
    R: AsyncRead + AsyncSeek + Unpin + Send,
{
    fn describe(&self, snapshot: &mut InputSnapshot) {
        snapshot.input_path = None;
        snapshot.input_is_stream = true;
    }

    async fn verify(&mut self) -> Result<()> {
        self.start = self
            .stream
            .stream_position()
            .await
            .map_err(|e| Error::InputUnavailable {
                reason: format!("stream is not seekable: {e}"),
            })?;
        Ok(())
    }

    async fn format_data(&mut self) -> Result<GZipFormatData> {
        if let Some(copy) = &self.copy {
            return GZipFormatData::from_slice(copy);
        }
        self.rewind().await?;
        GZipFormatData::read_from_async(&mut *self.stream).await
    }

    async fn reader(&mut self) -> Result<BoxedReader<'_>> {
        if self.copy.is_none() {
            self.rewind().await?;
        }
        match &self.copy {
            Some(copy) => Ok(Box::new(copy.as_slice())),
            None => Ok(Box::new(BufReader::new(&mut *self.stream))),
        }
    }

    async fn read_all(&mut self) -> Result<Vec<u8>> {
        if let Some(copy) = &self.copy {
            return Ok(copy.clone());
        }
        self.rewind().await?;
        let mut data = Vec::new();
        self.stream
            .read_to_end(&mut data)
            .await
            .or_fault("input stream read")?;
        Ok(data)
    }

    async fn preserve(&mut self) -> Result<()> {
        if self.copy.is_none() {
            let data = self.read_all().await?;
            self.copy = Some(data);
        }
        Ok(())
    }
}

/// Output written to a file, created with tokio.
#[derive(Debug, Clone)]
pub struct AsyncFileSink {
    path: PathBuf,
}

impl AsyncFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn create(&self) -> Result<File> {
        File::create(&self.path)
            .await
            .map_err(|e| Error::OutputUnavailable {
                reason: format!("cannot create '{}': {e}", self.path.display()),
            })
    }
}

impl AsyncByteSink for AsyncFileSink {
    fn describe(&self, snapshot: &mut InputSnapshot) {
        snapshot.output_path = Some(self.path.clone());
        snapshot.output_is_stream = false;
    }

    async fn verify(&mut self) -> Result<()> {
        self.path = resolve_output_path(&self.path).await?;
        if fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(Error::OutputUnavailable {
                reason: format!("'{}' is a directory", self.path.display()),
            });
        }
        Ok(())
    }

    async fn writer(&mut self) -> Result<BoxedWriter<'_>> {
        Ok(Box::new(BufWriter::new(self.create().await?)))
    }

    async fn written(&mut self) -> Result<u64> {
        match fs::metadata(&self.path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(Error::exception("output file metadata", e)),
        }
    }

    async fn reset(&mut self) -> Result<()> {
        self.create().await.map(drop)
    }

    async fn discard(&mut self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::exception("output file removal", e)),
        }
    }
}

/// Output written to a caller-owned async stream, rewound but never truncated.
pub struct AsyncStreamSink<'a, W> {
    stream: &'a mut W,
    start: u64,
}

impl<'a, W> AsyncStreamSink<'a, W>
where
    W: AsyncWrite + AsyncSeek + Unpin + Send,
{
    pub fn new(stream: &'a mut W) -> Self {
        Self { stream, start: 0 }
    }
}

impl<W> AsyncByteSink for AsyncStreamSink<'_, W>
where
    W: AsyncWrite + AsyncSeek + Unpin + Send,
{
    fn describe(&self, snapshot: &mut InputSnapshot) {
        snapshot.output_path = None;
        snapshot.output_is_stream = true;
    }

    async fn verify(&mut self) -> Result<()> {
        self.start = self
            .stream
            .stream_position()
            .await
            .map_err(|e| Error::OutputUnavailable {
                reason: format!("stream is not seekable: {e}"),
            })?;
        Ok(())
    }

    async fn writer(&mut self) -> Result<BoxedWriter<'_>> {
        Ok(Box::new(&mut *self.stream))
    }

    async fn written(&mut self) -> Result<u64> {
        let position = self
            .stream
            .stream_position()
            .await
            .or_fault("output stream position")?;
        Ok(position.saturating_sub(self.start))
    }

    async fn reset(&mut self) -> Result<()> {
        self.stream
            .seek(SeekFrom::Start(self.start))
            .await
            .or_fault("output stream reset")
            .map(drop)
    }

    async fn discard(&mut self) -> Result<()> {
        self.reset().await
    }
}
