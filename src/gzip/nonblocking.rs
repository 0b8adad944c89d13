//! Non-blocking decompression strategies.
//!
//! Same control flow as [`super::decompress`], with tokio I/O and the
//! async-compression decoders underneath.

use std::path::Path;

use async_compression::tokio::bufread::{DeflateDecoder, GzipDecoder};
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::gzip::{GZIP_FOOTER_LEN, GZIP_HEADER_LEN, GZipFormatData};
use crate::io::nonblocking::{
    AsyncByteSink, AsyncByteSource, AsyncFileSink, AsyncFileSource, AsyncStreamSink,
    AsyncStreamSource,
};
use crate::options::{Algorithm, DecompressOptions};
use crate::outcome::{FaultExt, OutcomeExt, guarded_async};
use crate::report::{DecompressToFileResult, DecompressToStreamResult, OperationReport};

pub struct AsyncDecompressor<S, K> {
    source: S,
    sink: K,
    report: OperationReport,
}

impl<S: AsyncByteSource, K: AsyncByteSink> AsyncDecompressor<S, K> {
    pub fn new(operation: &'static str, source: S, sink: K) -> Self {
        let mut report = OperationReport::new(operation);
        source.describe(report.snapshot_mut());
        sink.describe(report.snapshot_mut());
        Self {
            source,
            sink,
            report,
        }
    }

    pub async fn run(mut self, options: &DecompressOptions) -> (OperationReport, K) {
        self.report
            .debug(format!("starting {} decompression", options.algorithm));
        let outcome = match self.prepare().await {
            Ok(_) => {
                let (source, sink, report) = (&mut self.source, &mut self.sink, &mut self.report);
                match options.algorithm {
                    Algorithm::Direct => direct(source, sink, report).await,
                    Algorithm::WithoutCrc => without_crc(source, sink, report).await,
                    Algorithm::WithRetry => with_retry(source, sink, report).await,
                }
            }
            Err(e) => Err(e),
        };
        self.finalize(outcome, options).await;
        self.sink.describe(self.report.snapshot_mut());
        (self.report, self.sink)
    }

    /// Verifies the pair, then reads and classifies the gzip framing.
    async fn prepare(&mut self) -> Result<GZipFormatData> {
        self.source.verify().await?;
        self.sink.verify().await?;
        self.report.debug("input and output verified");

        let format = self.source.format_data().await?;
        let snapshot = self.report.snapshot_mut();
        snapshot.header = Some(format.header_display());
        snapshot.footer = Some(format.footer_display());
        self.report
            .debug(format!("gzip header: {}", format.header_display()));
        self.report
            .debug(format!("gzip footer: {}", format.footer_display()));
        if !format.has_gzip_signature() {
            return Err(Error::NoGzipSignature {
                header: format.header_display(),
            });
        }
        Ok(format)
    }

    async fn finalize(&mut self, outcome: Result<u64>, options: &DecompressOptions) {
        match outcome {
            Ok(written) => {
                self.report
                    .info(format!("decompressed {written} byte(s)"));
                self.report.succeed();
            }
            Err(err) => {
                self.report.fail(err);
                if !options.keep_partial_output && self.report.snapshot().output_path.is_some() {
                    if let Err(e) = self.sink.discard().await {
                        self.report.fail(e);
                    }
                }
            }
        }
    }
}

async fn direct<S, K>(source: &mut S, sink: &mut K, report: &mut OperationReport) -> Result<u64>
where
    S: AsyncByteSource,
    K: AsyncByteSink,
{
    const ORIGIN: &str = "direct decompression";
    let inflated = guarded_async(ORIGIN, async {
        let reader = source.reader().await?;
        let mut writer = sink.writer().await?;
        let mut decoder = GzipDecoder::new(reader);
        tokio::io::copy(&mut decoder, &mut writer)
            .await
            .or_fault(ORIGIN)?;
        writer.flush().await.or_fault(ORIGIN)?;
        Ok(())
    })
    .await;
    let outcome = match inflated {
        Ok(()) => ensure_not_empty(sink, ORIGIN).await,
        Err(e) => Err(e),
    };
    outcome.either_with(
        report,
        |r, n| r.debug(format!("direct decompression wrote {n} byte(s)")),
        |r, e| r.error_line(format!("direct decompression failed: {e}")),
    )
}

/// See the blocking version: the optional header fields are not skipped.
async fn without_crc<S, K>(
    source: &mut S,
    sink: &mut K,
    report: &mut OperationReport,
) -> Result<u64>
where
    S: AsyncByteSource,
    K: AsyncByteSink,
{
    const ORIGIN: &str = "decompression without crc";
    let inflated = guarded_async(ORIGIN, async {
        let data = source.read_all().await?;
        let format = GZipFormatData::from_slice(&data)?;
        if format.has_optional_fields() {
            report.debug(format!(
                "header flags 0x{:02x} announce optional fields; they are not skipped",
                format.flags()
            ));
        }
        let payload = &data[GZIP_HEADER_LEN..data.len() - GZIP_FOOTER_LEN];
        report.debug(format!(
            "raw-inflating {} byte(s) of trimmed payload",
            payload.len()
        ));
        sink.reset().await?;
        let mut writer = sink.writer().await?;
        let mut decoder = DeflateDecoder::new(payload);
        tokio::io::copy(&mut decoder, &mut writer)
            .await
            .or_fault(ORIGIN)?;
        writer.flush().await.or_fault(ORIGIN)?;
        Ok(())
    })
    .await;
    let outcome = match inflated {
        Ok(()) => ensure_not_empty(sink, ORIGIN).await,
        Err(e) => Err(e),
    };
    outcome.either_with(
        report,
        |r, n| r.debug(format!("decompression without crc wrote {n} byte(s)")),
        |r, e| r.error_line(format!("decompression without crc failed: {e}")),
    )
}

async fn with_retry<S, K>(
    source: &mut S,
    sink: &mut K,
    report: &mut OperationReport,
) -> Result<u64>
where
    S: AsyncByteSource,
    K: AsyncByteSink,
{
    source.preserve().await?;
    match direct(source, sink, report).await {
        Ok(written) => Ok(written),
        Err(_) => {
            report.info("retrying without crc validation");
            sink.reset().await?;
            without_crc(source, sink, report)
                .await
                .map_err(|e| Error::DeflateOperationFailed {
                    source: Box::new(e),
                })
        }
    }
}

async fn ensure_not_empty<K: AsyncByteSink>(sink: &mut K, stage: &str) -> Result<u64> {
    let written = sink.written().await?;
    if written == 0 {
        sink.discard().await?;
        return Err(Error::OutputEmpty {
            target: format!("{stage} output"),
        });
    }
    Ok(written)
}

pub async fn decompress_file_to_file_async(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    options: &DecompressOptions,
) -> DecompressToFileResult {
    let source = AsyncFileSource::new(input.as_ref());
    let sink = AsyncFileSink::new(output.as_ref());
    let (report, sink) = AsyncDecompressor::new("decompress_file_to_file_async", source, sink)
        .run(options)
        .await;
    DecompressToFileResult {
        output_path: sink.path().to_path_buf(),
        report,
    }
}

pub async fn decompress_file_to_stream_async<W>(
    input: impl AsRef<Path>,
    output: &mut W,
    options: &DecompressOptions,
) -> DecompressToStreamResult
where
    W: AsyncWrite + AsyncSeek + Unpin + Send,
{
    let source = AsyncFileSource::new(input.as_ref());
    let (report, mut sink) = AsyncDecompressor::new(
        "decompress_file_to_stream_async",
        source,
        AsyncStreamSink::new(output),
    )
    .run(options)
    .await;
    DecompressToStreamResult {
        bytes_written: written_on_success(&report, &mut sink).await,
        report,
    }
}

pub async fn decompress_stream_to_file_async<R>(
    input: &mut R,
    output: impl AsRef<Path>,
    options: &DecompressOptions,
) -> DecompressToFileResult
where
    R: AsyncRead + AsyncSeek + Unpin + Send,
{
    let sink = AsyncFileSink::new(output.as_ref());
    let (report, sink) = AsyncDecompressor::new(
        "decompress_stream_to_file_async",
        AsyncStreamSource::new(input),
        sink,
    )
    .run(options)
    .await;
    DecompressToFileResult {
        output_path: sink.path().to_path_buf(),
        report,
    }
}

pub async fn decompress_stream_to_stream_async<R, W>(
    input: &mut R,
    output: &mut W,
    options: &DecompressOptions,
) -> DecompressToStreamResult
where
    R: AsyncRead + AsyncSeek + Unpin + Send,
    W: AsyncWrite + AsyncSeek + Unpin + Send,
{
    let (report, mut sink) = AsyncDecompressor::new(
        "decompress_stream_to_stream_async",
        AsyncStreamSource::new(input),
        AsyncStreamSink::new(output),
    )
    .run(options)
    .await;
    DecompressToStreamResult {
        bytes_written: written_on_success(&report, &mut sink).await,
        report,
    }
}

async fn written_on_success<K: AsyncByteSink>(report: &OperationReport, sink: &mut K) -> u64 {
    if report.success() {
        sink.written().await.unwrap_or(0)
    } else {
        0
    }
}
