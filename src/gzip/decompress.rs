//! Blocking decompression strategies.
//!
//! Every topology goes through [`Decompressor`]: verify the I/O pair, read
//! and classify the gzip framing, run the chosen [`Algorithm`], finalize.
//! The four public entry points only pick the source and sink adapters.

use std::io::{self, Read, Seek, Write};
use std::path::Path;

use flate2::read::{DeflateDecoder, GzDecoder};

use crate::error::{Error, Result};
use crate::gzip::{GZIP_FOOTER_LEN, GZIP_HEADER_LEN, GZipFormatData};
use crate::io::{ByteSink, ByteSource, FileSink, FileSource, StreamSink, StreamSource};
use crate::options::{Algorithm, DecompressOptions};
use crate::outcome::{FaultExt, OutcomeExt, guarded};
use crate::report::{DecompressToFileResult, DecompressToStreamResult, OperationReport};

/// One decompression run over a source/sink pair.
pub struct Decompressor<S, K> {
    source: S,
    sink: K,
    report: OperationReport,
}

impl<S: ByteSource, K: ByteSink> Decompressor<S, K> {
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

    /// Runs the whole pipeline and returns the finalized report with the sink.
    pub fn run(mut self, options: &DecompressOptions) -> (OperationReport, K) {
        self.report
            .debug(format!("starting {} decompression", options.algorithm));
        let outcome = self
            .verify_pair()
            .and_then(|()| self.inspect())
            .and_then(|_| match options.algorithm {
                Algorithm::Direct => direct(&mut self.source, &mut self.sink, &mut self.report),
                Algorithm::WithoutCrc => {
                    without_crc(&mut self.source, &mut self.sink, &mut self.report)
                }
                Algorithm::WithRetry => {
                    with_retry(&mut self.source, &mut self.sink, &mut self.report)
                }
            });
        self.finalize(outcome, options);
        // the sink describes its final, resolved location
        self.sink.describe(self.report.snapshot_mut());
        (self.report, self.sink)
    }

    fn verify_pair(&mut self) -> Result<()> {
        self.source.verify()?;
        self.sink.verify()?;
        self.report.debug("input and output verified");
        Ok(())
    }

    /// Reads the framing into the snapshot and checks the signature.
    fn inspect(&mut self) -> Result<GZipFormatData> {
        let format = self.source.format_data()?;
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

    fn finalize(&mut self, outcome: Result<u64>, options: &DecompressOptions) {
        match outcome {
            Ok(written) => {
                self.report
                    .info(format!("decompressed {written} byte(s)"));
                self.report.succeed();
            }
            Err(err) => {
                self.report.fail(err);
                if !options.keep_partial_output && self.report.snapshot().output_path.is_some() {
                    if let Err(e) = self.sink.discard() {
                        self.report.fail(e);
                    }
                }
            }
        }
    }
}

/// Inflates the whole gzip member; the decoder checks CRC and size.
fn direct<S, K>(source: &mut S, sink: &mut K, report: &mut OperationReport) -> Result<u64>
where
    S: ByteSource,
    K: ByteSink,
{
    guarded("direct decompression", || {
        let reader = source.reader()?;
        let mut writer = sink.writer()?;
        let mut decoder = GzDecoder::new(reader);
        io::copy(&mut decoder, &mut writer).or_fault("direct decompression")?;
        writer.flush().or_fault("direct decompression")?;
        Ok(())
    })
    .and_then(|()| ensure_not_empty(sink, "direct decompression"))
    .either_with(
        report,
        |r, n| r.debug(format!("direct decompression wrote {n} byte(s)")),
        |r, e| r.error_line(format!("direct decompression failed: {e}")),
    )
}

/// Raw-inflates the input with the fixed framing cut off, skipping every
/// CRC and size check.
///
/// Optional header fields (FNAME and friends) are not skipped: the body is
/// assumed to start right after the 10 fixed bytes.
fn without_crc<S, K>(source: &mut S, sink: &mut K, report: &mut OperationReport) -> Result<u64>
where
    S: ByteSource,
    K: ByteSink,
{
    guarded("decompression without crc", || {
        let data = source.read_all()?;
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
        sink.reset()?;
        let mut writer = sink.writer()?;
        let mut decoder = DeflateDecoder::new(payload);
        io::copy(&mut decoder, &mut writer).or_fault("decompression without crc")?;
        writer.flush().or_fault("decompression without crc")?;
        Ok(())
    })
    .and_then(|()| ensure_not_empty(sink, "decompression without crc"))
    .either_with(
        report,
        |r, n| r.debug(format!("decompression without crc wrote {n} byte(s)")),
        |r, e| r.error_line(format!("decompression without crc failed: {e}")),
    )
}

/// Direct first; on failure, rewinds the sink and runs [`without_crc`].
fn with_retry<S, K>(source: &mut S, sink: &mut K, report: &mut OperationReport) -> Result<u64>
where
    S: ByteSource,
    K: ByteSink,
{
    source.preserve()?;
    match direct(source, sink, report) {
        Ok(written) => Ok(written),
        Err(_) => {
            report.info("retrying without crc validation");
            sink.reset()?;
            without_crc(source, sink, report).map_err(|e| Error::DeflateOperationFailed {
                source: Box::new(e),
            })
        }
    }
}

/// Fails with `OutputEmpty` (discarding the output) when nothing was written.
fn ensure_not_empty<K: ByteSink>(sink: &mut K, stage: &str) -> Result<u64> {
    let written = sink.written()?;
    if written == 0 {
        sink.discard()?;
        return Err(Error::OutputEmpty {
            target: format!("{stage} output"),
        });
    }
    Ok(written)
}

pub fn decompress_file_to_file(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    options: &DecompressOptions,
) -> DecompressToFileResult {
    let source = FileSource::new(input.as_ref());
    let sink = FileSink::new(output.as_ref());
    let (report, sink) = Decompressor::new("decompress_file_to_file", source, sink).run(options);
    DecompressToFileResult {
        output_path: sink.path().to_path_buf(),
        report,
    }
}

pub fn decompress_file_to_stream<W: Write + Seek>(
    input: impl AsRef<Path>,
    output: &mut W,
    options: &DecompressOptions,
) -> DecompressToStreamResult {
    let source = FileSource::new(input.as_ref());
    let (report, mut sink) =
        Decompressor::new("decompress_file_to_stream", source, StreamSink::new(output))
            .run(options);
    DecompressToStreamResult {
        bytes_written: written_on_success(&report, &mut sink),
        report,
    }
}

pub fn decompress_stream_to_file<R: Read + Seek>(
    input: &mut R,
    output: impl AsRef<Path>,
    options: &DecompressOptions,
) -> DecompressToFileResult {
    let sink = FileSink::new(output.as_ref());
    let (report, sink) =
        Decompressor::new("decompress_stream_to_file", StreamSource::new(input), sink)
            .run(options);
    DecompressToFileResult {
        output_path: sink.path().to_path_buf(),
        report,
    }
}

pub fn decompress_stream_to_stream<R: Read + Seek, W: Write + Seek>(
    input: &mut R,
    output: &mut W,
    options: &DecompressOptions,
) -> DecompressToStreamResult {
    let (report, mut sink) = Decompressor::new(
        "decompress_stream_to_stream",
        StreamSource::new(input),
        StreamSink::new(output),
    )
    .run(options);
    DecompressToStreamResult {
        bytes_written: written_on_success(&report, &mut sink),
        report,
    }
}

fn written_on_success<K: ByteSink>(report: &OperationReport, sink: &mut K) -> u64 {
    if report.success() {
        sink.written().unwrap_or(0)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs;
    use std::io::{Cursor, SeekFrom};

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn sample_text() -> Vec<u8> {
        (0..400)
            .map(|i| format!("line {i}: the quick brown fox\n"))
            .collect::<String>()
            .into_bytes()
    }

    /// A valid member whose footer CRC has been flipped.
    fn gzip_with_bad_crc(data: &[u8]) -> Vec<u8> {
        let mut gz = gzip(data);
        let crc_at = gz.len() - 8;
        gz[crc_at] ^= 0xFF;
        gz
    }

    fn retry() -> DecompressOptions {
        DecompressOptions::default().with_algorithm(Algorithm::WithRetry)
    }

    fn direct_only() -> DecompressOptions {
        DecompressOptions::default().with_algorithm(Algorithm::Direct)
    }

    #[test]
    fn direct_round_trips_file_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let payload = sample_text();
        let input = dir.path().join("in.gz");
        fs::write(&input, gzip(&payload)).unwrap();

        let result = decompress_file_to_file(&input, dir.path().join("out/plain.txt"), &direct_only());
        assert!(result.success(), "{}", result.report.log());
        assert!(result.output_path.is_absolute());
        assert_eq!(fs::read(&result.output_path).unwrap(), payload);

        let snapshot = result.report.snapshot();
        assert_eq!(snapshot.input_path.as_deref(), Some(input.as_path()));
        assert!(!snapshot.input_is_stream);
        assert!(snapshot.header.as_deref().unwrap().starts_with("1f 8b"));
    }

    #[test]
    fn round_trips_every_stream_topology() {
        let payload = sample_text();
        let compressed = gzip(&payload);

        let mut input = Cursor::new(compressed.clone());
        let mut output = Cursor::new(Vec::new());
        let result = decompress_stream_to_stream(&mut input, &mut output, &direct_only());
        assert!(result.success());
        assert_eq!(result.bytes_written, payload.len() as u64);
        assert_eq!(output.into_inner(), payload);

        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("in.gz");
        fs::write(&input_path, &compressed).unwrap();
        let mut output = Cursor::new(Vec::new());
        let result = decompress_file_to_stream(&input_path, &mut output, &retry());
        assert!(result.success());
        assert!(result.report.snapshot().output_is_stream);
        assert_eq!(output.into_inner(), payload);

        let mut input = Cursor::new(compressed);
        let result = decompress_stream_to_file(&mut input, dir.path().join("s2f.txt"), &retry());
        assert!(result.success());
        assert!(result.report.snapshot().input_is_stream);
        assert_eq!(fs::read(result.output_path).unwrap(), payload);
    }

    #[test]
    fn too_short_input_is_a_read_failure() {
        let mut input = Cursor::new(vec![0x1F, 0x8B, 0x08]);
        let mut output = Cursor::new(Vec::new());
        let result = decompress_stream_to_stream(&mut input, &mut output, &retry());
        assert!(!result.success());
        assert_eq!(result.report.error().map(Error::kind), Some(ErrorKind::ReadFailure));
    }

    #[test]
    fn missing_signature_fails_with_header_shown() {
        let mut input = Cursor::new(b"this is plain text, not gzip at all".to_vec());
        let mut output = Cursor::new(Vec::new());
        let result = decompress_stream_to_stream(&mut input, &mut output, &retry());
        assert!(!result.success());
        let err = result.report.error().unwrap();
        assert_eq!(err.kind(), ErrorKind::NoGzipSignature);
        assert!(err.to_string().contains("74 68 69 73"));
        assert!(result.report.snapshot().header.is_some());
    }

    #[test]
    fn empty_body_fails_and_keeps_snapshot() {
        let mut data = vec![0x1F, 0x8B, 0x08, 0, 0, 0, 0, 0, 0, 0x03];
        data.extend([0u8; 8]);
        let dir = tempfile::tempdir().unwrap();
        let mut input = Cursor::new(data);
        let output = dir.path().join("empty.out");
        let result = decompress_stream_to_file(&mut input, &output, &retry());

        assert!(!result.success());
        assert!(result.report.error().is_some());
        assert!(!output.exists());
        let snapshot = result.report.snapshot();
        assert!(snapshot.input_is_stream);
        assert!(snapshot.header.as_deref().unwrap().contains("os=3"));
        assert!(snapshot.footer.as_deref().unwrap().contains("crc32=0x00000000"));
    }

    #[test]
    fn zero_length_output_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("empty.gz");
        fs::write(&input, gzip(b"")).unwrap();
        let output = dir.path().join("empty.txt");

        for algorithm in [Algorithm::Direct, Algorithm::WithoutCrc, Algorithm::WithRetry] {
            let options = DecompressOptions::default().with_algorithm(algorithm);
            let result = decompress_file_to_file(&input, &output, &options);
            assert!(!result.success(), "{algorithm}");
            assert!(!output.exists(), "{algorithm}");
        }

        let result = decompress_file_to_file(&input, &output, &direct_only());
        assert_eq!(result.report.error().map(Error::kind), Some(ErrorKind::OutputEmpty));
    }

    #[test]
    fn bad_crc_fails_direct_but_recovers_with_retry() {
        let payload = sample_text();
        let corrupted = gzip_with_bad_crc(&payload);

        let mut input = Cursor::new(corrupted.clone());
        let mut output = Cursor::new(Vec::new());
        let result = decompress_stream_to_stream(&mut input, &mut output, &direct_only());
        assert!(!result.success());
        assert_eq!(
            result.report.error().map(Error::kind),
            Some(ErrorKind::ExceptionWasThrown)
        );

        let mut input = Cursor::new(corrupted.clone());
        let mut output = Cursor::new(Vec::new());
        let result = decompress_stream_to_stream(&mut input, &mut output, &retry());
        assert!(result.success(), "{}", result.report.log());
        assert!(result.report.log().contains("retrying without crc validation"));
        assert_eq!(output.into_inner(), payload);

        let without = DecompressOptions::default().with_algorithm(Algorithm::WithoutCrc);
        let mut input = Cursor::new(corrupted);
        let mut output = Cursor::new(Vec::new());
        assert!(decompress_stream_to_stream(&mut input, &mut output, &without).success());
        assert_eq!(output.into_inner(), payload);
    }

    #[test]
    fn retry_rewinds_the_output_stream() {
        let payload = sample_text();
        let corrupted = gzip_with_bad_crc(&payload);

        let mut output = Cursor::new(Vec::new());
        output.write_all(&[0xEE; 100]).unwrap();
        output.seek(SeekFrom::Start(0)).unwrap();

        let mut input = Cursor::new(corrupted);
        let result = decompress_stream_to_stream(&mut input, &mut output, &retry());
        assert!(result.success());
        let written = output.into_inner();
        assert_eq!(&written[..payload.len()], payload.as_slice());
        assert!(!written[..100].contains(&0xEE));
    }

    /// Writes `limit` stray bytes, then fails like a decoder hitting a bad block.
    struct FlakyStream {
        inner: Cursor<Vec<u8>>,
        fail_after: Option<usize>,
    }

    impl Write for FlakyStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(limit) = self.fail_after {
                let room = limit.saturating_sub(self.inner.position() as usize);
                if room == 0 {
                    self.fail_after = None;
                    return Err(io::Error::other("simulated write failure"));
                }
                let n = room.min(buf.len());
                return self.inner.write(&buf[..n]);
            }
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl Seek for FlakyStream {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn stray_bytes_from_failed_direct_are_overwritten() {
        let payload = sample_text();
        let mut input = Cursor::new(gzip(&payload));
        let mut output = FlakyStream {
            inner: Cursor::new(Vec::new()),
            fail_after: Some(100),
        };

        let result = decompress_stream_to_stream(&mut input, &mut output, &retry());
        assert!(result.success(), "{}", result.report.log());
        assert!(result.report.log().contains("direct decompression failed"));
        assert_eq!(output.inner.into_inner(), payload);
    }

    #[test]
    fn corrupted_body_never_panics() {
        let payload = sample_text();
        let mut corrupted = gzip(&payload);
        let mid = corrupted.len() / 2;
        for b in &mut corrupted[12..mid] {
            *b = b.wrapping_mul(31).wrapping_add(7);
        }

        let mut input = Cursor::new(corrupted);
        let mut output = Cursor::new(Vec::new());
        let result = decompress_stream_to_stream(&mut input, &mut output, &retry());
        assert!(result.report.log().contains("direct decompression failed"));
        if !result.success() {
            let err = result.report.error().unwrap();
            assert_eq!(err.kind(), ErrorKind::DeflateOperationFailed);
            assert!(err.inner().is_some());
        }
    }

    #[test]
    fn failed_file_output_is_cleaned_unless_kept() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("bad.gz");
        fs::write(&input, gzip_with_bad_crc(&sample_text())).unwrap();
        let output = dir.path().join("partial.txt");

        let result = decompress_file_to_file(&input, &output, &direct_only());
        assert!(!result.success());
        assert!(!output.exists());

        let keep = direct_only().keep_partial_output(true);
        let result = decompress_file_to_file(&input, &output, &keep);
        assert!(!result.success());
        assert!(output.exists());
    }
}
