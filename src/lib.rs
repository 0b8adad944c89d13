//! Gzip and tar extraction that keeps going when archives are damaged.
//!
//! # Usage
//!
//! ## Decompressing a gzip file
//!
//! ```rust,no_run
//! use tar_salvage::{decompress_file_to_file, Algorithm, DecompressOptions};
//!
//! let options = DecompressOptions::default().with_algorithm(Algorithm::WithRetry);
//! let result = decompress_file_to_file("backup.tar.gz", "backup.tar", &options);
//! if !result.success() {
//!     eprintln!("{}", result.report.log());
//! }
//! ```
//!
//! ## Extracting a tar archive
//!
//! ```rust,no_run
//! use tar_salvage::{extract_tar_file, ExtractOptions};
//!
//! let result = extract_tar_file("backup.tar", "restored", &ExtractOptions::default());
//! println!(
//!     "{} of {} file(s) recovered",
//!     result.extracted_count(),
//!     result.expected_files
//! );
//! for failure in &result.entry_failures {
//!     println!("  {failure}");
//! }
//! ```
//!
//! ## Both at once
//!
//! ```rust,no_run
//! use tar_salvage::{pack, unpack};
//!
//! pack("archive.tar.gz", &["file1.txt", "file2.txt"]).unwrap();
//! let result = unpack("archive.tar.gz", "output_directory");
//! assert!(result.success());
//! ```
//!
//! Every operation returns a report instead of panicking on bad input: the
//! first error, a success flag, and a timestamped log that is also emitted
//! through `tracing`.

pub mod error;
pub mod gzip;
pub mod io;
pub mod options;
pub mod outcome;
pub mod report;
pub mod tar;

use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::time::UNIX_EPOCH;

use flate2::Compression;
use flate2::write::GzEncoder;

pub use error::{Error, ErrorKind, Result};
pub use gzip::GZipFormatData;
pub use gzip::decompress::{
    decompress_file_to_file, decompress_file_to_stream, decompress_stream_to_file,
    decompress_stream_to_stream,
};
pub use gzip::nonblocking::{
    decompress_file_to_file_async, decompress_file_to_stream_async,
    decompress_stream_to_file_async, decompress_stream_to_stream_async,
};
pub use options::{Algorithm, DecompressOptions, ExtractOptions};
pub use report::{
    DecompressToFileResult, DecompressToStreamResult, OperationLog, OperationReport,
    TarExtractionResult,
};
pub use tar::extract::{extract_tar_file, extract_tar_stream};
pub use tar::nonblocking::{extract_tar_file_async, extract_tar_stream_async};
pub use tar::{TarEntry, TarHeader, write_tar};

use crate::io::{ByteSource, FileSource};
use crate::outcome::FaultExt;

/// True for `.tar.gz`, `.tgz` and `.gz` names.
pub fn is_gzip_path(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    name.ends_with(".gz") || name.ends_with(".tgz")
}

/// Packs files into a tar archive, gzip-compressed when `tarfile` says so.
///
/// Entries are named after the file name only. Missing or unreadable files
/// are skipped with a warning. Returns the number of entries written.
pub fn pack<P: AsRef<Path>>(tarfile: impl AsRef<Path>, files: &[P]) -> Result<usize> {
    let tarfile = tarfile.as_ref();
    let mut entries = Vec::new();
    for file in files {
        let path = file.as_ref();
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("skipping '{}': {e}", path.display());
                continue;
            }
        };
        let name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let mut entry = TarEntry::file(name, data);
        entry.header.mtime = fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        entries.push(entry);
    }

    let archive = write_tar(&entries);
    let bytes = if is_gzip_path(tarfile) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&archive)
            .and_then(|()| encoder.finish())
            .or_fault("gzip encode")?
    } else {
        archive
    };
    let target = io::resolve_output_path(tarfile)?;
    fs::write(&target, bytes).map_err(|e| Error::OutputUnavailable {
        reason: format!("cannot write '{}': {e}", target.display()),
    })?;
    tracing::info!("created tar archive '{}' with {} entries", target.display(), entries.len());
    Ok(entries.len())
}

/// Extracts a `.tar`, `.tar.gz` or `.tgz` archive with default options.
pub fn unpack(archive: impl AsRef<Path>, output_dir: impl AsRef<Path>) -> TarExtractionResult {
    unpack_with(
        archive,
        output_dir,
        &DecompressOptions::default(),
        &ExtractOptions::default(),
    )
}

/// Extracts an archive, decompressing it in memory first when it is gzipped.
///
/// The decompression log is put in front of the extraction log.
pub fn unpack_with(
    archive: impl AsRef<Path>,
    output_dir: impl AsRef<Path>,
    decompress: &DecompressOptions,
    extract: &ExtractOptions,
) -> TarExtractionResult {
    let archive = archive.as_ref();
    let output_dir = output_dir.as_ref();
    if !is_gzip_path(archive) {
        return extract_tar_file(archive, output_dir, extract);
    }

    let mut buffer = Cursor::new(Vec::new());
    let gunzip = decompress_file_to_stream(archive, &mut buffer, decompress);
    if !gunzip.success() {
        return tar::extract::unavailable_input(gunzip.report, output_dir);
    }
    buffer.set_position(0);
    let mut result = extract_tar_stream(&mut buffer, output_dir, extract);

    let snapshot = result.report.snapshot_mut();
    snapshot.input_path = Some(archive.to_path_buf());
    snapshot.input_is_stream = false;
    snapshot.header = gunzip.report.snapshot().header.clone();
    snapshot.footer = gunzip.report.snapshot().footer.clone();
    result.report.log_mut().prepend(gunzip.report.log().clone());
    result
}

/// Reads the gzip header and footer of a file without decompressing it.
pub fn inspect(path: impl AsRef<Path>) -> Result<GZipFormatData> {
    let mut source = FileSource::new(path.as_ref());
    source.verify()?;
    source.format_data()
}
