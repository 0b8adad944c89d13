use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::Level;

use tar_salvage::outcome::FaultExt;
use tar_salvage::{
    Algorithm, DecompressOptions, ExtractOptions, OperationReport, Result, TarExtractionResult,
    decompress_file_to_file, decompress_file_to_file_async, extract_tar_file,
    extract_tar_file_async, inspect, pack, unpack_with,
};

#[derive(Debug, Parser)]
#[command(name = "tar_salvage", version, about = "Recover files from damaged gzip and tar archives")]
struct Cli {
    /// Show debug diagnostics
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Run the tokio-based engines instead of the blocking ones
    #[arg(long, global = true)]
    nonblocking: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decompress a gzip file
    Gunzip {
        input: PathBuf,
        output: PathBuf,
        /// direct, without-crc or with-retry
        #[arg(short, long, default_value_t = Algorithm::WithRetry)]
        algorithm: Algorithm,
        /// Keep what was written when decompression fails
        #[arg(long)]
        keep_partial: bool,
    },
    /// Extract a plain tar archive
    Untar {
        archive: PathBuf,
        dir: PathBuf,
        #[command(flatten)]
        extract: ExtractArgs,
    },
    /// Extract a .tar, .tar.gz or .tgz archive
    Unpack {
        archive: PathBuf,
        dir: PathBuf,
        #[command(flatten)]
        extract: ExtractArgs,
    },
    /// Print the gzip header and footer of a file
    Inspect { file: PathBuf },
    /// Create a tar archive (.tar.gz and .tgz are compressed)
    Pack {
        tarfile: PathBuf,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Debug, clap::Args)]
struct ExtractArgs {
    /// Only accept header blocks with a matching checksum
    #[arg(long)]
    verify_checksum: bool,
    /// Allow absolute entry paths and `..` components
    #[arg(long)]
    allow_unsafe_paths: bool,
}

impl ExtractArgs {
    fn options(&self) -> ExtractOptions {
        ExtractOptions::default()
            .verify_checksum(self.verify_checksum)
            .sanitize_paths(!self.allow_unsafe_paths)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Runs one command; `Ok(false)` means it ran and reported failure.
fn run(cli: Cli) -> Result<bool> {
    match cli.command {
        Command::Gunzip {
            input,
            output,
            algorithm,
            keep_partial,
        } => {
            let options = DecompressOptions::default()
                .with_algorithm(algorithm)
                .keep_partial_output(keep_partial);
            let result = if cli.nonblocking {
                block_on(decompress_file_to_file_async(&input, &output, &options))?
            } else {
                decompress_file_to_file(&input, &output, &options)
            };
            if result.success() {
                println!("Decompressed to: {}", result.output_path.display());
            }
            Ok(summarize(&result.report))
        }
        Command::Untar {
            archive,
            dir,
            extract,
        } => {
            let options = extract.options();
            let result = if cli.nonblocking {
                block_on(extract_tar_file_async(&archive, &dir, &options))?
            } else {
                extract_tar_file(&archive, &dir, &options)
            };
            Ok(print_extraction(&result))
        }
        Command::Unpack {
            archive,
            dir,
            extract,
        } => {
            let result = unpack_with(
                &archive,
                &dir,
                &DecompressOptions::default(),
                &extract.options(),
            );
            Ok(print_extraction(&result))
        }
        Command::Inspect { file } => {
            let format = inspect(&file)?;
            println!("File:      {}", file.display());
            println!("Signature: {}", if format.has_gzip_signature() { "gzip" } else { "missing" });
            println!("Header:    {}", format.header_display());
            println!("Footer:    {}", format.footer_display());
            if format.has_embedded_filename() {
                println!("Note:      header carries an embedded file name");
            }
            Ok(format.has_gzip_signature())
        }
        Command::Pack { tarfile, files } => {
            let count = pack(&tarfile, &files)?;
            println!("Created tar archive: {} ({count} file(s))", tarfile.display());
            Ok(count > 0)
        }
    }
}

fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .or_fault("tokio runtime")?;
    Ok(runtime.block_on(future))
}

fn print_extraction(result: &TarExtractionResult) -> bool {
    for path in &result.extracted_files {
        println!("Extracted: {}", path.display());
    }
    for failure in &result.entry_failures {
        eprintln!("Skipped:   {failure}");
    }
    println!(
        "Recovered {} of {} file(s) into: {}",
        result.extracted_count(),
        result.expected_files,
        result.output_dir.display()
    );
    summarize(&result.report)
}

fn summarize(report: &OperationReport) -> bool {
    if let Some(error) = report.error() {
        eprintln!("Error: {error}");
    }
    report.success()
}
