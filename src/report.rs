//! Diagnostics collected while an operation runs, and the public outcome types.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Error => "ERROR",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<5} {}",
            self.at.format("%H:%M:%S%.3f"),
            self.severity,
            self.message
        )
    }
}

/// Ordered diagnostic sub-log of one operation.
///
/// Every line is also emitted as a `tracing` event, tagged with the
/// operation name.
#[derive(Debug, Clone)]
pub struct OperationLog {
    operation: &'static str,
    lines: Vec<LogLine>,
}

impl OperationLog {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            lines: Vec::new(),
        }
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.push(Severity::Debug, message.into());
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(Severity::Info, message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(Severity::Error, message.into());
    }

    fn push(&mut self, severity: Severity, message: String) {
        let operation = self.operation;
        match severity {
            Severity::Debug => tracing::debug!(operation, "{message}"),
            Severity::Info => tracing::info!(operation, "{message}"),
            Severity::Error => tracing::error!(operation, "{message}"),
        }
        self.lines.push(LogLine {
            at: Utc::now(),
            severity,
            message,
        });
    }

    /// Moves the lines of an earlier stage in front of this log.
    pub fn prepend(&mut self, earlier: OperationLog) {
        let mut lines = earlier.lines;
        lines.append(&mut self.lines);
        self.lines = lines;
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    pub fn errors(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter().filter(|l| l.severity == Severity::Error)
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|l| l.message.contains(needle))
    }
}

impl fmt::Display for OperationLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

/// What the operation was given, captured for post-mortem diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputSnapshot {
    pub input_path: Option<PathBuf>,
    pub input_is_stream: bool,
    pub output_path: Option<PathBuf>,
    pub output_is_stream: bool,
    pub header: Option<String>,
    pub footer: Option<String>,
}

/// Success flag, first error and diagnostics of one operation.
#[derive(Debug)]
pub struct OperationReport {
    success: bool,
    error: Option<Error>,
    log: OperationLog,
    snapshot: InputSnapshot,
}

impl OperationReport {
    pub fn new(operation: &'static str) -> Self {
        Self {
            success: false,
            error: None,
            log: OperationLog::new(operation),
            snapshot: InputSnapshot::default(),
        }
    }

    /// Marks the operation successful unless a failure was already recorded.
    pub fn succeed(&mut self) {
        if self.error.is_none() {
            self.success = true;
        }
    }

    /// Records a failure. The first one wins; later ones only reach the log.
    pub fn fail(&mut self, error: Error) {
        self.log.error(error.to_string());
        self.success = false;
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn into_error(self) -> Option<Error> {
        self.error
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut OperationLog {
        &mut self.log
    }

    pub fn snapshot(&self) -> &InputSnapshot {
        &self.snapshot
    }

    pub fn snapshot_mut(&mut self) -> &mut InputSnapshot {
        &mut self.snapshot
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.log.debug(message);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log.info(message);
    }

    pub fn error_line(&mut self, message: impl Into<String>) {
        self.log.error(message);
    }
}

/// Outcome of a decompression whose destination is a file.
#[derive(Debug)]
pub struct DecompressToFileResult {
    pub output_path: PathBuf,
    pub report: OperationReport,
}

impl DecompressToFileResult {
    pub fn success(&self) -> bool {
        self.report.success()
    }
}

/// Outcome of a decompression whose destination is a caller stream.
#[derive(Debug)]
pub struct DecompressToStreamResult {
    pub bytes_written: u64,
    pub report: OperationReport,
}

impl DecompressToStreamResult {
    pub fn success(&self) -> bool {
        self.report.success()
    }
}

/// Outcome of a tar extraction.
#[derive(Debug)]
pub struct TarExtractionResult {
    pub output_dir: PathBuf,
    /// Valid regular-file headers encountered.
    pub expected_files: usize,
    pub extracted_files: Vec<PathBuf>,
    /// Entry-scoped failures that were recovered from.
    pub entry_failures: Vec<Error>,
    pub report: OperationReport,
}

impl TarExtractionResult {
    pub fn success(&self) -> bool {
        self.report.success()
    }

    pub fn extracted_count(&self) -> usize {
        self.extracted_files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn first_failure_wins() {
        let mut report = OperationReport::new("test");
        report.fail(Error::NoGzipSignature {
            header: "00 00".into(),
        });
        report.fail(Error::OutputEmpty {
            target: "out".into(),
        });
        report.succeed();

        assert!(!report.success());
        assert_eq!(report.error().map(Error::kind), Some(ErrorKind::NoGzipSignature));
        // the second failure still reached the log
        assert_eq!(report.log().errors().count(), 2);
        assert!(report.log().contains("output 'out' is empty"));
    }

    #[test]
    fn succeed_without_failure() {
        let mut report = OperationReport::new("test");
        report.info("all good");
        report.succeed();
        assert!(report.success());
        assert!(report.error().is_none());
        assert_eq!(report.log().lines()[0].severity, Severity::Info);
    }

    #[test]
    fn prepend_keeps_order() {
        let mut earlier = OperationLog::new("gunzip");
        earlier.info("one");
        let mut later = OperationLog::new("untar");
        later.info("two");
        later.prepend(earlier);
        let messages: Vec<_> = later.lines().iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "two"]);
        assert!(later.to_string().contains("INFO"));
    }
}
