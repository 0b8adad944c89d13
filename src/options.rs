use std::fmt;
use std::str::FromStr;

/// How a gzip input is turned into output bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// Inflate the whole member, trusting the decoder's CRC and size checks.
    Direct,
    /// Trim the fixed header and footer and raw-inflate what is left.
    WithoutCrc,
    /// Direct, falling back to WithoutCrc when it fails.
    #[default]
    WithRetry,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::Direct => "direct",
            Algorithm::WithoutCrc => "without-crc",
            Algorithm::WithRetry => "with-retry",
        };
        f.write_str(name)
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Algorithm::Direct),
            "without-crc" | "no-crc" => Ok(Algorithm::WithoutCrc),
            "with-retry" | "retry" => Ok(Algorithm::WithRetry),
            other => Err(format!("unknown algorithm '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecompressOptions {
    pub algorithm: Algorithm,
    /// Leave whatever a failed run wrote to a file destination in place.
    pub keep_partial_output: bool,
}

impl DecompressOptions {
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn keep_partial_output(mut self, keep: bool) -> Self {
        self.keep_partial_output = keep;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Also require a matching header checksum before accepting a block.
    pub verify_checksum: bool,
    /// Reject entries with absolute paths or `..` components.
    pub sanitize_paths: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            verify_checksum: false,
            sanitize_paths: true,
        }
    }
}

impl ExtractOptions {
    pub fn verify_checksum(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    pub fn sanitize_paths(mut self, sanitize: bool) -> Self {
        self.sanitize_paths = sanitize;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_parses_cli_spellings() {
        assert_eq!("direct".parse::<Algorithm>(), Ok(Algorithm::Direct));
        assert_eq!("No-CRC".parse::<Algorithm>(), Ok(Algorithm::WithoutCrc));
        assert_eq!("with-retry".parse::<Algorithm>(), Ok(Algorithm::WithRetry));
        assert!("zstd".parse::<Algorithm>().is_err());
        assert_eq!(Algorithm::WithoutCrc.to_string(), "without-crc");
    }

    #[test]
    fn defaults() {
        let options = DecompressOptions::default();
        assert_eq!(options.algorithm, Algorithm::WithRetry);
        assert!(!options.keep_partial_output);

        let extract = ExtractOptions::default().verify_checksum(true);
        assert!(extract.verify_checksum);
        assert!(extract.sanitize_paths);
    }
}
