//! Gzip member framing: the fixed 10-byte header and 8-byte footer.
//!
//! ```text
//! +---+---+---+---+---+---+---+---+---+---+
//! |ID1|ID2|CM |FLG|     MTIME     |XFL|OS |   header
//! +---+---+---+---+---+---+---+---+---+---+
//! ...compressed blocks...
//! +---+---+---+---+---+---+---+---+
//! |     CRC32     |     ISIZE     |           footer
//! +---+---+---+---+---+---+---+---+
//! ```

pub mod decompress;
pub mod nonblocking;

use std::io::{Read, Seek, SeekFrom};

use chrono::DateTime;

use crate::error::{Error, Result};
use crate::outcome::FaultExt;

pub const GZIP_HEADER_LEN: usize = 10;
pub const GZIP_FOOTER_LEN: usize = 8;
pub const GZIP_SIGNATURE: [u8; 2] = [0x1F, 0x8B];

pub const FLAG_TEXT: u8 = 0x01;
pub const FLAG_HCRC: u8 = 0x02;
pub const FLAG_EXTRA: u8 = 0x04;
pub const FLAG_NAME: u8 = 0x08;
pub const FLAG_COMMENT: u8 = 0x10;

pub(crate) const FRAMING_LEN: usize = GZIP_HEADER_LEN + GZIP_FOOTER_LEN;

/// Header and footer of a gzip input, read without consuming the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GZipFormatData {
    pub header: [u8; GZIP_HEADER_LEN],
    pub footer: [u8; GZIP_FOOTER_LEN],
}

impl GZipFormatData {
    /// Reads both slices from a complete in-memory input.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() < FRAMING_LEN {
            return Err(Error::ReadFailure {
                needed: FRAMING_LEN,
                available: data.len() as u64,
            });
        }
        let mut header = [0u8; GZIP_HEADER_LEN];
        header.copy_from_slice(&data[..GZIP_HEADER_LEN]);
        let mut footer = [0u8; GZIP_FOOTER_LEN];
        footer.copy_from_slice(&data[data.len() - GZIP_FOOTER_LEN..]);
        Ok(Self { header, footer })
    }

    /// Reads header and footer, leaving the reader where it was.
    ///
    /// The input is taken to start at the current position.
    pub fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        const ORIGIN: &str = "gzip header/footer read";
        let start = reader.stream_position().or_fault(ORIGIN)?;
        let end = reader.seek(SeekFrom::End(0)).or_fault(ORIGIN)?;
        let outcome = Self::read_framing(reader, start, end);
        reader.seek(SeekFrom::Start(start)).or_fault(ORIGIN)?;
        outcome
    }

    fn read_framing<R: Read + Seek>(reader: &mut R, start: u64, end: u64) -> Result<Self> {
        const ORIGIN: &str = "gzip header/footer read";
        let available = end.saturating_sub(start);
        if available < FRAMING_LEN as u64 {
            return Err(Error::ReadFailure {
                needed: FRAMING_LEN,
                available,
            });
        }
        let mut header = [0u8; GZIP_HEADER_LEN];
        reader.seek(SeekFrom::Start(start)).or_fault(ORIGIN)?;
        reader.read_exact(&mut header).or_fault(ORIGIN)?;
        let mut footer = [0u8; GZIP_FOOTER_LEN];
        reader
            .seek(SeekFrom::Start(end - GZIP_FOOTER_LEN as u64))
            .or_fault(ORIGIN)?;
        reader.read_exact(&mut footer).or_fault(ORIGIN)?;
        Ok(Self { header, footer })
    }

    pub fn has_gzip_signature(&self) -> bool {
        self.header[..2] == GZIP_SIGNATURE
    }

    pub fn compression_method(&self) -> u8 {
        self.header[2]
    }

    pub fn flags(&self) -> u8 {
        self.header[3]
    }

    pub fn mtime(&self) -> u32 {
        u32::from_le_bytes([self.header[4], self.header[5], self.header[6], self.header[7]])
    }

    pub fn os(&self) -> u8 {
        self.header[9]
    }

    pub fn crc32(&self) -> u32 {
        u32::from_le_bytes([self.footer[0], self.footer[1], self.footer[2], self.footer[3]])
    }

    /// Uncompressed size modulo 2^32.
    pub fn uncompressed_size(&self) -> u32 {
        u32::from_le_bytes([self.footer[4], self.footer[5], self.footer[6], self.footer[7]])
    }

    pub fn has_embedded_filename(&self) -> bool {
        self.flags() & FLAG_NAME != 0
    }

    /// True when FLG announces any field between the fixed header and the
    /// compressed blocks.
    pub fn has_optional_fields(&self) -> bool {
        self.flags() & (FLAG_HCRC | FLAG_EXTRA | FLAG_NAME | FLAG_COMMENT) != 0
    }

    pub fn header_display(&self) -> String {
        let mtime = match self.mtime() {
            0 => "unset".to_string(),
            secs => DateTime::from_timestamp(i64::from(secs), 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| secs.to_string()),
        };
        format!(
            "{} (method={}, flags=0x{:02x}, mtime={}, os={})",
            hex(&self.header),
            self.compression_method(),
            self.flags(),
            mtime,
            self.os()
        )
    }

    pub fn footer_display(&self) -> String {
        format!(
            "{} (crc32=0x{:08x}, isize={})",
            hex(&self.footer),
            self.crc32(),
            self.uncompressed_size()
        )
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
