//! Ustar header blocks and a small archive writer.
//!
//! # Reading header blocks
//!
//! ```rust
//! use tar_salvage::tar::{HeaderBlock, TarEntry, write_tar, BLOCK_SIZE};
//!
//! let archive = write_tar(&[TarEntry::file("hello.txt", b"Hello, World".to_vec())]);
//! let mut raw = [0u8; BLOCK_SIZE];
//! raw.copy_from_slice(&archive[..BLOCK_SIZE]);
//!
//! let block = HeaderBlock::parse(raw);
//! assert!(block.valid_header);
//! assert_eq!(block.header.path(), "hello.txt");
//! assert_eq!(block.header.size, 12);
//! ```
//!
//! # Recovering from a shifted block
//!
//! A block that starts `K` bytes too early has its magic at `257 + K`;
//! [`HeaderBlock::junk_offset`] reports that `K` so the reader can seek to the
//! real header.

pub mod cursor;
pub mod extract;
pub mod nonblocking;

use std::ops::Range;

pub const BLOCK_SIZE: usize = 512;
pub const MAGIC: &[u8; 5] = b"ustar";
pub const MAGIC_OFFSET: usize = 257;

const NAME: Range<usize> = 0..100;
const MODE: Range<usize> = 100..108;
const UID: Range<usize> = 108..116;
const GID: Range<usize> = 116..124;
const SIZE: Range<usize> = 124..136;
const MTIME: Range<usize> = 136..148;
const CHECKSUM: Range<usize> = 148..156;
const TYPEFLAG: usize = 156;
const LINKNAME: Range<usize> = 157..257;
const MAGIC_FIELD: Range<usize> = 257..263;
const VERSION: Range<usize> = 263..265;
const UNAME: Range<usize> = 265..297;
const GNAME: Range<usize> = 297..329;
const DEVMAJOR: Range<usize> = 329..337;
const DEVMINOR: Range<usize> = 337..345;
const PREFIX: Range<usize> = 345..500;

/// What an entry holds, as far as extraction cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Links, devices, fifos and pax/GNU extension records.
    Other(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarHeader {
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: u64,
    pub checksum: u32,
    pub typeflag: u8,
    pub linkname: String,
    pub magic: String,
    pub version: String,
    pub uname: String,
    pub gname: String,
    pub devmajor: u32,
    pub devminor: u32,
    pub prefix: String,
}

impl TarHeader {
    /// A regular-file header; the rest is filled with ustar defaults.
    pub fn new(name: impl Into<String>, mode: u32, size: u64) -> Self {
        Self {
            name: name.into(),
            mode,
            uid: 0,
            gid: 0,
            size,
            mtime: 0,
            checksum: 0,
            typeflag: b'0',
            linkname: String::new(),
            magic: "ustar".to_string(),
            version: "00".to_string(),
            uname: String::new(),
            gname: String::new(),
            devmajor: 0,
            devminor: 0,
            prefix: String::new(),
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        let mut header = Self::new(name, 0o755, 0);
        header.typeflag = b'5';
        header
    }

    pub fn from_bytes(block: &[u8; BLOCK_SIZE]) -> Self {
        Self {
            name: read_str(block, NAME),
            mode: read_number(block, MODE) as u32,
            uid: read_number(block, UID) as u32,
            gid: read_number(block, GID) as u32,
            size: read_number(block, SIZE),
            mtime: read_number(block, MTIME),
            checksum: read_number(block, CHECKSUM) as u32,
            typeflag: block[TYPEFLAG],
            linkname: read_str(block, LINKNAME),
            magic: read_str(block, MAGIC_FIELD),
            version: read_str(block, VERSION),
            uname: read_str(block, UNAME),
            gname: read_str(block, GNAME),
            devmajor: read_number(block, DEVMAJOR) as u32,
            devminor: read_number(block, DEVMINOR) as u32,
            prefix: read_str(block, PREFIX),
        }
    }

    /// Serializes the header, splitting long names into the ustar prefix and
    /// filling in the checksum.
    pub fn to_bytes(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        let (prefix, name) = if self.prefix.is_empty() {
            split_long_name(&self.name)
        } else {
            (self.prefix.as_str(), self.name.as_str())
        };
        write_str(&mut block, NAME, name);
        write_number(&mut block, MODE, u64::from(self.mode));
        write_number(&mut block, UID, u64::from(self.uid));
        write_number(&mut block, GID, u64::from(self.gid));
        write_number(&mut block, SIZE, self.size);
        write_number(&mut block, MTIME, self.mtime);
        block[TYPEFLAG] = self.typeflag;
        write_str(&mut block, LINKNAME, &self.linkname);
        write_str(&mut block, MAGIC_FIELD, &self.magic);
        write_str(&mut block, VERSION, &self.version);
        write_str(&mut block, UNAME, &self.uname);
        write_str(&mut block, GNAME, &self.gname);
        write_number(&mut block, DEVMAJOR, u64::from(self.devmajor));
        write_number(&mut block, DEVMINOR, u64::from(self.devminor));
        write_str(&mut block, PREFIX, prefix);

        let checksum = format!("{:06o}\0 ", calc_checksum(&block));
        block[CHECKSUM].copy_from_slice(checksum.as_bytes());
        block
    }

    /// Entry path with the ustar prefix joined in.
    pub fn path(&self) -> String {
        if self.prefix.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), self.name)
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self.typeflag {
            // pre-POSIX archives mark directories with a trailing slash only
            b'0' | 0 if self.name.ends_with('/') => EntryKind::Directory,
            b'0' | 0 | b'7' => EntryKind::File,
            b'5' => EntryKind::Directory,
            other => EntryKind::Other(other),
        }
    }
}

/// One 512-byte block read where a header was expected.
#[derive(Debug, Clone)]
pub struct HeaderBlock {
    pub header: TarHeader,
    pub raw: [u8; BLOCK_SIZE],
    /// The magic token sits at offset 257.
    pub valid_header: bool,
    pub checksum_matches: bool,
    junk_offset: Option<u64>,
}

impl HeaderBlock {
    pub fn parse(raw: [u8; BLOCK_SIZE]) -> Self {
        let valid_header = raw[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()] == MAGIC[..];
        let junk_offset = if valid_header {
            None
        } else {
            find_shifted_magic(&raw)
        };
        let header = TarHeader::from_bytes(&raw);
        let checksum_matches = header.checksum == calc_checksum(&raw);
        Self {
            header,
            raw,
            valid_header,
            checksum_matches,
            junk_offset,
        }
    }

    /// Distance from this block's start to the real header start, when the
    /// magic token shows up past its expected offset. Always `None` for a
    /// valid header.
    pub fn junk_offset(&self) -> Option<u64> {
        self.junk_offset
    }

    /// An all-zero block, as used for the end-of-archive marker.
    pub fn is_zero(&self) -> bool {
        self.raw.iter().all(|&b| b == 0)
    }

    pub fn accepted(&self, verify_checksum: bool) -> bool {
        self.valid_header && (!verify_checksum || self.checksum_matches)
    }
}

fn find_shifted_magic(raw: &[u8; BLOCK_SIZE]) -> Option<u64> {
    raw.windows(MAGIC.len())
        .skip(MAGIC_OFFSET + 1)
        .position(|window| window == MAGIC)
        .map(|p| p as u64 + 1)
}

/// Sum of the header bytes with the checksum field counted as spaces.
pub fn calc_checksum(block: &[u8; BLOCK_SIZE]) -> u32 {
    block
        .iter()
        .enumerate()
        .map(|(i, &b)| if CHECKSUM.contains(&i) { u32::from(b' ') } else { u32::from(b) })
        .sum()
}

/// An entry to be written by [`write_tar`].
#[derive(Debug, Clone)]
pub struct TarEntry {
    pub header: TarHeader,
    pub data: Vec<u8>,
}

impl TarEntry {
    pub fn file(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            header: TarHeader::new(name, 0o644, data.len() as u64),
            data,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            header: TarHeader::directory(name),
            data: Vec::new(),
        }
    }
}

/// Writes entries as a ustar archive, terminated by two zero blocks.
pub fn write_tar(entries: &[TarEntry]) -> Vec<u8> {
    let mut archive = Vec::new();
    for entry in entries {
        archive.extend_from_slice(&entry.header.to_bytes());
        archive.extend_from_slice(&entry.data);
        archive.resize(archive.len() + padding(entry.data.len() as u64) as usize, 0);
    }
    archive.extend_from_slice(&[0u8; BLOCK_SIZE * 2]);
    archive
}

/// Zero bytes that follow `len` bytes of entry data up to the next block.
pub fn padding(len: u64) -> u64 {
    let block = BLOCK_SIZE as u64;
    (block - len % block) % block
}

fn read_str(block: &[u8; BLOCK_SIZE], range: Range<usize>) -> String {
    let field = &block[range];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).trim().to_string()
}

fn read_number(block: &[u8; BLOCK_SIZE], range: Range<usize>) -> u64 {
    let field = &block[range.clone()];
    if field[0] & 0x80 != 0 {
        // GNU base-256: big-endian with the marker bit cleared
        return field[1..]
            .iter()
            .fold(u64::from(field[0] & 0x7F), |acc, &b| (acc << 8) | u64::from(b));
    }
    let text = read_str(block, range);
    u64::from_str_radix(text.trim(), 8).unwrap_or(0)
}

fn write_str(block: &mut [u8; BLOCK_SIZE], range: Range<usize>, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(range.len());
    block[range.start..range.start + len].copy_from_slice(&bytes[..len]);
}

fn write_number(block: &mut [u8; BLOCK_SIZE], range: Range<usize>, value: u64) {
    let digits = range.len() - 1;
    let octal = format!("{value:0digits$o}");
    if octal.len() <= digits {
        write_str(block, range, &octal);
        return;
    }
    let field = &mut block[range];
    let bytes = value.to_be_bytes();
    field.fill(0);
    let tail = field.len().min(bytes.len());
    let start = field.len() - tail;
    field[start..].copy_from_slice(&bytes[bytes.len() - tail..]);
    field[0] |= 0x80;
}

/// Splits a path longer than the name field at a `/` so that it fits the
/// ustar prefix and name fields. Unsplittable names are left whole and get
/// truncated on write.
fn split_long_name(path: &str) -> (&str, &str) {
    if path.len() <= NAME.len() {
        return ("", path);
    }
    path.char_indices()
        .filter(|&(_, c)| c == '/')
        .map(|(i, _)| (&path[..i], &path[i + 1..]))
        .find(|(prefix, name)| prefix.len() <= PREFIX.len() && name.len() <= NAME.len() && !name.is_empty())
        .unwrap_or(("", path))
}
