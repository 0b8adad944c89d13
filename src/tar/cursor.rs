//! Extraction cursor and the block arithmetic around it.
//!
//! [`TarReaderInfo`] never touches the input: the engine reads or seeks, then
//! asks the cursor for the next value. Every transition returns a new cursor.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::tar::{BLOCK_SIZE, HeaderBlock, padding};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarState {
    AwaitingHeader,
    ParsingFile,
    Realigning,
    Done,
}

#[derive(Debug, Clone)]
pub struct TarReaderInfo {
    output_dir: PathBuf,
    header: Option<Arc<HeaderBlock>>,
    consumed: u64,
    target: Option<PathBuf>,
}

impl TarReaderInfo {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            header: None,
            consumed: 0,
            target: None,
        }
    }

    /// Cursor positioned right after `block`.
    pub fn with_header(&self, block: HeaderBlock) -> Self {
        Self {
            output_dir: self.output_dir.clone(),
            header: Some(Arc::new(block)),
            consumed: 0,
            target: None,
        }
    }

    pub fn with_target(&self, target: PathBuf) -> Self {
        Self {
            target: Some(target),
            ..self.clone()
        }
    }

    pub fn with_consumed(&self, bytes: u64) -> Self {
        Self {
            consumed: self.consumed + bytes,
            ..self.clone()
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn header(&self) -> Option<&HeaderBlock> {
        self.header.as_deref()
    }

    /// Bytes of entry data read since the header.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn target(&self) -> Option<&Path> {
        self.target.as_deref()
    }

    pub fn declared_size(&self) -> u64 {
        self.header.as_ref().map_or(0, |h| h.header.size)
    }

    /// Entry data still unread.
    pub fn remaining(&self) -> u64 {
        self.declared_size().saturating_sub(self.consumed)
    }

    /// Size of the next read, never more than one block.
    pub fn next_chunk(&self) -> usize {
        self.remaining().min(BLOCK_SIZE as u64) as usize
    }

    /// Padding left after `consumed` bytes to reach the block boundary.
    pub fn bytes_till_end_of_block(&self) -> u64 {
        padding(self.consumed)
    }

    /// Forward distance from here to the next header: unread data plus the
    /// padding that follows it.
    pub fn distance_to_next_header(&self) -> u64 {
        let remaining = self.remaining();
        remaining + self.with_consumed(remaining).bytes_till_end_of_block()
    }
}

/// Relative seek that moves from the end of a shifted block to the real
/// header start `junk_offset` bytes past the block start.
pub fn realignment_seek(junk_offset: u64) -> i64 {
    junk_offset as i64 - BLOCK_SIZE as i64
}

/// Where an entry named `name` lands under `output_dir`.
///
/// With `sanitize`, absolute names and names with `..` components are
/// rejected; `.` components are dropped.
pub fn entry_target(output_dir: &Path, name: &str, sanitize: bool) -> Result<PathBuf> {
    if !sanitize {
        return Ok(output_dir.join(name));
    }
    let unsafe_path = || Error::UnsafeEntryPath {
        name: name.to_string(),
    };
    let mut relative = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path());
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(unsafe_path());
    }
    Ok(output_dir.join(relative))
}
