//! Module/version identity, artifact shapes and path escaping helpers.

use std::fmt;
use std::io::Cursor;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::{Error, Result};

// ---------------------------------------------------------------------------
// ModuleVersion
// ---------------------------------------------------------------------------

/// Identity of one cached artifact set.  Comparison is byte-exact and
/// case-sensitive; no normalisation is applied anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleVersion {
    pub module: String,
    pub version: String,
}

impl ModuleVersion {
    pub fn new(module: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.module, self.version)
    }
}

pub fn fmt_mod_ver(module: &str, version: &str) -> String {
    format!("{module}@{version}")
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// `.info` / `@latest` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevInfo {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,
}

pub type ZipReader = Box<dyn AsyncRead + Send + Unpin>;

/// Owned archive stream.  Dropping it closes the underlying reader, so any
/// consumer that takes it by value releases it on every exit path.
pub struct ZipArchive {
    reader: ZipReader,
    size: Option<u64>,
}

impl ZipArchive {
    pub fn new(reader: ZipReader, size: Option<u64>) -> Self {
        Self { reader, size }
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        let size = bytes.len() as u64;
        Self::new(Box::new(Cursor::new(bytes)), Some(size))
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn into_reader(self) -> ZipReader {
        self.reader
    }

    /// Drain the stream into memory.
    pub async fn read_all(mut self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(self.size.unwrap_or(0) as usize);
        self.reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| Error::Storage(format!("read zip: {e}")))?;
        Ok(Bytes::from(buf))
    }
}

impl fmt::Debug for ZipArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZipArchive").field("size", &self.size).finish()
    }
}

/// Everything fetched from upstream for one module version.
#[derive(Debug)]
pub struct VersionBundle {
    pub info: Bytes,
    pub go_mod: Bytes,
    pub zip: ZipArchive,
}

// ---------------------------------------------------------------------------
// Case escaping
// ---------------------------------------------------------------------------

/// Escape a module path or version for use in a URL or file path: each
/// upper-case ASCII letter becomes `!` followed by its lower-case form.
pub fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Inverse of [`escape_path`].  Returns `None` for malformed input: a literal
/// upper-case letter, or `!` not followed by a lower-case letter.
pub fn unescape_path(escaped: &str) -> Option<String> {
    let mut out = String::with_capacity(escaped.len());
    let mut bang = false;
    for c in escaped.chars() {
        if bang {
            if !c.is_ascii_lowercase() {
                return None;
            }
            out.push(c.to_ascii_uppercase());
            bang = false;
        } else if c == '!' {
            bang = true;
        } else if c.is_ascii_uppercase() {
            return None;
        } else {
            out.push(c);
        }
    }
    if bang {
        return None;
    }
    Some(out)
}
