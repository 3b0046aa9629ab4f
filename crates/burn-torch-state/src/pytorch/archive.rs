//! Container reader for `torch.save` archives.
//!
//! Since PyTorch 1.6 a checkpoint is a zip file laid out as:
//!
//! ```text
//! archive/data.pkl        object graph (pickle stream)
//! archive/byteorder       "little" (absent in older files)
//! archive/data/0          raw bytes of storage "0"
//! archive/data/1          ...
//! archive/version
//! ```
//!
//! The top-level directory name is whatever the file was saved as, so entries are located by
//! suffix. `torch.save` stores entries uncompressed and aligned, which lets storages be served
//! as slices of the loaded file without copying.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;
use std::io::{Cursor, Read};
use std::path::Path;

use bytes::Bytes;
use zip::{CompressionMethod, ZipArchive};

use crate::error::{Error, Result};
use crate::file::read_file;

const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";
const PICKLE_ENTRY: &str = "data.pkl";

/// Access to raw storage bytes by container-local key.
pub trait StorageSource {
    /// The bytes of storage `key`, or [`Error::StorageNotFound`].
    fn storage(&self, key: &str) -> Result<Bytes>;
}

impl StorageSource for BTreeMap<String, Bytes> {
    fn storage(&self, key: &str) -> Result<Bytes> {
        self.get(key).cloned().ok_or_else(|| Error::StorageNotFound {
            key: key.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    data_start: u64,
    compressed_size: u64,
    size: u64,
    stored: bool,
}

/// A parsed `torch.save` archive.
#[derive(Debug, Clone)]
pub struct Archive {
    data: Bytes,
    entries: Vec<Entry>,
    pickle: usize,
    prefix: String,
}

impl Archive {
    /// Open an archive on disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let data = read_file(path.as_ref())?;
        Self::from_bytes(data)
    }

    /// Parse an archive held in memory.
    pub fn from_bytes(data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        check_magic(&data)?;

        let mut archive = ZipArchive::new(Cursor::new(data.clone())).map_err(corrupt_zip)?;
        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let file = archive.by_index_raw(i).map_err(corrupt_zip)?;
            let entry = Entry {
                name: file.name().to_string(),
                data_start: file.data_start(),
                compressed_size: file.compressed_size(),
                size: file.size(),
                stored: file.compression() == CompressionMethod::Stored,
            };

            let end = entry.data_start.checked_add(entry.compressed_size);
            if end.is_none_or(|end| end > data.len() as u64) {
                return Err(Error::CorruptZip {
                    reason: format!("entry '{}' extends past the end of the file", entry.name),
                });
            }
            if entry.stored && entry.size != entry.compressed_size {
                return Err(Error::CorruptZip {
                    reason: format!("stored entry '{}' has inconsistent sizes", entry.name),
                });
            }
            entries.push(entry);
        }

        let pickle = entries
            .iter()
            .position(|entry| {
                entry.name == PICKLE_ENTRY || entry.name.ends_with(&format!("/{PICKLE_ENTRY}"))
            })
            .ok_or_else(|| Error::UnsupportedFormat {
                reason: format!("zip archive has no {PICKLE_ENTRY} entry"),
            })?;
        let prefix = entries[pickle]
            .name
            .strip_suffix(PICKLE_ENTRY)
            .unwrap_or_default()
            .to_string();

        let archive = Self {
            data,
            entries,
            pickle,
            prefix,
        };
        archive.check_byte_order()?;

        log::debug!(
            "Opened torch archive: {} entries, object graph in '{}'",
            archive.entries.len(),
            archive.pickle_name()
        );
        Ok(archive)
    }

    /// Names of every entry, in directory order.
    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Name of the object graph entry.
    pub fn pickle_name(&self) -> &str {
        &self.entries[self.pickle].name
    }

    /// The object graph.
    pub fn read_pickle(&self) -> Result<Bytes> {
        self.read(&self.entries[self.pickle])
    }

    /// Read an entry by full name.
    ///
    /// Stored entries are returned as a slice of the archive buffer; compressed entries are
    /// inflated into a new buffer.
    pub fn read_entry(&self, name: &str) -> Result<Bytes> {
        let entry = self.find(name).ok_or_else(|| Error::CorruptZip {
            reason: format!("no entry named '{name}'"),
        })?;
        self.read(entry)
    }

    /// Name of the entry holding storage `key`.
    pub fn storage_entry_name(&self, key: &str) -> Option<&str> {
        let bare = format!("data/{key}");
        let suffix = format!("/{bare}");
        self.find(&format!("{}{bare}", self.prefix))
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|entry| entry.name == bare || entry.name.ends_with(&suffix))
            })
            .map(|entry| entry.name.as_str())
    }

    fn find(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    fn read(&self, entry: &Entry) -> Result<Bytes> {
        if entry.stored {
            let start = entry.data_start as usize;
            let end = start + entry.size as usize;
            return Ok(self.data.slice(start..end));
        }

        let mut archive = ZipArchive::new(Cursor::new(self.data.clone())).map_err(corrupt_zip)?;
        let mut file = archive.by_name(&entry.name).map_err(corrupt_zip)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).map_err(corrupt_zip)?;
        if contents.len() as u64 != entry.size {
            return Err(Error::CorruptZip {
                reason: format!(
                    "entry '{}' inflated to {} bytes, expected {}",
                    entry.name,
                    contents.len(),
                    entry.size
                ),
            });
        }
        Ok(Bytes::from(contents))
    }

    fn check_byte_order(&self) -> Result<()> {
        let name = format!("{}byteorder", self.prefix);
        if self.find(&name).is_none() {
            return Ok(());
        }
        let order = self.read_entry(&name)?;
        match &order[..] {
            b"little" => Ok(()),
            other => Err(Error::UnsupportedFormat {
                reason: format!(
                    "storages are saved with byte order '{}'",
                    String::from_utf8_lossy(other)
                ),
            }),
        }
    }
}

impl StorageSource for Archive {
    fn storage(&self, key: &str) -> Result<Bytes> {
        let name = self
            .storage_entry_name(key)
            .ok_or_else(|| Error::StorageNotFound {
                key: key.to_string(),
            })?;
        self.read_entry(name)
    }
}

/// The zip reader only ever sees the in-memory buffer, so a short read is a truncated
/// container rather than an IO failure.
fn corrupt_zip(error: impl fmt::Display) -> Error {
    Error::CorruptZip {
        reason: error.to_string(),
    }
}

fn check_magic(data: &[u8]) -> Result<()> {
    if data.starts_with(ZIP_MAGIC) {
        return Ok(());
    }
    let reason = match data.first() {
        // Pre-1.6 `torch.save` output: a bare pickle stream followed by the storages.
        Some(0x80) => "legacy torch.save format (PyTorch < 1.6); re-save the checkpoint with a \
                       recent PyTorch version"
            .to_string(),
        Some(_) => "not a zip archive".to_string(),
        None => "empty file".to_string(),
    };
    Err(Error::UnsupportedFormat { reason })
}
