//! Filesystem backends
//!
//! [`OsFs`] serves the real filesystem and is the only backend that can
//! persist compressed siblings or stream big files from pooled handles.
//! [`MemoryFs`] is a read-only virtual tree whose files are always served
//! from memory.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Component, Path};
use std::time::SystemTime;

/// Metadata the server needs about a file or directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub is_dir: bool,
    pub len: u64,
    pub modified: SystemTime,
}

/// One child of a listed directory
#[derive(Debug)]
pub struct DirEntry {
    pub name: String,
    pub metadata: io::Result<FileMeta>,
}

/// Backend the static file server reads from
#[async_trait]
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Metadata for `path`, following symlinks
    async fn metadata(&self, path: &Path) -> io::Result<FileMeta>;

    /// Children of a directory, in no particular order
    async fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;

    /// Full contents of a file
    async fn read(&self, path: &Path) -> io::Result<Bytes>;

    /// Whether paths are real OS paths that can be opened and written directly
    fn is_os(&self) -> bool {
        false
    }
}

// ============================================================================
// OS Filesystem
// ============================================================================

/// The real filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFs;

fn to_meta(metadata: &std::fs::Metadata) -> io::Result<FileMeta> {
    Ok(FileMeta {
        is_dir: metadata.is_dir(),
        len: metadata.len(),
        modified: metadata.modified()?,
    })
}

#[async_trait]
impl FileSystem for OsFs {
    async fn metadata(&self, path: &Path) -> io::Result<FileMeta> {
        let metadata = tokio::fs::metadata(path).await?;
        to_meta(&metadata)
    }

    async fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut items = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            // Follow symlinks so linked directories list as directories
            let metadata = match tokio::fs::metadata(entry.path()).await {
                Ok(m) => to_meta(&m),
                Err(e) => Err(e),
            };
            items.push(DirEntry { name, metadata });
        }

        Ok(items)
    }

    async fn read(&self, path: &Path) -> io::Result<Bytes> {
        tokio::fs::read(path).await.map(Bytes::from)
    }

    fn is_os(&self) -> bool {
        true
    }
}

// ============================================================================
// In-memory Filesystem
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Bytes,
    modified: SystemTime,
}

/// Virtual filesystem held in memory.
///
/// Paths are slash-separated and relative; the empty path is the root.
/// Directories exist implicitly as prefixes of stored files.
#[derive(Debug, Default)]
pub struct MemoryFs {
    files: RwLock<BTreeMap<String, MemoryFile>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file, stamped with the current time
    pub fn insert(&self, path: impl AsRef<str>, data: impl Into<Bytes>) {
        self.insert_with_modified(path, data, SystemTime::now());
    }

    /// Add or replace a file with an explicit modification time
    pub fn insert_with_modified(
        &self,
        path: impl AsRef<str>,
        data: impl Into<Bytes>,
        modified: SystemTime,
    ) {
        let key = path.as_ref().trim_matches('/').to_string();
        self.files.write().insert(
            key,
            MemoryFile {
                data: data.into(),
                modified,
            },
        );
    }

    /// Remove a file, returning whether it existed
    pub fn remove(&self, path: impl AsRef<str>) -> bool {
        self.files
            .write()
            .remove(path.as_ref().trim_matches('/'))
            .is_some()
    }

    fn key(path: &Path) -> io::Result<String> {
        let mut parts = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "path is not valid UTF-8")
                })?),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "path escapes the virtual root",
                    ))
                }
            }
        }
        Ok(parts.join("/"))
    }

    fn dir_prefix(key: &str) -> String {
        if key.is_empty() {
            String::new()
        } else {
            format!("{}/", key)
        }
    }
}

#[async_trait]
impl FileSystem for MemoryFs {
    async fn metadata(&self, path: &Path) -> io::Result<FileMeta> {
        let key = Self::key(path)?;
        let files = self.files.read();

        if let Some(file) = files.get(&key) {
            return Ok(FileMeta {
                is_dir: false,
                len: file.data.len() as u64,
                modified: file.modified,
            });
        }

        let prefix = Self::dir_prefix(&key);
        let newest = files
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, f)| f.modified)
            .max();

        match newest {
            Some(modified) => Ok(FileMeta {
                is_dir: true,
                len: 0,
                modified,
            }),
            None if key.is_empty() => Ok(FileMeta {
                is_dir: true,
                len: 0,
                modified: SystemTime::UNIX_EPOCH,
            }),
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    async fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let key = Self::key(path)?;
        let prefix = Self::dir_prefix(&key);
        let files = self.files.read();

        let mut children: BTreeMap<&str, FileMeta> = BTreeMap::new();
        for (k, file) in files
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
        {
            let rest = &k[prefix.len()..];
            match rest.split_once('/') {
                None => {
                    children.insert(
                        rest,
                        FileMeta {
                            is_dir: false,
                            len: file.data.len() as u64,
                            modified: file.modified,
                        },
                    );
                }
                Some((dir, _)) => {
                    let meta = children.entry(dir).or_insert(FileMeta {
                        is_dir: true,
                        len: 0,
                        modified: file.modified,
                    });
                    meta.modified = meta.modified.max(file.modified);
                }
            }
        }

        if children.is_empty() && !key.is_empty() && !files.contains_key(&key) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        if files.contains_key(&key) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a directory",
            ));
        }

        Ok(children
            .into_iter()
            .map(|(name, meta)| DirEntry {
                name: name.to_string(),
                metadata: Ok(meta),
            })
            .collect())
    }

    async fn read(&self, path: &Path) -> io::Result<Bytes> {
        let key = Self::key(path)?;
        self.files
            .read()
            .get(&key)
            .map(|f| f.data.clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}
