// File I/O collaborators
//
// `FileSource` supplies the bytes of an outgoing file; `FileSink`
// materializes a received one. Both ship with a filesystem and an
// in-memory implementation.

use super::record::FileMeta;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Name used when a received file arrives without a usable one.
pub const FALLBACK_FILE_NAME: &str = "received";

const MAX_NAME_ATTEMPTS: usize = 10_000;

#[async_trait]
pub trait FileSource: Send + Sync {
    fn meta(&self) -> FileMeta;

    async fn read(&self) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait FileSink: Send + Sync {
    /// Store `bytes` under (a sanitized form of) `name`; returns where the
    /// file ended up.
    async fn store(&self, name: &str, bytes: Vec<u8>) -> Result<String>;
}

/// Cheap, cloneable handle to an outgoing file.
#[derive(Clone)]
pub struct FileHandle(Arc<dyn FileSource>);

impl FileHandle {
    pub fn new(source: impl FileSource + 'static) -> Self {
        Self(Arc::new(source))
    }

    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(MemorySource::new(name, bytes))
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(PathSource::open(path).await?))
    }

    pub fn meta(&self) -> FileMeta {
        self.0.meta()
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        self.0.read().await
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FileHandle").field(&self.meta()).finish()
    }
}

#[derive(Debug, Clone)]
pub struct PathSource {
    path: PathBuf,
    meta: FileMeta,
}

impl PathSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        if !metadata.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            meta: FileMeta::new(name, metadata.len()),
            path,
        })
    }
}

#[async_trait]
impl FileSource for PathSource {
    fn meta(&self) -> FileMeta {
        self.meta.clone()
    }

    async fn read(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    bytes: Arc<Vec<u8>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: Arc::new(bytes.into()),
        }
    }
}

#[async_trait]
impl FileSource for MemorySource {
    fn meta(&self) -> FileMeta {
        FileMeta::new(self.name.clone(), self.bytes.len() as u64)
    }

    async fn read(&self) -> Result<Vec<u8>> {
        Ok(self.bytes.as_ref().clone())
    }
}

/// Strip directories and control characters; fall back to `received`.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Writes received files into a directory, never overwriting.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `name`, then `name (1)`, `name (2)`, ... with the extension kept last.
    fn candidate(name: &str, n: usize) -> String {
        if n == 0 {
            return name.to_string();
        }
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{} ({}).{}", stem, n, ext),
            _ => format!("{} ({})", name, n),
        }
    }

    /// Create the first free candidate. `create_new` makes the claim atomic,
    /// so concurrent stores of the same name land on distinct paths.
    async fn claim(&self, name: &str) -> Result<(PathBuf, tokio::fs::File)> {
        for n in 0..MAX_NAME_ATTEMPTS {
            let path = self.dir.join(Self::candidate(name, n));
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create {}", path.display()))
                }
            }
        }
        bail!("No free file name for {} in {}", name, self.dir.display())
    }
}

#[async_trait]
impl FileSink for DirectorySink {
    async fn store(&self, name: &str, bytes: Vec<u8>) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let (path, mut file) = self.claim(&sanitize_file_name(name)).await?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!("Stored {} byte(s) at {}", bytes.len(), path.display());
        Ok(path.display().to_string())
    }
}

/// Keeps received files in memory; handy for tests and simulations.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    files: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> Vec<(String, Vec<u8>)> {
        self.files.lock().clone()
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, bytes)| bytes.clone())
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

#[async_trait]
impl FileSink for MemorySink {
    async fn store(&self, name: &str, bytes: Vec<u8>) -> Result<String> {
        let name = sanitize_file_name(name);
        self.files.lock().push((name.clone(), bytes));
        Ok(format!("memory://{}", name))
    }
}
