//! File System API
//!
//! Node-style `fs` module. Every asynchronous call follows the async module
//! contract: the read or write runs on the worker pool and the callback is
//! invoked on the event loop with the result.
//!
//! # Example
//! ```text
//! fs.readFile("./data.txt", (err, data) => { ... });
//! fs.readdir("./", (err, entries) => { ... });
//! const text = fs.readFileSync("./data.txt");
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{Error, Result};
use crate::event_loop::TaskHandle;
use crate::runtime::HostContext;

/// Attach the offending path to an I/O error, keeping its kind
fn with_path(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |e| {
        Error::from(io::Error::new(
            e.kind(),
            format!("{}: {}", path.display(), e),
        ))
    }
}

/// File information
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub name: String,
    pub path: PathBuf,
    pub is_file: bool,
    pub is_directory: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub readonly: bool,
}

impl FileInfo {
    pub fn from_path(path: &Path) -> Result<Self> {
        let link = fs::symlink_metadata(path).map_err(with_path(path))?;
        let metadata = if link.file_type().is_symlink() {
            fs::metadata(path).map_err(with_path(path))?
        } else {
            link.clone()
        };

        Ok(Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            is_file: metadata.is_file(),
            is_directory: metadata.is_dir(),
            is_symlink: link.file_type().is_symlink(),
            size: metadata.len(),
            modified: metadata.modified().ok(),
            readonly: metadata.permissions().readonly(),
        })
    }
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_file: bool,
    pub is_directory: bool,
    pub is_symlink: bool,
}

// ---------------------------------------------------------------------------
// Blocking file system
// ---------------------------------------------------------------------------

/// Blocking file operations, relative paths resolved against a working
/// directory
#[derive(Debug, Clone)]
pub struct FileSystem {
    cwd: PathBuf,
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem {
    pub fn new() -> Self {
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
        }
    }

    pub fn with_cwd(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Resolve a path relative to the working directory
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    /// Read a binary file
    pub fn read_file(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = self.resolve(path);
        fs::read(&path).map_err(with_path(&path))
    }

    /// Read a UTF-8 text file
    pub fn read_to_string(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = self.resolve(path);
        fs::read_to_string(&path).map_err(with_path(&path))
    }

    /// Create or truncate a file and write `content` to it
    pub fn write_file(&self, path: impl AsRef<Path>, content: &[u8]) -> Result<()> {
        let path = self.resolve(path);
        fs::write(&path, content).map_err(with_path(&path))
    }

    /// Append to a file, creating it if needed
    pub fn append_file(&self, path: impl AsRef<Path>, content: &[u8]) -> Result<()> {
        let path = self.resolve(path);
        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(with_path(&path))?;
        file.write_all(content).map_err(with_path(&path))
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.resolve(path).exists()
    }

    pub fn stat(&self, path: impl AsRef<Path>) -> Result<FileInfo> {
        FileInfo::from_path(&self.resolve(path))
    }

    /// Read directory contents, sorted by name
    pub fn read_dir(&self, path: impl AsRef<Path>) -> Result<Vec<DirEntry>> {
        let path = self.resolve(path);
        let entries = fs::read_dir(&path).map_err(with_path(&path))?;

        let mut result = Vec::new();
        for entry in entries {
            let entry = entry.map_err(with_path(&path))?;
            let file_type = entry.file_type().map_err(with_path(&entry.path()))?;
            result.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_file: file_type.is_file(),
                is_directory: file_type.is_dir(),
                is_symlink: file_type.is_symlink(),
            });
        }
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    /// Create a directory
    pub fn mkdir(&self, path: impl AsRef<Path>, recursive: bool) -> Result<()> {
        let path = self.resolve(path);
        if recursive {
            fs::create_dir_all(&path)
        } else {
            fs::create_dir(&path)
        }
        .map_err(with_path(&path))
    }

    /// Remove a file or an empty directory
    pub fn remove(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = self.resolve(path);
        if path.is_dir() {
            fs::remove_dir(&path)
        } else {
            fs::remove_file(&path)
        }
        .map_err(with_path(&path))
    }
}

// ---------------------------------------------------------------------------
// Async module
// ---------------------------------------------------------------------------

/// The `fs` built-in module
#[derive(Debug, Clone)]
pub struct FsModule {
    context: HostContext,
    fs: Arc<FileSystem>,
}

impl FsModule {
    pub fn new(context: HostContext) -> Self {
        Self::with_file_system(context, FileSystem::new())
    }

    pub fn with_file_system(context: HostContext, fs: FileSystem) -> Self {
        Self {
            context,
            fs: Arc::new(fs),
        }
    }

    /// `fs.readFile(path, cb)`
    pub fn read_file<C>(&self, path: impl Into<PathBuf>, callback: C) -> TaskHandle
    where
        C: FnOnce(Result<Vec<u8>>) -> Result<()> + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        let path = path.into();
        self.context
            .spawn_blocking("fs.readFile", move || fs.read_file(&path), callback)
    }

    /// `fs.readFile(path, "utf8", cb)`
    pub fn read_to_string<C>(&self, path: impl Into<PathBuf>, callback: C) -> TaskHandle
    where
        C: FnOnce(Result<String>) -> Result<()> + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        let path = path.into();
        self.context
            .spawn_blocking("fs.readFile", move || fs.read_to_string(&path), callback)
    }

    /// `fs.writeFile(path, data, cb)`
    pub fn write_file<C>(
        &self,
        path: impl Into<PathBuf>,
        content: impl Into<Vec<u8>>,
        callback: C,
    ) -> TaskHandle
    where
        C: FnOnce(Result<()>) -> Result<()> + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        let path = path.into();
        let content = content.into();
        self.context
            .spawn_blocking("fs.writeFile", move || fs.write_file(&path, &content), callback)
    }

    /// `fs.appendFile(path, data, cb)`
    pub fn append_file<C>(
        &self,
        path: impl Into<PathBuf>,
        content: impl Into<Vec<u8>>,
        callback: C,
    ) -> TaskHandle
    where
        C: FnOnce(Result<()>) -> Result<()> + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        let path = path.into();
        let content = content.into();
        self.context
            .spawn_blocking("fs.appendFile", move || fs.append_file(&path, &content), callback)
    }

    /// `fs.readdir(path, cb)`
    pub fn read_dir<C>(&self, path: impl Into<PathBuf>, callback: C) -> TaskHandle
    where
        C: FnOnce(Result<Vec<DirEntry>>) -> Result<()> + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        let path = path.into();
        self.context
            .spawn_blocking("fs.readdir", move || fs.read_dir(&path), callback)
    }

    /// `fs.stat(path, cb)`
    pub fn stat<C>(&self, path: impl Into<PathBuf>, callback: C) -> TaskHandle
    where
        C: FnOnce(Result<FileInfo>) -> Result<()> + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        let path = path.into();
        self.context
            .spawn_blocking("fs.stat", move || fs.stat(&path), callback)
    }

    /// `fs.exists(path, cb)`
    pub fn exists<C>(&self, path: impl Into<PathBuf>, callback: C) -> TaskHandle
    where
        C: FnOnce(Result<bool>) -> Result<()> + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        let path = path.into();
        self.context
            .spawn_blocking("fs.exists", move || Ok(fs.exists(&path)), callback)
    }

    /// `fs.readFileSync(path)`. Blocks the caller.
    pub fn read_file_sync(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        self.fs.read_file(path)
    }

    /// `fs.readFileSync(path, "utf8")`. Blocks the caller.
    pub fn read_to_string_sync(&self, path: impl AsRef<Path>) -> Result<String> {
        self.fs.read_to_string(path)
    }

    /// `fs.writeFileSync(path, data)`. Blocks the caller.
    pub fn write_file_sync(&self, path: impl AsRef<Path>, content: &[u8]) -> Result<()> {
        self.fs.write_file(path, content)
    }

    pub fn exists_sync(&self, path: impl AsRef<Path>) -> bool {
        self.fs.exists(path)
    }

    pub fn file_system(&self) -> &FileSystem {
        &self.fs
    }
}
