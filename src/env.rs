use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Filesystem abstraction used by the log.
///
/// The production implementation is a thin veneer over `std::fs`; tests
/// run it against a `TempDir`. File handles themselves are plain
/// `std::fs::File` so positioned reads and writes go through
/// `std::os::unix::fs::FileExt` without another layer of indirection.
pub trait FsEnv: Send + Sync {
    fn create_dir_if_missing(&self, dir: &Path) -> io::Result<()>;

    fn file_exists(&self, path: &Path) -> bool;

    /// Opens a fresh writable file, truncating any existing content.
    fn new_writable_file(&self, path: &Path) -> io::Result<File>;

    /// Creates a uniquely named writable file in `dir` whose name starts
    /// with `prefix`, returning the chosen path and the handle.
    fn new_temp_writable_file(&self, dir: &Path, prefix: &str) -> io::Result<(PathBuf, File)>;

    /// Opens an existing file for positioned reads.
    fn new_random_access_file(&self, path: &Path) -> io::Result<File>;

    /// Opens a file for positioned reads and writes, creating it when
    /// missing and preserving existing content. Used for index chunks.
    fn new_read_write_file(&self, path: &Path) -> io::Result<File>;

    fn rename_file(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Durably persists directory metadata (created/renamed entries).
    fn sync_dir(&self, dir: &Path) -> io::Result<()>;

    fn delete_file(&self, path: &Path) -> io::Result<()>;

    fn delete_recursively(&self, dir: &Path) -> io::Result<()>;

    /// Free bytes available to this process on the filesystem holding
    /// `path`.
    fn available_space(&self, path: &Path) -> io::Result<u64>;

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;
}

/// `FsEnv` backed by the local filesystem.
#[derive(Debug, Default)]
pub struct StdFsEnv;

impl FsEnv for StdFsEnv {
    fn create_dir_if_missing(&self, dir: &Path) -> io::Result<()> {
        if dir.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(dir)
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn new_writable_file(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
    }

    fn new_temp_writable_file(&self, dir: &Path, prefix: &str) -> io::Result<(PathBuf, File)> {
        // Retry on the (unlikely) collision of two identical random
        // suffixes.
        for _ in 0..16 {
            let suffix: u32 = rand::random();
            let path = dir.join(format!("{}{:08x}", prefix, suffix));
            match OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path)
            {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "could not create unique temp file",
        ))
    }

    fn new_random_access_file(&self, path: &Path) -> io::Result<File> {
        File::open(path)
    }

    fn new_read_write_file(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
    }

    fn rename_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn sync_dir(&self, dir: &Path) -> io::Result<()> {
        File::open(dir)?.sync_all()
    }

    fn delete_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn delete_recursively(&self, dir: &Path) -> io::Result<()> {
        fs::remove_dir_all(dir)
    }

    fn available_space(&self, path: &Path) -> io::Result<u64> {
        // std has no portable statvfs; conservatively report "plenty" and
        // let the write itself surface ENOSPC. Embedders with real
        // reservation requirements supply their own FsEnv.
        if !path.exists() {
            warn!("available_space queried for missing path {:?}", path);
        }
        Ok(u64::MAX)
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            out.push(entry?.path());
        }
        Ok(out)
    }
}
