//! Temp-file + rename primitives.
//!
//! Content is written to a hidden `.partial` file next to its destination and renamed
//! over the final name once complete, so a reader never observes a half written file
//! under the final name.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Suffix of in-flight files.
pub const PARTIAL_SUFFIX: &str = ".partial";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Unique temporary sibling of `dest`.
pub fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let n = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    dest.with_file_name(format!(
        ".{name}.{}.{n}{PARTIAL_SUFFIX}",
        std::process::id()
    ))
}

/// A temporary file that is removed on drop unless persisted.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    armed: bool,
}

impl StagedFile {
    /// Create a fresh temporary sibling of `dest`.
    pub fn create(dest: &Path) -> io::Result<(Self, File)> {
        let path = partial_path(dest);
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok((Self { path, armed: true }, file))
    }

    /// Rename the staged file to `dest`, replacing anything already there.
    pub fn persist(mut self, dest: &Path) -> io::Result<()> {
        fs::rename(&self.path, dest)?;
        self.armed = false;
        sync_parent(dest);
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!(target: "engine::store", "Unable to remove {}: {e}", self.path.display());
                }
            }
        }
    }
}

/// Atomically replace `dest` with `content`.
pub fn write_atomic(dest: &Path, content: &[u8]) -> io::Result<()> {
    let (staged, mut file) = StagedFile::create(dest)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);
    staged.persist(dest)
}

/// Remove temporary files left in `dir` by interrupted writes. Returns how many were removed.
///
/// Only safe while no other writer stages into `dir`.
pub fn sweep_partials(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX)) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

// Directory fsync is not available everywhere; the rename itself is what matters.
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
