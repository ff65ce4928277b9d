//! Filesystem helpers for the privileged pipeline.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::error::{Result, ToolError};

/// Create `dir` fresh with mode 0700, removing any previous contents.
pub fn create_secure_dir(dir: &Utf8Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

/// First regular file in `dir`, in name order.
pub fn find_first_file(dir: &Utf8Path) -> Result<Utf8PathBuf> {
    let mut files = Vec::new();
    for entry in dir.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    files.into_iter().next().ok_or_else(|| {
        ToolError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no files in {dir}"),
        ))
    })
}

/// Per-invocation work area under the secure base directory.
///
/// The base directory is recreated fresh at 0700 with a `temp-*` directory
/// inside; both are removed again when the work area is dropped, regardless
/// of how the invocation exits.
pub struct WorkArea {
    base: Utf8PathBuf,
    temp: TempDir,
}

impl WorkArea {
    pub fn create(base: &Utf8Path) -> Result<Self> {
        create_secure_dir(base)?;
        let temp = tempfile::Builder::new().prefix("temp-").tempdir_in(base)?;
        Ok(WorkArea {
            base: base.to_owned(),
            temp,
        })
    }

    /// Path of the fresh `temp-*` directory.
    pub fn dir(&self) -> &Utf8Path {
        Utf8Path::from_path(self.temp.path()).expect("work area path is UTF-8")
    }

    /// Create a 0700 subdirectory inside the work area.
    pub fn subdir(&self, name: &str) -> Result<Utf8PathBuf> {
        let path = self.dir().join(name);
        create_secure_dir(&path)?;
        Ok(path)
    }
}

impl Drop for WorkArea {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.base);
    }
}
