use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Hidden sibling that holds new content until it is renamed over the
/// target. Dropped before the rename, it deletes itself.
struct StagedFile {
    path: PathBuf,
    committed: bool,
}

impl StagedFile {
    fn create(target: &Path, dir: &Path) -> io::Result<(Self, File)> {
        let stem = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        let path = dir.join(format!(
            ".{stem}.tmp-{}-{}",
            std::process::id(),
            STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok((
            Self {
                path,
                committed: false,
            },
            file,
        ))
    }

    fn commit(mut self, target: &Path) -> io::Result<()> {
        fs::rename(&self.path, target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Replaces `path` with `content` so readers see either the old or the new
/// bytes, never a torn write. Missing parent directories are created.
pub fn atomic_write_file(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => return Err(io::Error::other("path has no parent directory")),
    };
    fs::create_dir_all(dir)?;

    let (staged, mut file) = StagedFile::create(path, dir)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);
    staged.commit(path)?;

    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Pretty-prints `value` with a trailing newline.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let mut body = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    body.push(b'\n');
    atomic_write_file(path, &body)
}
