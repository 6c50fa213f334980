use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TMP_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Replaces `path` in one shot: the content lands in a sibling temp file
/// and is renamed over the target, so readers never observe a partial
/// write. The temp file is removed again when any stage fails.
pub fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let tmp_path = sibling_tmp_path(path)?;
    let result = write_then_rename(&tmp_path, path, content);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn sibling_tmp_path(path: &Path) -> std::io::Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    let serial = TMP_SERIAL.fetch_add(1, Ordering::Relaxed);
    Ok(parent.join(format!(".antfarm-write-{}-{serial}", std::process::id())))
}

fn write_then_rename(tmp_path: &Path, path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(tmp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);

    fs::rename(tmp_path, path)?;
    // The rename is only durable once the directory entry itself is synced.
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

pub fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}
