use std::io;
use std::path::{Path, PathBuf};

/// Write `data` to a sibling `.tmp` file, then rename it over `path`. The
/// rename is atomic on POSIX since both live in the same directory.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

/// Same as [`atomic_write`], but the file is only readable by the owner,
/// from the moment it is created. Used for private keys and secrets.
pub fn atomic_write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    use std::io::Write;

    let tmp = path.with_extension("tmp");
    // A leftover temp file would keep its old mode.
    match std::fs::remove_file(&tmp) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(data)?;
    drop(file);

    std::fs::rename(&tmp, path)
}

/// Sibling path used to stage a document before it replaces `path`.
pub fn staged_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".staged");
    path.with_file_name(name)
}

/// Read a file, mapping "does not exist" to `None`.
pub fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
