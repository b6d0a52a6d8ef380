use std::path::{Path, PathBuf};

/// Directory for handler sockets.
/// Uses `$XDG_RUNTIME_DIR/snapfault`, falling back to `/tmp/snapfault`.
pub fn socket_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("snapfault"),
        _ => PathBuf::from("/tmp/snapfault"),
    }
}

/// Default socket for serving `mem_file`: `uffd-<stem>-<pid>.sock` under
/// [`socket_dir`]. The pid keeps concurrent restores of one snapshot apart.
pub fn default_socket_path(mem_file: &Path) -> PathBuf {
    let stem = mem_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "memory".to_string());
    socket_dir().join(format!("uffd-{}-{}.sock", stem, std::process::id()))
}
