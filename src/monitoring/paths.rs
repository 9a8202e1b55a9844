use std::path::{Path, PathBuf};

/// Socket file extension
pub const SOCKET_EXTENSION: &str = "sock";

/// `<socket-dir>/<instance-id>.sock`
pub fn socket_path(socket_dir: &Path, instance_id: &str) -> PathBuf {
    socket_dir.join(format!("{instance_id}.{SOCKET_EXTENSION}"))
}

/// Instance id encoded in a socket file name, if it is one
pub fn instance_id_from_path(path: &Path) -> Option<String> {
    if path.extension()? != SOCKET_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_roundtrip() {
        let path = socket_path(Path::new("/run/ploy"), "5d1c-aa");
        assert_eq!(path, PathBuf::from("/run/ploy/5d1c-aa.sock"));
        assert_eq!(instance_id_from_path(&path).as_deref(), Some("5d1c-aa"));
    }

    #[test]
    fn test_non_socket_names_ignored() {
        assert!(instance_id_from_path(Path::new("/run/ploy/notes.txt")).is_none());
        assert!(instance_id_from_path(Path::new("/run/ploy/.sock")).is_none());
        assert!(instance_id_from_path(Path::new("/run/ploy/plain")).is_none());
    }
}
