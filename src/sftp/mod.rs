//! SFTP engine: per-tab sub-session pool, prioritized operation queue and
//! the streaming transfer engine.

pub mod progress;
pub mod queue;
pub mod session_pool;
pub mod transfer;

use russh_sftp::protocol::FileAttributes;

/// A directory entry as the file-manager surface sees it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    /// Seconds since the epoch, when the server reports it.
    pub modified: Option<u32>,
    pub permissions: Option<u32>,
    pub is_dir: bool,
    pub is_symlink: bool,
}

pub(crate) fn entry_from_attrs(parent: &str, name: &str, attrs: &FileAttributes) -> FileEntry {
    // S_IFLNK from the unix mode bits; the protocol has no dedicated flag.
    let is_symlink = attrs
        .permissions
        .map(|mode| mode & 0o170000 == 0o120000)
        .unwrap_or(false);
    FileEntry {
        name: name.to_string(),
        path: join_remote(parent, name),
        size: attrs.size.unwrap_or(0),
        modified: attrs.mtime,
        permissions: attrs.permissions,
        is_dir: attrs.is_dir(),
        is_symlink,
    }
}

/// Join a remote path and a child name with exactly one `/`.
pub(crate) fn join_remote(parent: &str, name: &str) -> String {
    if parent.is_empty() || parent == "." {
        return name.to_string();
    }
    let trimmed = parent.trim_end_matches('/');
    if trimmed.is_empty() {
        format!("/{name}")
    } else {
        format!("{trimmed}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_join_normalizes_slashes() {
        assert_eq!(join_remote("/tmp", "a.txt"), "/tmp/a.txt");
        assert_eq!(join_remote("/tmp/", "a.txt"), "/tmp/a.txt");
        assert_eq!(join_remote("/", "a.txt"), "/a.txt");
        assert_eq!(join_remote(".", "a.txt"), "a.txt");
        assert_eq!(join_remote("", "a.txt"), "a.txt");
    }
}
