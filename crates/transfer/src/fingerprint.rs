use crate::chunked::checksum_bytes;
use crate::source::FileInfo;

/// Derives the resume key for a file bound to a destination group.
///
/// The same file queued for the same group always maps to the same key,
/// across restarts, so a partially uploaded remote session can be found
/// again. Fields are NUL-separated so that `("ab", "c")` and `("a", "bc")`
/// do not collide.
pub fn fingerprint(info: &FileInfo, group_id: &str) -> String {
    let material = format!(
        "{}\0{}\0{}\0{}",
        info.name, info.size, info.last_modified, group_id
    );
    format!("tus-{}", checksum_bytes(material.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, size: u64, last_modified: i64) -> FileInfo {
        FileInfo {
            name: name.into(),
            size,
            mime_type: String::new(),
            last_modified,
        }
    }

    #[test]
    fn stable_for_same_input() {
        let a = fingerprint(&info("video.mp4", 1024, 1_700_000_000_000), "task-1");
        let b = fingerprint(&info("video.mp4", 1024, 1_700_000_000_000), "task-1");
        assert_eq!(a, b);
        assert!(a.starts_with("tus-"));
        assert_eq!(a.len(), 4 + 64);
    }

    #[test]
    fn differs_per_group() {
        let file = info("video.mp4", 1024, 1);
        assert_ne!(fingerprint(&file, "task-1"), fingerprint(&file, "task-2"));
    }

    #[test]
    fn differs_when_file_changes() {
        let base = fingerprint(&info("a.bin", 10, 1), "g");
        assert_ne!(base, fingerprint(&info("a.bin", 11, 1), "g"));
        assert_ne!(base, fingerprint(&info("a.bin", 10, 2), "g"));
        assert_ne!(base, fingerprint(&info("b.bin", 10, 1), "g"));
    }

    #[test]
    fn ignores_mime_type() {
        let mut typed = info("a.bin", 10, 1);
        typed.mime_type = "application/octet-stream".into();
        assert_eq!(fingerprint(&typed, "g"), fingerprint(&info("a.bin", 10, 1), "g"));
    }
}
