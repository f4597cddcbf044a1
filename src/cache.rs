//! Timestamp-based reuse of generated code and binaries.
//!
//! Pure metadata reads; nothing here ever raises for a missing candidate.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::Result;

/// Modification time of `path`.
pub fn modified(path: &Path) -> Result<SystemTime> {
    Ok(std::fs::metadata(path)?.modified()?)
}

/// First candidate, in the given order, that is a file strictly newer than
/// `upstream`. Equal timestamps count as stale.
pub fn find_reusable<P: AsRef<Path>>(upstream: SystemTime, candidates: &[P]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(AsRef::<Path>::as_ref)
        .find(|p| {
            p.is_file()
                && std::fs::metadata(p)
                    .and_then(|m| m.modified())
                    .map(|t| t > upstream)
                    .unwrap_or(false)
        })
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    fn file_at(dir: &TempDir, name: &str, mtime: SystemTime) -> PathBuf {
        let path = dir.path().join(name);
        let f = File::create(&path).expect("create file");
        f.set_modified(mtime).expect("set mtime");
        path
    }

    #[test]
    fn newer_candidate_is_reused() {
        let dir = TempDir::new().expect("tempdir");
        let t0 = SystemTime::now() - Duration::from_secs(100);
        let old = file_at(&dir, "old.c", t0 - Duration::from_secs(10));
        let new = file_at(&dir, "new.c", t0 + Duration::from_secs(10));

        let found = find_reusable(t0, &[&old, &new]);
        assert_eq!(found, Some(new));
    }

    #[test]
    fn first_qualifying_candidate_wins() {
        let dir = TempDir::new().expect("tempdir");
        let t0 = SystemTime::now() - Duration::from_secs(100);
        let a = file_at(&dir, "a.out", t0 + Duration::from_secs(1));
        let b = file_at(&dir, "b.out", t0 + Duration::from_secs(50));

        let found = find_reusable(t0, &[&a, &b]);
        assert_eq!(found, Some(a));
    }

    #[test]
    fn ties_missing_and_directories_are_not_reused() {
        let dir = TempDir::new().expect("tempdir");
        let t0 = SystemTime::now() - Duration::from_secs(100);
        let tied = file_at(&dir, "tied.c", t0);
        let missing = dir.path().join("missing.c");
        let subdir = dir.path().join("sub");
        std::fs::create_dir(&subdir).expect("mkdir");

        assert_eq!(find_reusable(t0, &[tied, missing, subdir]), None);
    }

    #[test]
    fn no_candidates() {
        let empty: [PathBuf; 0] = [];
        assert_eq!(find_reusable(SystemTime::now(), &empty), None);
    }
}
