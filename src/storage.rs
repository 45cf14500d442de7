// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Storage handle for fragment data. A fragment is a directory under the
// array root; tile streams are appended to per-name files inside it and
// the empty `__ok` marker, created by atomic rename, makes the fragment
// visible. Removal of an uncommitted fragment is best-effort.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::meta::COMMIT_FILE;

pub(crate) fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

/// Byte-range object store rooted at the array directory. `append`,
/// `write_file` and `commit` on distinct paths are independent, which
/// the per-name parallel write path relies on.
#[derive(Debug, Clone)]
pub struct StorageManager {
    root: PathBuf,
}

impl StorageManager {
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fragment_dir(&self, fragment: &str) -> PathBuf {
        self.root.join(fragment)
    }

    pub fn create_fragment(&self, fragment: &str) -> io::Result<PathBuf> {
        let dir = self.fragment_dir(fragment);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Appends `bytes` to `file` under the fragment dir and returns the
    /// byte offset the write started at.
    pub fn append(&self, fragment_dir: &Path, file: &str, bytes: &[u8]) -> io::Result<u64> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(fragment_dir.join(file))?;
        let offset = f.seek(SeekFrom::End(0))?;
        let mut writer = BufWriter::new(&mut f);
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(offset)
    }

    /// Writes `file` in one shot, replacing any previous content.
    pub fn write_file(&self, fragment_dir: &Path, file: &str, bytes: &[u8]) -> io::Result<()> {
        let mut f = File::create(fragment_dir.join(file))?;
        f.write_all(bytes)?;
        f.flush()
    }

    /// Creates the commit marker. The marker is staged as a hidden temp
    /// file and renamed into place so its appearance is atomic.
    pub fn commit(&self, fragment_dir: &Path) -> io::Result<()> {
        let tmp = fragment_dir.join(format!(
            ".{}.{}.{}.tmp",
            COMMIT_FILE,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));
        let f = File::create(&tmp)?;
        f.sync_all()?;
        std::fs::rename(&tmp, fragment_dir.join(COMMIT_FILE))?;
        log::debug!("committed fragment {}", fragment_dir.display());
        Ok(())
    }

    pub fn is_committed(fragment_dir: &Path) -> bool {
        fragment_dir.join(COMMIT_FILE).exists()
    }

    /// Removes the fragment prefix recursively. Absence is not an
    /// error; other failures are logged and swallowed.
    pub fn nuke(&self, fragment_dir: &Path) {
        match std::fs::remove_dir_all(fragment_dir) {
            Ok(()) => log::warn!("removed partial fragment {}", fragment_dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "failed to remove partial fragment {}: {e}",
                fragment_dir.display()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_root(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "gridstore_storage_test_{}_{}_{}",
            name,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        p
    }

    #[test]
    fn test_fnv1a32_vectors() {
        assert_eq!(fnv1a32(b""), 0x811c9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c292c);
    }

    #[test]
    fn test_append_returns_offsets() {
        let root = fresh_root("append");
        let sm = StorageManager::new(&root).unwrap();
        let dir = sm
            .create_fragment("__1_1_00000000000000000000000000000000_1")
            .unwrap();
        assert_eq!(sm.append(&dir, "a.tdb", &[1, 2, 3]).unwrap(), 0);
        assert_eq!(sm.append(&dir, "a.tdb", &[4, 5]).unwrap(), 3);
        assert_eq!(std::fs::read(dir.join("a.tdb")).unwrap(), vec![1, 2, 3, 4, 5]);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_commit_marker_gates_visibility() {
        let root = fresh_root("commit");
        let sm = StorageManager::new(&root).unwrap();
        let dir = sm.create_fragment("frag").unwrap();
        assert!(!StorageManager::is_committed(&dir));
        sm.commit(&dir).unwrap();
        assert!(StorageManager::is_committed(&dir));
        // No temp file is left behind.
        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_nuke_is_recursive_and_idempotent() {
        let root = fresh_root("nuke");
        let sm = StorageManager::new(&root).unwrap();
        let dir = sm.create_fragment("frag").unwrap();
        sm.append(&dir, "a.tdb", &[0; 16]).unwrap();
        sm.nuke(&dir);
        assert!(!dir.exists());
        // Nuking an absent fragment is fine.
        sm.nuke(&dir);
        let _ = std::fs::remove_dir_all(&root);
    }
}
