use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{CasError, CasStore, Digest, Result};

/// Filesystem blob store, sharded by the first two hex characters.
///
/// Layout: `<root>/objects/<2 hex>/<62 hex>`
pub struct FsCasStore {
    objects_dir: PathBuf,
}

impl FsCasStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let objects_dir = root.as_ref().join("objects");
        fs::create_dir_all(&objects_dir)?;
        Ok(Self { objects_dir })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }

    /// Snapshot a file on disk. Returns `None` when the file does not exist.
    pub fn snapshot(&self, path: &Path) -> Result<Option<Digest>> {
        match fs::read(path) {
            Ok(data) => self.put(&data).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CasError::Io(e)),
        }
    }

    /// Write a stored blob back to `path`, replacing whatever is there.
    pub fn restore(&self, digest: &Digest, path: &Path) -> Result<()> {
        let data = self.get(digest)?;
        write_atomic(path, &data)
    }
}

impl CasStore for FsCasStore {
    fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::compute(data);
        let path = self.blob_path(&digest);
        if path.exists() {
            return Ok(digest);
        }
        write_atomic(&path, data)?;
        Ok(digest)
    }

    fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        fs::read(self.blob_path(digest)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CasError::NotFound(*digest)
            } else {
                CasError::Io(e)
            }
        })
    }

    fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.blob_path(digest).exists())
    }
}

/// Write through a temp file in the destination directory, then rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;
    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsCasStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCasStore::new(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[test]
    fn same_translation_stored_once() {
        let (dir, store) = make_store();
        let src = b"pub fn add(a: i32, b: i32) -> i32 { a + b }";
        let d1 = store.put(src).unwrap();
        let d2 = store.put(src).unwrap();
        assert_eq!(d1, d2);

        let hex = d1.to_hex();
        let shard = dir.path().join("blobs/objects").join(&hex[..2]);
        assert_eq!(std::fs::read_dir(shard).unwrap().count(), 1);
    }

    #[test]
    fn snapshot_then_restore_reverts_edit() {
        let (dir, store) = make_store();
        let lib = dir.path().join("src/lib.rs");
        write_atomic(&lib, b"pub fn add() {}").unwrap();

        let before = store.snapshot(&lib).unwrap().unwrap();
        std::fs::write(&lib, b"").unwrap();
        store.restore(&before, &lib).unwrap();

        assert_eq!(std::fs::read(&lib).unwrap(), b"pub fn add() {}");
    }

    #[test]
    fn snapshot_of_missing_file_is_none() {
        let (dir, store) = make_store();
        assert!(store.snapshot(&dir.path().join("nope.rs")).unwrap().is_none());
    }

    #[test]
    fn get_unknown_digest_is_not_found() {
        let (_dir, store) = make_store();
        let fake = Digest::compute(b"never stored");
        match store.get(&fake) {
            Err(CasError::NotFound(d)) => assert_eq!(d, fake),
            other => panic!("expected NotFound, got {other:?}"),
        }
        assert!(!store.exists(&fake).unwrap());
    }
}
