use crate::error::{FileStoreError, IoOp};
use std::fs;
use std::path::{Path, PathBuf};

pub type StoreResult<T> = std::result::Result<T, FileStoreError>;

pub trait FileStore: Send + Sync {
  fn read(&self, path: &Path) -> StoreResult<Vec<u8>>;
  fn write(&self, path: &Path, bytes: &[u8]) -> StoreResult<()>;
  fn copy(&self, from: &Path, to: &Path) -> StoreResult<()>;
  fn rename(&self, from: &Path, to: &Path) -> StoreResult<()>;
  fn delete(&self, path: &Path) -> StoreResult<()>;
  fn list(&self, dir: &Path) -> StoreResult<Vec<PathBuf>>;
}

/// Plain local filesystem. Writes go through a temp file and a rename so a
/// reader never observes a half-written artifact.
#[derive(Debug, Clone, Default)]
pub struct LocalFileStore;

impl FileStore for LocalFileStore {
  fn read(&self, path: &Path) -> StoreResult<Vec<u8>> {
    fs::read(path).map_err(|e| FileStoreError::from_io(path, IoOp::Read, e))
  }

  fn write(&self, path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let dir = path
      .parent()
      .ok_or_else(|| FileStoreError::NotFound(path.to_path_buf()))?;
    fs::create_dir_all(dir).map_err(|e| FileStoreError::from_io(dir, IoOp::Write, e))?;

    let tmp = tmp_path(path);
    fs::write(&tmp, bytes).map_err(|e| FileStoreError::from_io(&tmp, IoOp::Write, e))?;
    if let Err(e) = fs::rename(&tmp, path) {
      let _ = fs::remove_file(&tmp);
      return Err(FileStoreError::from_io(path, IoOp::Write, e));
    }
    Ok(())
  }

  fn copy(&self, from: &Path, to: &Path) -> StoreResult<()> {
    if to.exists() {
      return Err(FileStoreError::AlreadyExists(to.to_path_buf()));
    }
    fs::copy(from, to)
      .map(|_| ())
      .map_err(|e| FileStoreError::from_io(from, IoOp::Other, e))
  }

  fn rename(&self, from: &Path, to: &Path) -> StoreResult<()> {
    if to.exists() {
      return Err(FileStoreError::AlreadyExists(to.to_path_buf()));
    }
    fs::rename(from, to).map_err(|e| FileStoreError::from_io(from, IoOp::Other, e))
  }

  fn delete(&self, path: &Path) -> StoreResult<()> {
    fs::remove_file(path).map_err(|e| FileStoreError::from_io(path, IoOp::Other, e))
  }

  fn list(&self, dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| FileStoreError::from_io(dir, IoOp::Read, e))?;
    let mut out: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    out.sort();
    Ok(out)
  }
}

fn tmp_path(dst: &Path) -> PathBuf {
  let name = dst.file_name().and_then(|s| s.to_str()).unwrap_or("tmp");
  dst.with_file_name(format!(".{name}.tmp"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn write_read_list_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalFileStore;
    let a = dir.path().join("nested").join("a.bin");

    store.write(&a, b"one").unwrap();
    store.write(&a, b"two").unwrap();
    assert_eq!(store.read(&a).unwrap(), b"two");
    assert_eq!(store.list(&dir.path().join("nested")).unwrap(), vec![a.clone()]);

    store.delete(&a).unwrap();
    assert!(matches!(store.read(&a), Err(FileStoreError::NotFound(_))));
    assert!(matches!(store.delete(&a), Err(FileStoreError::NotFound(_))));
  }

  #[test]
  fn copy_and_rename_refuse_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalFileStore;
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    store.write(&a, b"x").unwrap();
    store.write(&b, b"y").unwrap();

    assert!(matches!(store.copy(&a, &b), Err(FileStoreError::AlreadyExists(_))));
    assert!(matches!(store.rename(&a, &b), Err(FileStoreError::AlreadyExists(_))));

    let c = dir.path().join("c");
    store.rename(&a, &c).unwrap();
    assert!(!a.exists());
    assert_eq!(store.read(&c).unwrap(), b"x");
  }
}
