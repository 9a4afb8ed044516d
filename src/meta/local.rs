//! File-backed metadata backend: one JSON file per key

use super::Backend;
use crate::error::{HullError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn key_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('/') || key.starts_with('.') {
            return Err(HullError::InvalidParam(format!("invalid metadata key {:?}", key)));
        }
        Ok(self.bucket_dir(bucket).join(format!("{}.json", key)))
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

impl Backend for LocalBackend {
    fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<()> {
        let path = self.key_path(bucket, key)?;
        fs::create_dir_all(self.bucket_dir(bucket))?;
        write_atomic(&path, value)
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(bucket, key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, bucket: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let dir = self.bucket_dir(bucket);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            // Skip leftovers of interrupted writes
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            entries.push((key.to_string(), fs::read(&path)?));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    fn remove(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.key_path(bucket, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
