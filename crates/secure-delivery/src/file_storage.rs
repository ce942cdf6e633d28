use crate::{Error, Result, StorageAdapter};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Longest hex-encoded key used directly as a file name. Longer keys are
/// hashed to stay under the 255-byte file name limit.
const MAX_ENCODED_KEY_LEN: usize = 200;
const HASHED_PREFIX: &str = "sha256-";

/// File body for a hashed key. The key travels with the value so `list`
/// can recover it.
#[derive(Serialize, Deserialize)]
struct HashedEntry {
    key: String,
    value: String,
}

/// One JSON file per key. File names are the hex-encoded key so that
/// `list` can recover keys that contain `/`.
pub struct FileStorageAdapter {
    base_path: PathBuf,
}

impl FileStorageAdapter {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path)
            .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        Ok(Self { base_path })
    }

    /// Returns the file for `key` and whether its name is a hash.
    fn key_to_path(&self, key: &str) -> (PathBuf, bool) {
        let encoded = hex::encode(key);
        if encoded.len() <= MAX_ENCODED_KEY_LEN {
            return (self.base_path.join(format!("{}.json", encoded)), false);
        }
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        let name = format!("{}{}.json", HASHED_PREFIX, digest);
        (self.base_path.join(name), true)
    }

    fn path_to_key(file_name: &str) -> Option<String> {
        let encoded = file_name.strip_suffix(".json")?;
        let bytes = hex::decode(encoded).ok()?;
        String::from_utf8(bytes).ok()
    }

    fn read_hashed(path: &Path) -> Result<HashedEntry> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Storage(format!("Failed to read file: {}", e)))?;
        Ok(serde_json::from_str(&contents)?)
    }
}

impl StorageAdapter for FileStorageAdapter {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let (path, hashed) = self.key_to_path(key);
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Storage(format!("Failed to read file: {}", e))),
        };
        if !hashed {
            return Ok(Some(contents));
        }
        let entry: HashedEntry = serde_json::from_str(&contents)?;
        Ok((entry.key == key).then_some(entry.value))
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        let (path, hashed) = self.key_to_path(key);
        let tmp = path.with_extension("json.tmp");
        let value = if hashed {
            serde_json::to_string(&HashedEntry {
                key: key.to_string(),
                value,
            })?
        } else {
            value
        };

        fs::write(&tmp, value)
            .map_err(|e| Error::Storage(format!("Failed to write file: {}", e)))?;
        fs::rename(&tmp, &path)
            .map_err(|e| Error::Storage(format!("Failed to replace file: {}", e)))?;

        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_to_path(key).0) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to delete file: {}", e))),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        let entries = fs::read_dir(&self.base_path)
            .map_err(|e| Error::Storage(format!("Failed to read directory: {}", e)))?;

        for entry in entries {
            let entry =
                entry.map_err(|e| Error::Storage(format!("Failed to read dir entry: {}", e)))?;

            let file_name = entry.file_name().to_string_lossy().into_owned();
            let key = if file_name.starts_with(HASHED_PREFIX) && file_name.ends_with(".json") {
                match Self::read_hashed(&entry.path()) {
                    Ok(hashed) => hashed.key,
                    Err(_) => continue,
                }
            } else {
                let Some(key) = Self::path_to_key(&file_name) else {
                    continue;
                };
                key
            };

            if key.starts_with(prefix) {
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }
}
