//! A blob cache variant whose entries expire. The expiry travels in the
//! file name (`<id>.<expiresAtUnix>`), so reads can sweep stale entries
//! without opening them.

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::cache::{Cache, CacheError, CacheKind};

pub struct ExpiringCache<T> {
    dir: PathBuf,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> ExpiringCache<T> {
    pub fn new(base: &Path) -> Result<Self, CacheError> {
        let cache: Cache<T> = Cache::new(base, CacheKind::Temporary)?;
        Ok(Self {
            dir: cache.dir().to_path_buf(),
            _marker: PhantomData,
        })
    }

    fn entries_for(&self, id: &str) -> Result<Vec<PathBuf>, CacheError> {
        if id.is_empty() {
            return Err(CacheError::InvalidId);
        }
        let prefix = format!("{id}.");
        let entries = fs::read_dir(&self.dir)
            .map_err(|source| CacheError::Io {
                context: "scan expiring cache",
                source,
            })?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(&prefix))
            })
            .collect();
        Ok(entries)
    }

    /// Reads the entry stored under `id`. Expired entries are removed and
    /// reported as not found.
    pub fn read(&self, id: &str) -> Result<T, CacheError> {
        let matches = self.entries_for(id)?;
        let Some(path) = matches.first() else {
            return Err(CacheError::NotFound);
        };

        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let mut parts = name.splitn(2, '.');
        let _id = parts.next();
        let expires_at: i64 = parts
            .next()
            .and_then(|stamp| stamp.parse().ok())
            .ok_or(CacheError::NotFound)?;

        if expires_at < unix_now() {
            let _ = fs::remove_file(path);
            return Err(CacheError::NotFound);
        }

        let bytes = fs::read(path).map_err(|source| CacheError::Io {
            context: "read expiring cache",
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| CacheError::Codec {
            context: "read expiring cache",
            source,
        })
    }

    /// Writes `value` under `id` with the given expiry, first purging any
    /// existing entry for the id so at most one remains.
    pub fn write(&self, id: &str, expires_at: i64, value: &T) -> Result<(), CacheError> {
        for stale in self.entries_for(id)? {
            fs::remove_file(stale).map_err(|source| CacheError::Io {
                context: "purge expiring cache",
                source,
            })?;
        }

        let bytes = serde_json::to_vec(value).map_err(|source| CacheError::Codec {
            context: "write expiring cache",
            source,
        })?;
        fs::write(self.dir.join(format!("{id}.{expires_at}")), bytes).map_err(|source| {
            CacheError::Io {
                context: "write expiring cache",
                source,
            }
        })
    }

    pub fn delete(&self, id: &str) -> Result<(), CacheError> {
        for path in self.entries_for(id)? {
            fs::remove_file(path).map_err(|source| CacheError::Io {
                context: "delete expiring cache",
                source,
            })?;
        }
        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache() -> (tempfile::TempDir, ExpiringCache<String>) {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = ExpiringCache::new(dir.path()).unwrap();
        (dir, cache)
    }

    #[test]
    fn write_then_read() {
        let (_dir, cache) = temp_cache();
        let data = "test data".to_string();
        cache.write("test", unix_now() + 3600, &data).unwrap();
        assert_eq!(cache.read("test").unwrap(), data);
    }

    #[test]
    fn expired_entries_are_swept() {
        let (dir, cache) = temp_cache();
        cache
            .write("test", unix_now() - 3600, &"stale".to_string())
            .unwrap();
        assert!(matches!(cache.read("test"), Err(CacheError::NotFound)));
        // The sweep removed the file, not just hid it.
        assert_eq!(std::fs::read_dir(dir.path().join("temp")).unwrap().count(), 0);
    }

    #[test]
    fn rewrites_leave_a_single_entry() {
        let (dir, cache) = temp_cache();
        cache
            .write("test", unix_now() + 3600, &"first".to_string())
            .unwrap();
        cache
            .write("test", unix_now() + 7200, &"second".to_string())
            .unwrap();
        assert_eq!(cache.read("test").unwrap(), "second");
        assert_eq!(std::fs::read_dir(dir.path().join("temp")).unwrap().count(), 1);
    }

    #[test]
    fn blank_ids_are_rejected() {
        let (_dir, cache) = temp_cache();
        assert!(matches!(
            cache.write("", 0, &String::new()),
            Err(CacheError::InvalidId)
        ));
        assert!(matches!(cache.read(""), Err(CacheError::InvalidId)));
    }

    #[test]
    fn missing_entries_read_as_not_found() {
        let (_dir, cache) = temp_cache();
        assert!(matches!(cache.read("absent"), Err(CacheError::NotFound)));
    }
}
