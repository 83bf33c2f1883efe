//! In-memory registry implementation.
//!
//! Backs the server binary (seeded from the settings file) and the test
//! suite. The real registry service is an external collaborator; anything
//! honoring the [`Registry`](super::Registry) contract can replace this.

use crate::error::RegistryError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
struct Directory {
    keys: BTreeMap<String, String>,
}

struct Inner {
    cursor: Vec<String>,
    directories: BTreeMap<Vec<String>, Directory>,
}

/// Hierarchical key/value store with a mutable cursor.
///
/// Paths are absolute and begin with an empty root segment, e.g.
/// `["", "Ports"]`. The root directory always exists.
pub struct MemoryRegistry {
    inner: Mutex<Inner>,
}

impl MemoryRegistry {
    /// Create a registry containing only the root directory.
    pub fn new() -> Self {
        let mut directories = BTreeMap::new();
        directories.insert(vec![String::new()], Directory::default());
        Self {
            inner: Mutex::new(Inner {
                cursor: vec![String::new()],
                directories,
            }),
        }
    }

    /// Create a directory (and any missing ancestors).
    pub fn add_dir(&self, path: &[&str]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        for depth in 1..=path.len() {
            inner
                .directories
                .entry(path[..depth].to_vec())
                .or_default();
        }
    }

    /// Store a key under a directory, creating the directory if needed.
    pub fn set(&self, path: &[&str], key: &str, value: &str) {
        self.add_dir(path);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        if let Some(dir) = inner.directories.get_mut(&path) {
            dir.keys.insert(key.to_string(), value.to_string());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl super::Registry for MemoryRegistry {
    async fn cd(&self, path: Option<&[String]>) -> Result<Vec<String>, RegistryError> {
        let mut inner = self.lock();
        let previous = inner.cursor.clone();
        if let Some(path) = path {
            let target = path.to_vec();
            if !inner.directories.contains_key(&target) {
                return Err(RegistryError::NoSuchDirectory(target.join("/")));
            }
            inner.cursor = target;
        }
        Ok(previous)
    }

    async fn dir(&self) -> Result<(Vec<String>, Vec<String>), RegistryError> {
        let inner = self.lock();
        let cursor = inner.cursor.clone();
        let dir = inner
            .directories
            .get(&cursor)
            .ok_or_else(|| RegistryError::NoSuchDirectory(cursor.join("/")))?;

        let subdirs = inner
            .directories
            .keys()
            .filter(|path| path.len() == cursor.len() + 1 && path.starts_with(&cursor))
            .filter_map(|path| path.last().cloned())
            .collect();
        let keys = dir.keys.keys().cloned().collect();
        Ok((subdirs, keys))
    }

    async fn get(&self, key: &str) -> Result<String, RegistryError> {
        let inner = self.lock();
        let dir = inner
            .directories
            .get(&inner.cursor)
            .ok_or_else(|| RegistryError::NoSuchDirectory(inner.cursor.join("/")))?;
        dir.keys
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::NoSuchKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    #[tokio::test]
    async fn test_cd_returns_previous_path() {
        let registry = MemoryRegistry::new();
        registry.add_dir(&["", "Ports"]);

        let previous = registry
            .cd(Some(&[String::new(), "Ports".to_string()]))
            .await
            .unwrap();
        assert_eq!(previous, vec![String::new()]);

        let current = registry.cd(None).await.unwrap();
        assert_eq!(current, vec![String::new(), "Ports".to_string()]);
    }

    #[tokio::test]
    async fn test_cd_missing_directory() {
        let registry = MemoryRegistry::new();
        let err = registry
            .cd(Some(&[String::new(), "Nope".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NoSuchDirectory(_)));
    }

    #[tokio::test]
    async fn test_dir_lists_subdirs_and_keys() {
        let registry = MemoryRegistry::new();
        registry.add_dir(&["", "Ports"]);
        registry.add_dir(&["", "Clients"]);
        registry.set(&["", "Ports"], "HV500_HV264", "COM3");

        let (subdirs, keys) = registry.dir().await.unwrap();
        assert!(subdirs.contains(&"Ports".to_string()));
        assert!(subdirs.contains(&"Clients".to_string()));
        assert!(keys.is_empty());

        registry
            .cd(Some(&[String::new(), "Ports".to_string()]))
            .await
            .unwrap();
        let (subdirs, keys) = registry.dir().await.unwrap();
        assert!(subdirs.is_empty());
        assert_eq!(keys, vec!["HV500_HV264".to_string()]);
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let registry = MemoryRegistry::new();
        let err = registry.get("HV500_HV264").await.unwrap_err();
        assert_eq!(err, RegistryError::NoSuchKey("HV500_HV264".to_string()));
    }
}
