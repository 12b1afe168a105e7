// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Serialized-object storage backend.
//!
//! The coordinator names scene objects by key; the worker fetches them from
//! a shared backend addressed by URI. Only the `file://` scheme ships here;
//! remote backends plug in behind [`StorageBackend`].

use std::fs;
use std::io;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Object fetch/upload interface consumed by the worker runtime.
pub trait StorageBackend: std::fmt::Debug {
    /// Fetch a serialized object by key.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Upload an object (used for log upload on shutdown).
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;
}

/// Create a backend from its URI.
pub fn create_backend(uri: &str) -> Result<Box<dyn StorageBackend>> {
    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(Box::new(FileBackend {
            root: PathBuf::from(path),
        }));
    }
    Err(Error::Config(format!("unsupported storage URI: {}", uri)))
}

/// Directory-backed storage for local runs and tests.
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.root.join(key);
        log::debug!("[STORAGE] get key={} path={}", key, path.display());
        fs::read(&path).map_err(Error::Storage)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(Error::Storage)?;
        }
        log::debug!(
            "[STORAGE] put key={} bytes={} path={}",
            key,
            data.len(),
            path.display()
        );
        fs::write(&path, data).map_err(Error::Storage)
    }
}

/// Backend that holds nothing; every `get` misses. Useful in tests and in
/// benchmark-only deployments.
#[derive(Debug, Default)]
pub struct NullBackend;

impl StorageBackend for NullBackend {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        Err(Error::Storage(io::Error::new(
            io::ErrorKind::NotFound,
            format!("null backend has no object {}", key),
        )))
    }

    fn put(&self, _key: &str, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}
