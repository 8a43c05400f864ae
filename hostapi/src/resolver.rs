//! Source resolvers.
//!
//! - `MemResolver` — in-memory `BTreeMap` of specifier → source, for tests
//!   and embedders that ship modules inline.
//! - `FsResolver` — reads modules from a directory, refusing specifiers
//!   that would escape it.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::error::HostError;
use crate::traits::SourceResolver;

/// In-memory resolver backed by `BTreeMap`.
#[derive(Debug, Clone, Default)]
pub struct MemResolver {
    sources: BTreeMap<String, Vec<u8>>,
}

impl MemResolver {
    pub fn new() -> Self {
        Self {
            sources: BTreeMap::new(),
        }
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with_module(mut self, specifier: &str, source: impl Into<Vec<u8>>) -> Self {
        self.insert(specifier, source);
        self
    }

    pub fn insert(&mut self, specifier: &str, source: impl Into<Vec<u8>>) {
        self.sources.insert(specifier.to_string(), source.into());
    }

    pub fn remove(&mut self, specifier: &str) {
        self.sources.remove(specifier);
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl SourceResolver for MemResolver {
    fn resolve(&self, specifier: &str) -> Result<Option<Vec<u8>>, HostError> {
        Ok(self.sources.get(specifier).cloned())
    }
}

/// Filesystem resolver rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsResolver {
    root: PathBuf,
}

impl FsResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a specifier to a path under the root. Absolute paths and
    /// parent-directory components are rejected.
    fn path_for(&self, specifier: &str) -> Option<PathBuf> {
        let relative = Path::new(specifier);
        let mut path = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(path)
    }
}

impl SourceResolver for FsResolver {
    fn resolve(&self, specifier: &str) -> Result<Option<Vec<u8>>, HostError> {
        let path = match self.path_for(specifier) {
            Some(p) => p,
            None => return Ok(None),
        };
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
