use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use parking_lot::RwLock;

use crate::{Storage, VmError, VmResult};

/// Extension compiled modules are stored with.
pub const MODULE_EXTENSION: &str = "brm";

/// Loads modules from a directory on the host file system.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `path` under the root, with the module extension added when it has none.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let mut full = self.root.join(path);
        if full.extension().is_none() {
            full.set_extension(MODULE_EXTENSION);
        }
        full
    }
}

impl Storage for FileStorage {
    fn load(&self, path: &str) -> VmResult<Vec<u8>> {
        let full = self.resolve(path);
        log::debug!("loading module '{}'", full.display());
        fs::read(&full).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => VmError::ScriptNotFound(full.display().to_string()),
            _ => VmError::Io(err),
        })
    }
}

/// Modules kept in memory, keyed by name. Useful for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    modules: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, bytes: Vec<u8>) {
        self.modules.write().insert(name.into(), bytes);
    }

    pub fn with_module(self, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.insert(name, bytes);
        self
    }
}

impl Storage for InMemoryStorage {
    fn load(&self, path: &str) -> VmResult<Vec<u8>> {
        self.modules
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| VmError::ScriptNotFound(path.to_owned()))
    }

    fn dispose(&self) {
        self.modules.write().clear();
    }
}
