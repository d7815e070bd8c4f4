use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    fs,
    io::{self, Read, Write},
    path::PathBuf,
    rc::Rc,
};

use anyhow::Context;

use crate::fs_error::FsError;

/// A backing key-path store. Paths handed to a mount are already normalized
/// and relative to the mount's root; `""` is the root itself.
pub trait Mount {
    fn exists(&self, path: &str) -> bool;
    fn is_dir(&self, path: &str) -> bool;
    fn list(&self, path: &str) -> Result<Vec<String>, FsError>;
    fn open_read(&self, path: &str) -> Result<Box<dyn Read>, FsError>;
    fn open_write(&self, path: &str) -> Result<Box<dyn Write>, FsError>;
    /// Total size in bytes, if the store is bounded.
    fn capacity(&self) -> Option<u64>;
    fn read_only(&self) -> bool {
        false
    }
}

/// Normalizes a `/`-separated path: drops empty and `.` components and
/// resolves `..`. Climbing above the root is an error.
pub fn normalize(path: &str) -> Result<String, FsError> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(FsError::InvalidPath(path.to_string()));
                }
            }
            _ => parts.push(part),
        }
    }
    Ok(parts.join("/"))
}

/// Joins two normalized paths.
pub fn join(base: &str, rest: &str) -> String {
    match (base.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{}/{}", base, rest),
    }
}

fn disk_full() -> io::Error {
    io::Error::new(io::ErrorKind::Other, FsError::DiskFull)
}

pub(crate) fn fs_error_from_io(e: io::Error) -> FsError {
    if let Some(inner) = e.get_ref().and_then(|inner| inner.downcast_ref::<FsError>()) {
        return inner.clone();
    }
    FsError::from(e)
}

#[derive(Debug, Default)]
struct MemoryStore {
    files: BTreeMap<String, Vec<u8>>,
    capacity: Option<u64>,
    read_only: bool,
}

impl MemoryStore {
    fn used(&self) -> u64 {
        self.files.values().map(|f| f.len() as u64).sum()
    }

    fn is_dir(&self, path: &str) -> bool {
        if path.is_empty() {
            return true;
        }
        let prefix = format!("{}/", path);
        self.files.keys().any(|k| k.starts_with(&prefix))
    }
}

/// In-memory store used for ROM images and scratch disks. Clones share the
/// same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryMount {
    store: Rc<RefCell<MemoryStore>>,
}

impl MemoryMount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: u64) -> Self {
        let mount = Self::new();
        mount.store.borrow_mut().capacity = Some(capacity);
        mount
    }

    pub fn with_file(self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn into_read_only(self) -> Self {
        self.store.borrow_mut().read_only = true;
        self
    }

    /// Host-side write that bypasses capacity and read-only checks.
    pub fn insert(&self, path: &str, contents: impl Into<Vec<u8>>) {
        let path = normalize(path).unwrap_or_else(|_| path.to_string());
        self.store.borrow_mut().files.insert(path, contents.into());
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let path = normalize(path).ok()?;
        self.store.borrow().files.get(&path).cloned()
    }

    pub fn used(&self) -> u64 {
        self.store.borrow().used()
    }
}

impl Mount for MemoryMount {
    fn exists(&self, path: &str) -> bool {
        let store = self.store.borrow();
        store.files.contains_key(path) || store.is_dir(path)
    }

    fn is_dir(&self, path: &str) -> bool {
        self.store.borrow().is_dir(path)
    }

    fn list(&self, path: &str) -> Result<Vec<String>, FsError> {
        let store = self.store.borrow();
        if !store.is_dir(path) {
            return Err(FsError::NotFound(path.to_string()));
        }
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        let names: BTreeSet<String> = store
            .files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect();
        Ok(names.into_iter().collect())
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Read>, FsError> {
        let store = self.store.borrow();
        match store.files.get(path) {
            Some(data) => Ok(Box::new(io::Cursor::new(data.clone()))),
            None if store.is_dir(path) => Err(FsError::NotAFile(path.to_string())),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn Write>, FsError> {
        let mut store = self.store.borrow_mut();
        if store.read_only {
            return Err(FsError::ReadOnly(path.to_string()));
        }
        if path.is_empty() || store.is_dir(path) {
            return Err(FsError::NotAFile(path.to_string()));
        }
        store.files.insert(path.to_string(), Vec::new());
        Ok(Box::new(MemoryWriter {
            store: self.store.clone(),
            path: path.to_string(),
        }))
    }

    fn capacity(&self) -> Option<u64> {
        self.store.borrow().capacity
    }

    fn read_only(&self) -> bool {
        self.store.borrow().read_only
    }
}

/// Writes straight through to the owning store.
struct MemoryWriter {
    store: Rc<RefCell<MemoryStore>>,
    path: String,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut store = self.store.borrow_mut();
        if let Some(capacity) = store.capacity {
            if store.used() + buf.len() as u64 > capacity {
                return Err(disk_full());
            }
        }
        store
            .files
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Store backed by a directory on the host, confined to its root.
#[derive(Debug, Clone)]
pub struct DirMount {
    root: PathBuf,
    capacity: Option<u64>,
    read_only: bool,
}

impl DirMount {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating mount root {}", root.display()))?;
        Ok(Self {
            root,
            capacity: None,
            read_only: false,
        })
    }

    pub fn capacity_limit(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn into_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    fn host_path(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            full.push(part);
        }
        full
    }
}

impl Mount for DirMount {
    fn exists(&self, path: &str) -> bool {
        self.host_path(path).exists()
    }

    fn is_dir(&self, path: &str) -> bool {
        self.host_path(path).is_dir()
    }

    fn list(&self, path: &str) -> Result<Vec<String>, FsError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.host_path(path))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Read>, FsError> {
        let host = self.host_path(path);
        if host.is_dir() {
            return Err(FsError::NotAFile(path.to_string()));
        }
        let file = fs::File::open(host).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
            _ => FsError::from(e),
        })?;
        Ok(Box::new(file))
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn Write>, FsError> {
        if self.read_only {
            return Err(FsError::ReadOnly(path.to_string()));
        }
        let host = self.host_path(path);
        if path.is_empty() || host.is_dir() {
            return Err(FsError::NotAFile(path.to_string()));
        }
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Box::new(fs::File::create(host)?))
    }

    fn capacity(&self) -> Option<u64> {
        self.capacity
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

/// A removable medium: a labelled mount plus whether it is plugged in.
#[derive(Clone)]
pub struct Disk {
    pub label: String,
    pub mount: Rc<dyn Mount>,
    pub connected: bool,
}

impl Disk {
    pub fn new(label: impl Into<String>, mount: Rc<dyn Mount>) -> Self {
        Self {
            label: label.into(),
            mount,
            connected: false,
        }
    }
}

impl std::fmt::Debug for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk")
            .field("label", &self.label)
            .field("connected", &self.connected)
            .finish()
    }
}
