use std::{
    collections::BTreeSet,
    fmt,
    io::{Read, Write},
    rc::Rc,
};

use tracing::{debug, trace};

use crate::{
    fs_error::FsError,
    mount::{fs_error_from_io, join, normalize, Mount},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub write: bool,
    pub binary: bool,
}

impl OpenMode {
    pub const READ: OpenMode = OpenMode {
        write: false,
        binary: false,
    };
    pub const READ_BINARY: OpenMode = OpenMode {
        write: false,
        binary: true,
    };
    pub const WRITE: OpenMode = OpenMode {
        write: true,
        binary: false,
    };
    pub const WRITE_BINARY: OpenMode = OpenMode {
        write: true,
        binary: true,
    };

    pub fn parse(mode: &str) -> Result<Self, FsError> {
        match mode {
            "r" => Ok(Self::READ),
            "rb" => Ok(Self::READ_BINARY),
            "w" => Ok(Self::WRITE),
            "wb" => Ok(Self::WRITE_BINARY),
            _ => Err(FsError::InvalidMode(mode.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match (self.write, self.binary) {
            (false, false) => "r",
            (false, true) => "rb",
            (true, false) => "w",
            (true, true) => "wb",
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum FileState {
    Reader(Box<dyn Read>),
    Writer(Box<dyn Write>),
    Closed,
}

/// An open file. Every operation checks the mode the file was opened with.
pub struct File {
    path: String,
    mode: OpenMode,
    state: FileState,
}

impl File {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, FileState::Closed)
    }

    fn check(&self, expected: OpenMode) -> Result<(), FsError> {
        if self.is_closed() {
            return Err(FsError::Closed);
        }
        if self.mode != expected {
            return Err(FsError::WrongMode {
                expected: expected.to_string(),
                actual: self.mode.to_string(),
            });
        }
        Ok(())
    }

    fn read_all(&mut self) -> Result<Vec<u8>, FsError> {
        let mut data = Vec::new();
        if let FileState::Reader(reader) = &mut self.state {
            reader.read_to_end(&mut data).map_err(fs_error_from_io)?;
        }
        Ok(data)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), FsError> {
        if let FileState::Writer(writer) = &mut self.state {
            writer.write_all(data).map_err(fs_error_from_io)?;
        }
        Ok(())
    }

    /// Reads the rest of a text file. Fails with [`FsError::NotText`] rather
    /// than replacing invalid UTF-8.
    pub fn read_to_string(&mut self) -> Result<String, FsError> {
        String::from_utf8(self.read_text()?).map_err(|_| FsError::NotText)
    }

    /// Reads the rest of a text file, bytes untouched.
    pub fn read_text(&mut self) -> Result<Vec<u8>, FsError> {
        self.check(OpenMode::READ)?;
        self.read_all()
    }

    pub fn read_to_end(&mut self) -> Result<Vec<u8>, FsError> {
        self.check(OpenMode::READ_BINARY)?;
        self.read_all()
    }

    pub fn write_str(&mut self, text: &str) -> Result<(), FsError> {
        self.write_text(text.as_bytes())
    }

    pub fn write_text(&mut self, data: &[u8]) -> Result<(), FsError> {
        self.check(OpenMode::WRITE)?;
        self.write_all(data)
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), FsError> {
        self.check(OpenMode::WRITE_BINARY)?;
        self.write_all(data)
    }

    pub fn close(&mut self) -> Result<(), FsError> {
        match std::mem::replace(&mut self.state, FileState::Closed) {
            FileState::Closed => Err(FsError::Closed),
            FileState::Writer(mut writer) => writer.flush().map_err(fs_error_from_io),
            FileState::Reader(_) => Ok(()),
        }
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct Binding {
    prefix: String,
    mount: Rc<dyn Mount>,
    physical: String,
    read_only: bool,
}

/// Composes mounted stores under virtual path prefixes.
#[derive(Default)]
pub struct FileSystem {
    bindings: Vec<Binding>,
}

impl FileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(
        &mut self,
        mount: Rc<dyn Mount>,
        virtual_prefix: &str,
        physical_prefix: &str,
        read_only: bool,
    ) -> Result<(), FsError> {
        let prefix = normalize(virtual_prefix)?;
        let physical = normalize(physical_prefix)?;
        let read_only = read_only || mount.read_only();
        debug!(
            "[FS] mount /{} -> /{} ({})",
            prefix,
            physical,
            if read_only { "ro" } else { "rw" }
        );
        self.bindings.push(Binding {
            prefix,
            mount,
            physical,
            read_only,
        });
        Ok(())
    }

    /// Removes every binding at `virtual_prefix`. Returns whether any existed.
    pub fn unmount(&mut self, virtual_prefix: &str) -> bool {
        let Ok(prefix) = normalize(virtual_prefix) else {
            return false;
        };
        let before = self.bindings.len();
        self.bindings.retain(|b| b.prefix != prefix);
        before != self.bindings.len()
    }

    pub fn unmount_all(&mut self) {
        debug!("[FS] unmount all ({} bindings)", self.bindings.len());
        self.bindings.clear();
    }

    pub fn mount_count(&self) -> usize {
        self.bindings.len()
    }

    fn covers(prefix: &str, path: &str) -> bool {
        prefix.is_empty()
            || path == prefix
            || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
    }

    /// Longest matching prefix wins; among equal prefixes the latest binding
    /// wins.
    fn resolve(&self, path: &str) -> Result<(&Binding, String), FsError> {
        let path = normalize(path)?;
        let binding = self
            .bindings
            .iter()
            .filter(|b| Self::covers(&b.prefix, &path))
            .max_by_key(|b| if b.prefix.is_empty() { 0 } else { b.prefix.len() + 1 })
            .ok_or_else(|| FsError::NoMount(path.clone()))?;
        let rest = if binding.prefix.is_empty() {
            path.as_str()
        } else {
            path[binding.prefix.len()..].trim_start_matches('/')
        };
        let physical = join(&binding.physical, rest);
        trace!("[FS] resolve /{} -> /{} on /{}", path, physical, binding.prefix);
        Ok((binding, physical))
    }

    fn is_mount_point(&self, path: &str) -> bool {
        self.bindings.iter().any(|b| {
            b.prefix == path
                || (path.is_empty() && !b.prefix.is_empty())
                || b.prefix.starts_with(&format!("{}/", path))
        })
    }

    pub fn exists(&self, path: &str) -> bool {
        let Ok(normalized) = normalize(path) else {
            return false;
        };
        if self.is_mount_point(&normalized) {
            return true;
        }
        match self.resolve(&normalized) {
            Ok((binding, physical)) => binding.mount.exists(&physical),
            Err(_) => false,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        let Ok(normalized) = normalize(path) else {
            return false;
        };
        if self.is_mount_point(&normalized) {
            return true;
        }
        match self.resolve(&normalized) {
            Ok((binding, physical)) => binding.mount.is_dir(&physical),
            Err(_) => false,
        }
    }

    pub fn list(&self, path: &str) -> Result<Vec<String>, FsError> {
        let normalized = normalize(path)?;
        let mut names = BTreeSet::new();
        let mut found = false;

        if let Ok((binding, physical)) = self.resolve(&normalized) {
            if binding.mount.is_dir(&physical) {
                names.extend(binding.mount.list(&physical)?);
                found = true;
            }
        }

        // Mount points directly below `path` show up as entries too.
        for b in &self.bindings {
            let child = if normalized.is_empty() {
                Some(b.prefix.as_str())
            } else {
                b.prefix
                    .strip_prefix(normalized.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
            };
            if let Some(child) = child.filter(|c| !c.is_empty()) {
                if let Some(first) = child.split('/').next() {
                    names.insert(first.to_string());
                    found = true;
                }
            }
        }

        if !found {
            return Err(FsError::NotFound(normalized));
        }
        Ok(names.into_iter().collect())
    }

    pub fn open(&self, path: &str, mode: OpenMode) -> Result<File, FsError> {
        if mode.write {
            self.open_for_write(path, mode.binary)
        } else {
            self.open_for_read(path, mode.binary)
        }
    }

    pub fn open_for_read(&self, path: &str, binary: bool) -> Result<File, FsError> {
        let (binding, physical) = self.resolve(path)?;
        let reader = binding.mount.open_read(&physical)?;
        Ok(File {
            path: normalize(path)?,
            mode: OpenMode {
                write: false,
                binary,
            },
            state: FileState::Reader(reader),
        })
    }

    pub fn open_for_write(&self, path: &str, binary: bool) -> Result<File, FsError> {
        let (binding, physical) = self.resolve(path)?;
        if binding.read_only {
            return Err(FsError::ReadOnly(normalize(path)?));
        }
        let writer = binding.mount.open_write(&physical)?;
        Ok(File {
            path: normalize(path)?,
            mode: OpenMode {
                write: true,
                binary,
            },
            state: FileState::Writer(writer),
        })
    }

    /// Convenience for host-side reads such as loading a boot chunk.
    pub fn read(&self, path: &str) -> Result<Vec<u8>, FsError> {
        self.open_for_read(path, true)?.read_to_end()
    }
}

impl fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.bindings.iter().map(|b| {
                format!(
                    "/{} -> /{}{}",
                    b.prefix,
                    b.physical,
                    if b.read_only { " (ro)" } else { "" }
                )
            }))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MemoryMount;

    fn rom() -> Rc<dyn Mount> {
        Rc::new(
            MemoryMount::new()
                .with_file("boot.lua", "rom boot")
                .with_file("lib/a.lua", "a"),
        )
    }

    #[test]
    fn test_longest_prefix_wins() {
        let disk = Rc::new(MemoryMount::new().with_file("a.lua", "disk a"));
        let mut fs = FileSystem::new();
        fs.mount(rom(), "/", "", true).unwrap();
        fs.mount(disk, "/lib", "", false).unwrap();

        let mut file = fs.open("/lib/a.lua", OpenMode::READ).unwrap();
        assert_eq!(file.read_to_string().unwrap(), "disk a");

        let mut file = fs.open("boot.lua", OpenMode::READ).unwrap();
        assert_eq!(file.read_to_string().unwrap(), "rom boot");
    }

    #[test]
    fn test_prefix_matches_whole_components() {
        let disk = Rc::new(MemoryMount::new().with_file("x", "1"));
        let mut fs = FileSystem::new();
        fs.mount(disk, "/disk", "", false).unwrap();

        assert!(fs.exists("/disk/x"));
        assert!(matches!(
            fs.open("/diskette/x", OpenMode::READ),
            Err(FsError::NoMount(_))
        ));
    }

    #[test]
    fn test_physical_prefix() {
        let mut fs = FileSystem::new();
        fs.mount(rom(), "/modules", "lib", true).unwrap();
        assert_eq!(fs.read("/modules/a.lua").unwrap(), b"a");
    }

    #[test]
    fn test_read_only_binding() {
        let mut fs = FileSystem::new();
        fs.mount(rom(), "/", "", true).unwrap();
        assert!(matches!(
            fs.open("new.txt", OpenMode::WRITE),
            Err(FsError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_invalid_text_is_not_replaced() {
        let store = Rc::new(MemoryMount::new().with_file("latin1.txt", vec![b'c', 0xE9]));
        let mut fs = FileSystem::new();
        fs.mount(store, "/", "", false).unwrap();

        let mut file = fs.open("latin1.txt", OpenMode::READ).unwrap();
        assert_eq!(file.read_to_string(), Err(FsError::NotText));
        let mut file = fs.open("latin1.txt", OpenMode::READ).unwrap();
        assert_eq!(file.read_text().unwrap(), vec![b'c', 0xE9]);
    }

    #[test]
    fn test_mode_mismatch() {
        let scratch = Rc::new(MemoryMount::new());
        let mut fs = FileSystem::new();
        fs.mount(scratch.clone(), "/", "", false).unwrap();

        let mut file = fs.open("out.bin", OpenMode::WRITE_BINARY).unwrap();
        assert!(matches!(
            file.write_str("text"),
            Err(FsError::WrongMode { .. })
        ));
        file.write_bytes(&[1, 2, 3]).unwrap();
        file.close().unwrap();
        assert_eq!(file.write_bytes(&[4]), Err(FsError::Closed));
        assert_eq!(scratch.contents("out.bin").unwrap(), vec![1, 2, 3]);

        let mut file = fs.open("out.bin", OpenMode::READ).unwrap();
        assert!(matches!(file.read_to_end(), Err(FsError::WrongMode { .. })));
    }

    #[test]
    fn test_list_includes_mount_points() {
        let mut fs = FileSystem::new();
        fs.mount(rom(), "/", "", true).unwrap();
        fs.mount(Rc::new(MemoryMount::new()), "/disk", "", false)
            .unwrap();

        assert_eq!(fs.list("/").unwrap(), vec!["boot.lua", "disk", "lib"]);
        assert!(fs.is_dir("/disk"));
    }

    #[test]
    fn test_unmount_all() {
        let mut fs = FileSystem::new();
        fs.mount(rom(), "/", "", true).unwrap();
        assert!(fs.exists("boot.lua"));

        fs.unmount_all();
        assert_eq!(fs.mount_count(), 0);
        assert!(!fs.exists("boot.lua"));
    }

    #[test]
    fn test_open_mode_strings() {
        assert_eq!(OpenMode::parse("rb").unwrap(), OpenMode::READ_BINARY);
        assert_eq!(OpenMode::WRITE.as_str(), "w");
        assert!(OpenMode::parse("a+").is_err());
    }
}
