//! Host functions a CPU installs into every guest it boots.
//!
//! `io`, `os` and `package` become globals. `buffer` is only reachable
//! through the preload table, alongside one API per attached peripheral.

use std::{cell::RefCell, rc::Rc};

use tracing::{debug, trace};

use crate::{
    computer::Bus,
    filesystem::{File, FileSystem, OpenMode},
    fs_error::FsError,
    guest::{arg, arg_bytes, arg_i64, arg_str, arg_usize, ApiResult, GuestApi, GuestError},
    resource::{Handle, ResourceArena},
    value::Value,
};

/// A request a guest makes of its CPU. Recorded during a resume and carried
/// out by the CPU once the guest has suspended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Halt,
    Shutdown,
    Reboot,
    /// Boot from the mount of the named device.
    Boot(String),
    Status,
}

pub type DirectiveSlot = Rc<RefCell<Option<Directive>>>;

pub(crate) fn arg_handle(
    function: &str,
    args: &[Value],
    index: usize,
) -> Result<Handle, GuestError> {
    let raw = arg_i64(function, args, index)?;
    u64::try_from(raw)
        .ok()
        .and_then(Handle::from_raw)
        .ok_or_else(|| GuestError::BadArgument {
            function: function.to_string(),
            index: index + 1,
            message: "invalid handle".to_string(),
        })
}

pub(crate) fn handle_value(handle: Handle) -> Value {
    Value::Integer(handle.to_raw() as i64)
}

pub struct OsApi {
    directive: DirectiveSlot,
    bus: Bus,
}

impl OsApi {
    const FUNCTIONS: &'static [&'static str] = &[
        "shutdown",
        "reboot",
        "halt",
        "boot",
        "getStatus",
        "clock",
        "memory",
        "devices",
    ];

    pub fn new(directive: DirectiveSlot, bus: Bus) -> Self {
        Self { directive, bus }
    }

    fn request(&self, directive: Directive) -> Result<ApiResult, GuestError> {
        debug!("[CPU] guest requested {:?}", directive);
        *self.directive.borrow_mut() = Some(directive);
        Ok(ApiResult::Yield(Vec::new()))
    }
}

impl GuestApi for OsApi {
    fn name(&self) -> &str {
        "os"
    }

    fn functions(&self) -> &[&'static str] {
        Self::FUNCTIONS
    }

    fn call(&self, function: &str, args: &[Value]) -> Result<ApiResult, GuestError> {
        match function {
            "shutdown" => self.request(Directive::Shutdown),
            "reboot" => self.request(Directive::Reboot),
            "halt" => self.request(Directive::Halt),
            "boot" => {
                let device = arg_str(function, args, 0)?;
                if self.bus.device_type(device).is_none() {
                    return Err(GuestError::Runtime(format!("no such device '{}'", device)));
                }
                self.request(Directive::Boot(device.to_string()))
            }
            "getStatus" => self.request(Directive::Status),
            "clock" => Ok(ApiResult::one(self.bus.uptime().as_secs_f64())),
            "memory" => {
                let memory = self.bus.memory();
                Ok(ApiResult::Return(vec![
                    Value::from(memory.used()),
                    Value::from(memory.budget()),
                ]))
            }
            "devices" => {
                let table = self
                    .bus
                    .device_names()
                    .into_iter()
                    .filter_map(|name| {
                        let kind = self.bus.device_type(&name)?;
                        Some((name, Value::String(kind)))
                    })
                    .collect();
                Ok(ApiResult::one(Value::Table(table)))
            }
            _ => Err(GuestError::UnknownFunction(function.to_string())),
        }
    }
}

/// File access over the CPU's filesystem. Files are named by integer handles.
pub struct IoApi {
    fs: Rc<RefCell<FileSystem>>,
    files: RefCell<Vec<Option<File>>>,
}

impl IoApi {
    const FUNCTIONS: &'static [&'static str] =
        &["open", "read", "write", "close", "exists", "isDir", "list"];

    pub fn new(fs: Rc<RefCell<FileSystem>>) -> Self {
        Self {
            fs,
            files: RefCell::new(Vec::new()),
        }
    }

    pub fn open_files(&self) -> usize {
        self.files.borrow().iter().flatten().count()
    }

    fn with_file<T>(
        &self,
        function: &str,
        args: &[Value],
        f: impl FnOnce(&mut File) -> Result<T, FsError>,
    ) -> Result<T, GuestError> {
        let index = arg_usize(function, args, 0)?;
        let mut files = self.files.borrow_mut();
        let file = files
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(FsError::Closed)?;
        Ok(f(file)?)
    }

    fn open(&self, args: &[Value]) -> Result<ApiResult, GuestError> {
        let path = arg_str("open", args, 0)?;
        let mode = match arg(args, 1) {
            Some(_) => OpenMode::parse(arg_str("open", args, 1)?)?,
            None => OpenMode::READ,
        };
        let file = self.fs.borrow().open(path, mode)?;
        trace!("[CPU] io.open {} {}", path, mode);

        let mut files = self.files.borrow_mut();
        let index = match files.iter().position(Option::is_none) {
            Some(index) => {
                files[index] = Some(file);
                index
            }
            None => {
                files.push(Some(file));
                files.len() - 1
            }
        };
        Ok(ApiResult::one(index))
    }
}

impl GuestApi for IoApi {
    fn name(&self) -> &str {
        "io"
    }

    fn functions(&self) -> &[&'static str] {
        Self::FUNCTIONS
    }

    fn call(&self, function: &str, args: &[Value]) -> Result<ApiResult, GuestError> {
        match function {
            "open" => self.open(args),
            "read" => {
                let value = self.with_file(function, args, |file| {
                    if file.mode().binary {
                        file.read_to_end().map(Value::Bytes)
                    } else {
                        // Guest strings are byte strings; invalid UTF-8
                        // comes back as bytes instead of being replaced.
                        file.read_text().map(|data| match String::from_utf8(data) {
                            Ok(text) => Value::String(text),
                            Err(e) => Value::Bytes(e.into_bytes()),
                        })
                    }
                })?;
                Ok(ApiResult::one(value))
            }
            "write" => {
                let data = arg_bytes(function, args, 1)?;
                self.with_file(function, args, |file| {
                    if file.mode().binary {
                        file.write_bytes(data)
                    } else {
                        file.write_text(data)
                    }
                })?;
                Ok(ApiResult::none())
            }
            "close" => {
                self.with_file(function, args, File::close)?;
                let index = arg_usize(function, args, 0)?;
                self.files.borrow_mut()[index] = None;
                Ok(ApiResult::none())
            }
            "exists" => {
                let path = arg_str(function, args, 0)?;
                Ok(ApiResult::one(self.fs.borrow().exists(path)))
            }
            "isDir" => {
                let path = arg_str(function, args, 0)?;
                Ok(ApiResult::one(self.fs.borrow().is_dir(path)))
            }
            "list" => {
                let path = arg_str(function, args, 0)?;
                let names = self.fs.borrow().list(path)?;
                Ok(ApiResult::Return(
                    names.into_iter().map(Value::String).collect(),
                ))
            }
            _ => Err(GuestError::UnknownFunction(function.to_string())),
        }
    }
}

pub struct PackageApi {
    preloaded: Vec<String>,
}

impl PackageApi {
    pub fn new(preloaded: Vec<String>) -> Self {
        Self { preloaded }
    }
}

impl GuestApi for PackageApi {
    fn name(&self) -> &str {
        "package"
    }

    fn functions(&self) -> &[&'static str] {
        &["list", "has"]
    }

    fn call(&self, function: &str, args: &[Value]) -> Result<ApiResult, GuestError> {
        match function {
            "list" => Ok(ApiResult::Return(
                self.preloaded.iter().map(|n| Value::from(n.as_str())).collect(),
            )),
            "has" => {
                let name = arg_str(function, args, 0)?;
                Ok(ApiResult::one(self.preloaded.iter().any(|n| n == name)))
            }
            _ => Err(GuestError::UnknownFunction(function.to_string())),
        }
    }
}

/// Tracked byte buffers. Handles stay valid until released; views created
/// with `sub` share their owner's bytes.
pub struct BufferApi {
    arena: Rc<RefCell<ResourceArena>>,
}

impl BufferApi {
    const FUNCTIONS: &'static [&'static str] = &[
        "create", "sub", "len", "read", "write", "fill", "copy", "retain", "release", "dump",
    ];

    pub fn new(arena: Rc<RefCell<ResourceArena>>) -> Self {
        Self { arena }
    }
}

impl GuestApi for BufferApi {
    fn name(&self) -> &str {
        "buffer"
    }

    fn functions(&self) -> &[&'static str] {
        Self::FUNCTIONS
    }

    fn call(&self, function: &str, args: &[Value]) -> Result<ApiResult, GuestError> {
        let mut arena = self.arena.borrow_mut();
        match function {
            "create" => {
                let len = arg_usize(function, args, 0)?;
                Ok(ApiResult::one(handle_value(arena.create_buffer(len)?)))
            }
            "sub" => {
                let handle = arg_handle(function, args, 0)?;
                let start = arg_usize(function, args, 1)?;
                let len = arg_usize(function, args, 2)?;
                Ok(ApiResult::one(handle_value(arena.sub(handle, start, len)?)))
            }
            "len" => {
                let handle = arg_handle(function, args, 0)?;
                Ok(ApiResult::one(arena.len(handle)?))
            }
            "read" => {
                let handle = arg_handle(function, args, 0)?;
                let start = match arg(args, 1) {
                    Some(_) => arg_usize(function, args, 1)?,
                    None => 0,
                };
                let len = match arg(args, 2) {
                    Some(_) => arg_usize(function, args, 2)?,
                    None => arena.len(handle)?.saturating_sub(start),
                };
                Ok(ApiResult::one(arena.read(handle, start, len)?))
            }
            "write" => {
                let handle = arg_handle(function, args, 0)?;
                let start = arg_usize(function, args, 1)?;
                let data = arg_bytes(function, args, 2)?;
                arena.write(handle, start, data)?;
                Ok(ApiResult::none())
            }
            "fill" => {
                let handle = arg_handle(function, args, 0)?;
                let value = arg_usize(function, args, 1)?;
                let value = u8::try_from(value).map_err(|_| GuestError::BadArgument {
                    function: function.to_string(),
                    index: 2,
                    message: "byte value expected".to_string(),
                })?;
                let start = match arg(args, 2) {
                    Some(_) => arg_usize(function, args, 2)?,
                    None => 0,
                };
                let len = match arg(args, 3) {
                    Some(_) => arg_usize(function, args, 3)?,
                    None => arena.len(handle)?.saturating_sub(start),
                };
                arena.fill(handle, start, len, value)?;
                Ok(ApiResult::none())
            }
            "copy" => {
                let handle = arg_handle(function, args, 0)?;
                Ok(ApiResult::one(handle_value(arena.copy(handle)?)))
            }
            "retain" => {
                arena.retain(arg_handle(function, args, 0)?)?;
                Ok(ApiResult::none())
            }
            "release" => {
                arena.release(arg_handle(function, args, 0)?)?;
                Ok(ApiResult::none())
            }
            "dump" => {
                let handle = arg_handle(function, args, 0)?;
                Ok(ApiResult::one(arena.dump(handle)?))
            }
            _ => Err(GuestError::UnknownFunction(function.to_string())),
        }
    }
}
