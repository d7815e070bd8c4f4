// Filesystem error types

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    NotFound(String),
    NotAFile(String),
    NoMount(String),
    ReadOnly(String),
    InvalidPath(String),
    InvalidMode(String),
    WrongMode { expected: String, actual: String },
    Closed,
    DiskFull,
    Disconnected,
    NotText,
    Io(String),
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NotFound(path) => write!(f, "{}: No such file", path),
            FsError::NotAFile(path) => write!(f, "{}: Is a directory", path),
            FsError::NoMount(path) => write!(f, "{}: No filesystem mounted", path),
            FsError::ReadOnly(path) => write!(f, "{}: Access denied", path),
            FsError::InvalidPath(path) => write!(f, "{}: Invalid path", path),
            FsError::InvalidMode(mode) => write!(f, "Unsupported mode: {}", mode),
            FsError::WrongMode { expected, actual } => write!(
                f,
                "File opened in mode \"{}\", operation requires \"{}\"",
                actual, expected
            ),
            FsError::Closed => write!(f, "attempt to use a closed file"),
            FsError::DiskFull => write!(f, "Out of space"),
            FsError::Disconnected => write!(f, "Disk is not connected"),
            FsError::NotText => write!(f, "File is not valid UTF-8 text"),
            FsError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for FsError {}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => FsError::ReadOnly(e.to_string()),
            _ => FsError::Io(e.to_string()),
        }
    }
}
