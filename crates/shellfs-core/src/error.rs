//! Error types for the VFS layer.
//!
//! The taxonomy distinguishes protocol failures (handshake), remote
//! command failures, connection loss, path resolution errors and local
//! I/O. Each variant maps onto a POSIX-style class via
//! [`VfsError::errno_name`] so the host application can surface the
//! familiar code next to the message.

use std::{fmt, io};

use thiserror::Error;

/// Context for a failed operation, carried inside error variants so the
/// user-visible message can name what was being touched.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    /// The operation being performed (e.g. `"store"`, `"dir_load"`).
    pub op: Option<&'static str>,
    /// The path involved, as the caller spelled it.
    pub path: Option<String>,
    /// The connection or archive the operation ran against.
    pub mount: Option<String>,
}

impl OpContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_op(mut self, op: &'static str) -> Self {
        self.op = Some(op);
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_mount(mut self, mount: impl Into<String>) -> Self {
        self.mount = Some(mount.into());
        self
    }
}

impl fmt::Display for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(op) = self.op {
            parts.push(op.to_string());
        }
        if let Some(ref path) = self.path {
            parts.push(format!("'{path}'"));
        }
        if let Some(ref mount) = self.mount {
            parts.push(format!("on {mount}"));
        }
        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

/// Errors produced by the VFS layer.
#[derive(Error, Debug)]
pub enum VfsError {
    /// A handshake step with the remote shell failed; the connection was
    /// never usable and is not registered.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote side completed a command but reported non-success.
    /// The connection stays usable for subsequent commands.
    #[error("remote command failed: {0}")]
    Remote(OpContext),

    /// The pipe closed or a read came up short in the middle of an
    /// exchange. Fatal to the connection.
    #[error("connection reset: {0}")]
    ConnectionReset(OpContext),

    #[error("no such file or directory: '{0}'")]
    NotFound(String),

    #[error("not a directory: '{0}'")]
    NotDirectory(String),

    #[error("is a directory: '{0}'")]
    IsDirectory(String),

    #[error("too many levels of symbolic links: '{0}'")]
    SymlinkLoop(String),

    #[error("permission denied: '{0}'")]
    AccessDenied(String),

    #[error("file exists: '{0}'")]
    AlreadyExists(String),

    #[error("invalid cross-device operation: '{0}'")]
    CrossDevice(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    /// No registered backend matched the path's scheme token.
    #[error("unknown path scheme: '{0}'")]
    NoSuchScheme(String),

    #[error("read-only filesystem: '{0}'")]
    ReadOnly(String),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("stale file handle")]
    StaleHandle,

    #[error("I/O error {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: OpContext,
    },
}

impl VfsError {
    /// Create an I/O error with context.
    #[must_use]
    pub fn io(source: io::Error, context: OpContext) -> Self {
        VfsError::Io { source, context }
    }

    /// The POSIX-style code name for this error class. Shown to users
    /// next to the message; never used for dispatch.
    #[must_use]
    pub fn errno_name(&self) -> &'static str {
        match self {
            VfsError::Protocol(_) => "EPROTO",
            VfsError::Remote(_) => "EREMOTEIO",
            VfsError::ConnectionReset(_) => "ECONNRESET",
            VfsError::NotFound(_) | VfsError::NoSuchScheme(_) => "ENOENT",
            VfsError::NotDirectory(_) => "ENOTDIR",
            VfsError::IsDirectory(_) => "EISDIR",
            VfsError::SymlinkLoop(_) => "ELOOP",
            VfsError::AccessDenied(_) => "EACCES",
            VfsError::AlreadyExists(_) => "EEXIST",
            VfsError::CrossDevice(_) => "EXDEV",
            VfsError::Invalid(_) => "EINVAL",
            VfsError::ReadOnly(_) => "EROFS",
            VfsError::NotSupported(_) => "ENOTSUP",
            VfsError::StaleHandle => "EBADF",
            VfsError::Io { .. } => "EIO",
        }
    }

    /// True if the owning connection must not be used for further
    /// commands.
    #[must_use]
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, VfsError::ConnectionReset(_))
    }
}

impl From<io::Error> for VfsError {
    fn from(source: io::Error) -> Self {
        VfsError::Io {
            source,
            context: OpContext::new(),
        }
    }
}

pub type VfsResult<T> = Result<T, VfsError>;
