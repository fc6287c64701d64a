//! Block-layer I/O core.
//!
//! Requests enter through [`node::IoQueue`] (top-level users) or [`node::NodeUser`] (parent
//! nodes issuing I/O to their children), are padded and split to the node's limits, tracked
//! for overlap serialisation, and forwarded to the node's [`node::NodeDriver`].

#[macro_use]
extern crate log;

#[macro_use]
pub mod helpers;

pub mod aio;
pub mod coroutine;
pub mod file;
pub mod memory;
pub mod node;
pub mod overlay;
pub mod raw;

use std::fmt::{self, Display, Formatter};

/// Coarse classification of block-layer failures, so callers can tell "change the medium and
/// retry" apart from permission problems and from plain I/O errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    #[error("no medium")]
    NoMedium,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("permission denied")]
    Permission,
    #[error("I/O error")]
    Io,
    #[error("operation not supported")]
    NotSupported,
}

#[derive(Clone, Debug)]
pub struct BlockError {
    kind: ErrorKind,
    description: String,
}

pub type BlockResult<T> = Result<T, BlockError>;

impl BlockError {
    pub fn new<S: Into<String>>(kind: ErrorKind, description: S) -> Self {
        BlockError {
            kind,
            description: description.into(),
        }
    }

    /// Generic I/O error with the given description
    pub fn from_desc(description: String) -> Self {
        Self::new(ErrorKind::Io, description)
    }

    pub fn no_medium(node_name: &str) -> Self {
        Self::new(
            ErrorKind::NoMedium,
            format!("Node \"{}\" has no medium", node_name),
        )
    }

    pub fn not_supported<S: Into<String>>(description: S) -> Self {
        Self::new(ErrorKind::NotSupported, description)
    }

    pub fn invalid<S: Into<String>>(description: S) -> Self {
        Self::new(ErrorKind::InvalidArgument, description)
    }

    pub fn permission<S: Into<String>>(description: S) -> Self {
        Self::new(ErrorKind::Permission, description)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_not_supported(&self) -> bool {
        self.kind == ErrorKind::NotSupported
    }

    /// Negative errno value for this error, for callers that speak in error codes
    pub fn errno(&self) -> i32 {
        -match self.kind {
            ErrorKind::NoMedium => libc::ENOMEDIUM,
            ErrorKind::InvalidArgument => libc::EINVAL,
            ErrorKind::Permission => libc::EPERM,
            ErrorKind::Io => libc::EIO,
            ErrorKind::NotSupported => libc::ENOTSUP,
        }
    }

    pub fn prepend(mut self, prefix: &str) -> Self {
        self.description = format!("{}: {}", prefix, self.description);
        self
    }

    pub fn into_description(self) -> String {
        self.description
    }
}

impl Display for BlockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description)
    }
}

impl std::error::Error for BlockError {}

impl From<String> for BlockError {
    fn from(description: String) -> Self {
        Self::from_desc(description)
    }
}

impl From<&str> for BlockError {
    fn from(description: &str) -> Self {
        Self::from_desc(description.to_string())
    }
}

impl From<std::io::Error> for BlockError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.raw_os_error() {
            Some(libc::ENOMEDIUM) => ErrorKind::NoMedium,
            Some(libc::EINVAL) => ErrorKind::InvalidArgument,
            Some(libc::EPERM) | Some(libc::EACCES) | Some(libc::EROFS) => ErrorKind::Permission,
            Some(libc::EOPNOTSUPP) => ErrorKind::NotSupported,
            _ if err.kind() == std::io::ErrorKind::Unsupported => ErrorKind::NotSupported,
            _ => ErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<std::alloc::LayoutError> for BlockError {
    fn from(err: std::alloc::LayoutError) -> Self {
        Self::invalid(err.to_string())
    }
}

impl From<std::num::TryFromIntError> for BlockError {
    fn from(err: std::num::TryFromIntError) -> Self {
        Self::invalid(err.to_string())
    }
}

impl From<serde_json::Error> for BlockError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid(err.to_string())
    }
}
