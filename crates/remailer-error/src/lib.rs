//! The unified error type returned by the remailer server keyring.
//!
//! Mirrors the `tor_error`/`arti_relay::Error` split used throughout Arti:
//! callers that only care about what kind of thing went wrong should match
//! on [`ErrorKind`] via [`HasKind::kind`]; callers that want the full
//! picture can use the `Display`/`Error::source` chain on [`Error`]
//! itself. The specific text of that chain is not covered by semantic
//! versioning.

#![forbid(unsafe_code)]

use std::fmt::{self, Display};

use thiserror::Error;

/// The kind of problem that occurred, coarse enough to drive a retry or
/// supervisor policy without inspecting error text.
///
/// Covers every way the keyring subsystem can fail: bad configuration,
/// bad key material, bad or unbuildable descriptors, and publication
/// failures against the directory server.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The supplied configuration was invalid; fatal to the process.
    BadConfig,
    /// A private key file was missing or had unsafe permissions.
    BadKey,
    /// A descriptor file was missing or failed to parse.
    BadDescriptor,
    /// Building a new descriptor failed (no IP to publish, signing failed).
    BuildFailed,
    /// Talking to the directory server failed at the transport level.
    PublishFailed,
    /// The directory server rejected a descriptor outright.
    PublishRejected,
    /// Minting or loading a TLS certificate chain failed.
    BadTls,
    /// Filesystem I/O failed in a way not covered by a more specific kind.
    Io,
    /// We hit a condition that should be impossible; this is a bug.
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::BadConfig => "invalid configuration",
            ErrorKind::BadKey => "invalid or unsafe private key",
            ErrorKind::BadDescriptor => "invalid or unreadable descriptor",
            ErrorKind::BuildFailed => "failed to build descriptor",
            ErrorKind::PublishFailed => "failed to contact directory server",
            ErrorKind::PublishRejected => "directory server rejected descriptor",
            ErrorKind::BadTls => "failed to build TLS context",
            ErrorKind::Io => "I/O error",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// Trait implemented by every error type in this crate (and by
/// [`Error`] itself) so that callers can ask "what kind of error is
/// this?" without downcasting.
pub trait HasKind {
    /// Return the kind of error this is.
    fn kind(&self) -> ErrorKind;
}

/// The unified, opaque error type for the remailer keyring.
///
/// Like `arti_relay::Error`, this wraps a private [`ErrorDetail`] so that
/// the detailed variant list can grow without being a semver break.
#[derive(Error, Clone, Debug)]
pub struct Error {
    /// The actual error.
    #[source]
    detail: Box<ErrorDetail>,
}

impl Error {
    /// Consume this error, returning its kind.
    pub fn kind(&self) -> ErrorKind {
        self.detail.kind()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "keyring: {}: {}", self.detail.kind(), self.detail)
    }
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        self.detail.kind()
    }
}

impl<T> From<T> for Error
where
    ErrorDetail: From<T>,
{
    fn from(detail: T) -> Error {
        Error {
            detail: Box::new(ErrorDetail::from(detail)),
        }
    }
}

/// The detailed, private view of an [`Error`].
#[derive(Error, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorDetail {
    /// A configuration value was out of range or otherwise invalid.
    #[error("bad configuration: {0}")]
    Config(String),

    /// A private key file was missing, unreadable, or not owner-only.
    #[error("bad private key: {0}")]
    Key(String),

    /// A descriptor file was missing or failed to parse.
    #[error("bad descriptor: {0}")]
    Descriptor(String),

    /// Building a new descriptor failed.
    #[error("could not build descriptor: {0}")]
    Build(String),

    /// Publishing a descriptor failed at the transport level.
    #[error("could not publish descriptor: {0}")]
    Publish(String),

    /// The directory rejected a descriptor.
    #[error("descriptor rejected by directory: {0}")]
    Rejected(String),

    /// TLS context construction failed.
    #[error("could not build TLS context: {0}")]
    Tls(String),

    /// An I/O error with no more specific kind attached.
    #[error("I/O error: {0}")]
    Io(String),

    /// Something happened that our invariants say cannot happen.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HasKind for ErrorDetail {
    fn kind(&self) -> ErrorKind {
        match self {
            ErrorDetail::Config(_) => ErrorKind::BadConfig,
            ErrorDetail::Key(_) => ErrorKind::BadKey,
            ErrorDetail::Descriptor(_) => ErrorKind::BadDescriptor,
            ErrorDetail::Build(_) => ErrorKind::BuildFailed,
            ErrorDetail::Publish(_) => ErrorKind::PublishFailed,
            ErrorDetail::Rejected(_) => ErrorKind::PublishRejected,
            ErrorDetail::Tls(_) => ErrorKind::BadTls,
            ErrorDetail::Io(_) => ErrorKind::Io,
            ErrorDetail::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<std::io::Error> for ErrorDetail {
    fn from(e: std::io::Error) -> Self {
        ErrorDetail::Io(e.to_string())
    }
}

impl From<derive_builder::UninitializedFieldError> for ErrorDetail {
    fn from(e: derive_builder::UninitializedFieldError) -> Self {
        ErrorDetail::Config(e.to_string())
    }
}

/// Construct an [`ErrorDetail::Internal`] from a `format!`-style message,
/// analogous to `tor_error::internal!`.
#[macro_export]
macro_rules! internal {
    ($($arg:tt)*) => {
        $crate::ErrorDetail::Internal(format!($($arg)*))
    };
}

/// Shorthand `Result` alias used throughout the keyring crates.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_roundtrip() {
        let e: Error = ErrorDetail::Config("bad bits".into()).into();
        assert_eq!(e.kind(), ErrorKind::BadConfig);
        assert!(e.to_string().contains("bad bits"));
    }

    #[test]
    fn io_conversion() {
        let io_err = std::io::Error::other("disk full");
        let detail: ErrorDetail = io_err.into();
        assert_eq!(detail.kind(), ErrorKind::Io);
    }
}
