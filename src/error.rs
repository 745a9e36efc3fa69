use std::io;

/// String like type that occupies the same space as one usize
type TinyStr = Box<String>;

/// Errors surfaced by the store.
///
/// Internal contention (a lost publication race, a resize in progress) is
/// never surfaced; it drives the update transaction retry loop instead.
#[allow(missing_docs)]
#[derive(Debug, Display, Error)]
#[display("{:?}", self)]
#[non_exhaustive]
pub enum Error {
    /// An operating system I/O failure (truncate, map, flush, rename, ...).
    /// The store metadata is left untouched and may remain usable.
    Io(io::Error),
    /// The file contents failed validation while being decoded. Not
    /// recoverable at runtime.
    Corruption(#[error(not(source))] TinyStr),
    /// A caller-supplied argument was rejected.
    Validation(#[error(not(source))] TinyStr),
    /// A mutation was attempted inside a view transaction.
    WriteTransactionRequired,
    /// The store was closed by another handle or thread.
    StoreClosed,
}

impl Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(Box::new(msg.into()))
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        let kind = match &value {
            Error::Io(i) => i.kind(),
            Error::Corruption(_) => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, value)
    }
}

macro_rules! corruption {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::Corruption(msg.into())
    }}
}

macro_rules! error_validation {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::Validation(msg.into())
    }}
}

pub(crate) use corruption;
pub(crate) use error_validation;
