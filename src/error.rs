use std::fmt;

/// Errors surfaced by the page pool and B-tree engine.
///
/// `NotFound` is not a variant here: a missing key is a normal `Option::None`
/// result from `search`, not a failure.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    OutOfSpace,
    Corruption(String),
    InvalidArgument(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::OutOfSpace => write!(f, "page pool has no free pages left"),
            Error::Corruption(msg) => write!(f, "corrupt database: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}

/// Builds an `Error` with a formatted message, in the style of the rest of
/// the codebase's error construction call sites.
macro_rules! err {
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::Error::$variant(format!($($arg)*))
    };
}
pub(crate) use err;
