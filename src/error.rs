/// A quorumkv result returning [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// A quorumkv error. Errors only cross module boundaries for logging and
/// client failure responses, so they carry rendered strings.
#[derive(Clone, PartialEq)]
pub enum Error {
    /// Invalid data, e.g. an undecodable wire message.
    InvalidData(String),
    /// Invalid user input, e.g. a malformed command-line argument.
    InvalidInput(String),
    /// An IO, socket, or channel error.
    IO(String),
}

impl std::error::Error for Error {}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidData(s) | Error::InvalidInput(s) | Error::IO(s) => write!(f, "{}", s),
        }
    }
}

/// Constructs an Error::InvalidInput via format!(), wrapped in Err.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidInput(format!($($args)*))) };
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
