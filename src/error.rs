use std::fmt::Display;

/// basalt errors. Peer-protocol violations use Error::Protocol, which the
/// transport treats as a reason to reconnect the offending peer. Database
/// commit conflicts and checkpoint interrupts have their own variants since
/// both are retryable, but at different layers.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The operation was aborted and must be retried, e.g. an escalation
    /// whose leader went away.
    Abort,
    /// A commit conflicted with a concurrent writer and was rolled back.
    Busy,
    /// The storage engine wants to checkpoint; roll back and retry the
    /// current operation once.
    Checkpoint,
    /// Invalid data, typically decoding errors or unexpected internal values.
    InvalidData(String),
    /// Invalid user input, typically configuration errors.
    InvalidInput(String),
    /// An IO error.
    IO(String),
    /// A peer violated the wire protocol (missing header, wrong state,
    /// malformed body).
    Protocol(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::Busy => write!(f, "commit conflict"),
            Error::Checkpoint => write!(f, "checkpoint required"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::Protocol(msg) => write!(f, "protocol violation: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData via format!() and returns it.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput via format!() and returns it.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// Constructs an Error::Protocol via format!() and returns it.
#[macro_export]
macro_rules! errproto {
    ($($args:tt)*) => { $crate::error::Error::Protocol(format!($($args)*)).into() };
}

/// A basalt Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Converts an Error into a Result<T>, to simplify the err* macros.
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
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

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::IO(err.to_string())
    }
}
