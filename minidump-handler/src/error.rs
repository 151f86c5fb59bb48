use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Only one handler registration is allowed per process, and it lives
    /// until the process exits
    HandlerAlreadyRegistered,
    /// The dump directory is missing, not a directory, or not writable
    InvalidDumpPath,
    /// The dump directory path exceeds the fixed path capacity
    DumpPathTooLong,
    /// The OS refused the handler installation
    Os(std::io::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Os(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandlerAlreadyRegistered => {
                f.write_str("unable to register crash handler, only one is allowed at a time")
            }
            Self::InvalidDumpPath => f.write_str("dump directory is missing or not writable"),
            Self::DumpPathTooLong => f.write_str("dump directory path exceeds the fixed capacity"),
            Self::Os(e) => write!(f, "handler installation failed: {}", e),
        }
    }
}
