use std::io;

/// Central error type for the satie engine.
#[derive(Debug)]
pub enum SatieError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Malformed HTTP request (400 territory).
    BadRequest,
    /// Connection table reached MAX_FD capacity.
    TableFull,
    /// SQL driver or pool failure.
    Sql(String),
    /// Unrecoverable reactor failure (epoll/listener).
    Fatal(String),
}

impl std::fmt::Display for SatieError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SatieError::Io(e) => write!(f, "I/O error: {}", e),
            SatieError::BadRequest => write!(f, "malformed HTTP request"),
            SatieError::TableFull => write!(f, "connection table is full"),
            SatieError::Sql(msg) => write!(f, "SQL error: {}", msg),
            SatieError::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

impl std::error::Error for SatieError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SatieError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SatieError {
    fn from(e: io::Error) -> Self {
        SatieError::Io(e)
    }
}

impl From<postgres::Error> for SatieError {
    fn from(e: postgres::Error) -> Self {
        SatieError::Sql(e.to_string())
    }
}

pub type SatieResult<T> = Result<T, SatieError>;
