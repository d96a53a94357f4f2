use std::fmt;
use std::io;

use crate::browser::BrowserError;

/// Top-level errors that abort the run.
///
/// Per-page problems never surface here — they live in the page records.
#[derive(Debug)]
pub enum AppError {
    /// Reading inputs or writing outputs failed.
    Io(io::Error),
    /// The browser connection could not be established or died.
    Browser(BrowserError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Browser(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Browser(e) => Some(e),
        }
    }
}

impl From<io::Error> for AppError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<BrowserError> for AppError {
    fn from(e: BrowserError) -> Self {
        Self::Browser(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_wraps_io_errors() {
        let err = AppError::from(io::Error::new(io::ErrorKind::NotFound, "hosts.txt"));
        assert_eq!(err.to_string(), "I/O error: hosts.txt");
    }

    #[test]
    fn display_passes_browser_errors_through() {
        let err = AppError::from(BrowserError::Discovery("connect refused".into()));
        assert_eq!(err.to_string(), "browser discovery failed: connect refused");
    }
}
