//! CLI errors with sysexits.h exit codes and suggestions.

use std::io;

use russ::ErrorCategory;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Russ(#[from] russ::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode reply: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to set up signal handling: {0}")]
    SignalSetup(String),
}

impl CliError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CliError::Russ(e) => e.category(),
            CliError::Io(_) | CliError::SignalSetup(_) => ErrorCategory::External,
            CliError::Json(_) => ErrorCategory::Protocol,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::InvalidInput => 64, // EX_USAGE
            ErrorCategory::NotFound => 69,     // EX_UNAVAILABLE
            ErrorCategory::Busy => 73,         // EX_CANTCREAT
            ErrorCategory::External => 74,     // EX_IOERR
            ErrorCategory::Timeout => 75,      // EX_TEMPFAIL
            ErrorCategory::Protocol => 76,     // EX_PROTOCOL
        }
    }

    /// Returns a hint for resolving the error, if there is one.
    pub fn suggestion(&self) -> Option<String> {
        let CliError::Russ(err) = self else {
            return None;
        };
        match err {
            russ::Error::ServiceNotFound(_) => Some(
                "Check the address. '+' addresses expand to RUSS_SERVICES_DIR (default /srv/russ)."
                    .to_string(),
            ),
            russ::Error::AddressInUse(path) => Some(format!(
                "Another service is answering at {}. Stop it or pick another path.",
                path.display()
            )),
            russ::Error::PermissionDenied(path) => Some(format!(
                "Check the permissions of {} and its directory.",
                path.display()
            )),
            russ::Error::DialTimeout | russ::Error::ExchangeTimeout => {
                Some("The service did not answer in time. Retry or raise --timeout.".to_string())
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            CliError::Russ(e) => e.is_retryable(),
            _ => false,
        }
    }
}
