use std::time::Duration;

use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Configuration error: {message}"))]
    Configuration { message: String },

    #[snafu(display(
        "Tried to exit critical section {name}, but the innermost open section is {innermost}"
    ))]
    CriticalSectionMismatch { name: String, innermost: String },

    #[snafu(display("The maximum execution time of {limit:?} was exceeded"))]
    AmbientTimeout { limit: Duration },

    #[snafu(display("Emergency timeout of {limit:?} expired in critical section {name}"))]
    EmergencyTimeout { name: String, limit: Duration },

    #[snafu(display("Invalid message: {message}"))]
    InvalidMessage { message: String },

    #[snafu(display("Error returned from database: {source}"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations: {source}"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Error (de)serializing message: {source}"))]
    Serialization {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Internal error"))]
    Internal {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::Internal { source: Some(e) }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::Internal {
            source: Some(e.into()),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage {
            message: message.into(),
        }
    }

    pub fn critical_section_mismatch(name: impl Into<String>, innermost: impl Into<String>) -> Self {
        Self::CriticalSectionMismatch {
            name: name.into(),
            innermost: innermost.into(),
        }
    }

    /// Errors that must never be turned into a damaged-store record: setup defects and
    /// timeouts delivered by the watchdog.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::CriticalSectionMismatch { .. }
                | Self::AmbientTimeout { .. }
                | Self::EmergencyTimeout { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::AmbientTimeout { .. } | Self::EmergencyTimeout { .. }
        )
    }
}

/// Outcome of a failed processing step.
///
/// `Retryable` and `Fatal` both end in the damaged-message store; only `Retryable` gets a
/// retry date, and only while the message is younger than the configured maximum age.
/// `Abort` is never stored: the message stays on its queue and the error propagates out of
/// the consume loop. `Requeue` is not a failure at all: the message goes back onto its queue
/// unchanged, without aging or a damaged record.
#[derive(Debug, Snafu)]
pub enum ProcessingError {
    #[snafu(display("Message requeued for another attempt"))]
    Requeue {},

    #[snafu(display("{report}"))]
    Retryable { report: eyre::Report },

    #[snafu(display("{report}"))]
    Fatal { report: eyre::Report },

    #[snafu(display("{source}"))]
    Abort {
        #[snafu(source)]
        source: Error,
    },
}

impl ProcessingError {
    pub fn retryable<M>(message: M) -> Self
    where
        M: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        Self::Retryable {
            report: eyre::Report::msg(message),
        }
    }

    pub fn fatal<M>(message: M) -> Self
    where
        M: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        Self::Fatal {
            report: eyre::Report::msg(message),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// Full error chain, recorded next to the message in the damaged store.
    pub fn trace(&self) -> String {
        match self {
            Self::Retryable { report } | Self::Fatal { report } => format!("{report:?}"),
            Self::Abort { source } => format!("{source:?}"),
            Self::Requeue {} => String::new(),
        }
    }
}

impl From<Error> for ProcessingError {
    fn from(source: Error) -> Self {
        if source.is_abort() {
            Self::Abort { source }
        } else {
            Self::Fatal {
                report: eyre::Report::new(source),
            }
        }
    }
}

impl From<eyre::Report> for ProcessingError {
    fn from(report: eyre::Report) -> Self {
        Self::Fatal { report }
    }
}
