//! Error types for Causeway
//!
//! Provides a unified error type hierarchy for the driver core. Server and
//! network failures carry the error labels the server (or the driver) attached,
//! and the predicates on [`Error`] drive every retry and resume decision.

use thiserror::Error;

/// Result type alias using Causeway's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label marking an error after which the whole transaction may be retried.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// Label marking a commit whose outcome is unknown.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// Label marking a write that may be retried with the same transaction number.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";

/// Label the server attaches when a failed retry did not perform any write.
pub const NO_WRITES_PERFORMED: &str = "NoWritesPerformed";

/// Server codes that make a read or write retryable.
pub const RETRYABLE_CODES: [i32; 12] = [
    6,     // HostUnreachable
    7,     // HostNotFound
    89,    // NetworkTimeout
    91,    // ShutdownInProgress
    189,   // PrimarySteppedDown
    262,   // ExceededTimeLimit
    9001,  // SocketException
    10107, // NotWritablePrimary
    11600, // InterruptedAtShutdown
    11602, // InterruptedDueToReplStateChange
    13435, // NotPrimaryNoSecondaryOk
    13436, // NotPrimaryOrSecondary
];

/// MaxTimeMSExpired
pub const MAX_TIME_MS_EXPIRED: i32 = 50;

/// UnknownReplWriteConcern
pub const UNKNOWN_REPL_WRITE_CONCERN: i32 = 79;

/// UnsatisfiableWriteConcern
pub const UNSATISFIABLE_WRITE_CONCERN: i32 = 100;

/// Main error type for Causeway
#[derive(Error, Debug)]
pub enum Error {
    // Client-state Errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // Server Errors
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    #[error("Write concern error: {0}")]
    WriteConcern(#[from] WriteConcernError),

    // Network Errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Server selection error: {0}")]
    ServerSelection(#[from] ServerSelectionError),

    // Iteration Errors
    #[error("Change stream error: {0}")]
    ChangeStream(#[from] ChangeStreamError),

    #[error("Cursor error: {0}")]
    Cursor(#[from] CursorError),

    // Context Errors
    #[error("Context deadline exceeded")]
    DeadlineExceeded,

    #[error("Context cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    // Serialization Errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO Errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Errors raised by caller code, e.g. inside a transaction callback
    #[error("Application error: {0}")]
    Application(anyhow::Error),
}

/// Errors caused by misuse of a client session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session was not created by the client running the operation")]
    WrongClient,

    #[error("session has already been ended")]
    SessionEnded,

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("no transaction started")]
    NoTransactionStarted,

    #[error("sessions are not supported by this deployment")]
    NotSupported,
}

/// A server reply with `ok: 0`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code_name} ({code}): {message}")]
pub struct CommandError {
    pub code: i32,
    pub code_name: String,
    pub message: String,
    pub labels: Vec<String>,
}

/// The first entry of a reply's `writeErrors` array
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("write at index {index} failed with code {code}: {message}")]
pub struct WriteError {
    pub index: i32,
    pub code: i32,
    pub message: String,
}

/// A reply's `writeConcernError` document
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code_name} ({code}): {message}")]
pub struct WriteConcernError {
    pub code: i32,
    pub code_name: String,
    pub message: String,
    pub labels: Vec<String>,
}

/// Kind of network failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnectionClosed,
    Timeout,
    Io,
}

/// A failed round trip
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct NetworkError {
    pub kind: NetworkErrorKind,
    pub message: String,
    pub labels: Vec<String>,
}

impl NetworkError {
    pub fn closed(message: impl Into<String>) -> Self {
        Self {
            kind: NetworkErrorKind::ConnectionClosed,
            message: message.into(),
            labels: Vec::new(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: NetworkErrorKind::Timeout,
            message: message.into(),
            labels: Vec::new(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self {
            kind: NetworkErrorKind::Io,
            message: message.into(),
            labels: Vec::new(),
        }
    }
}

/// No suitable server could be selected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ServerSelectionError {
    pub message: String,
    pub labels: Vec<String>,
}

impl ServerSelectionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            labels: Vec::new(),
        }
    }
}

/// Change stream specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChangeStreamError {
    #[error("cannot provide resume functionality when the resume token is missing")]
    MissingResumeToken,

    #[error("change stream is closed")]
    Closed,
}

/// Cursor specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CursorError {
    #[error("cursor is closed")]
    Closed,

    #[error("cursor has no current document")]
    NoCurrentDocument,
}

impl Error {
    /// Wrap an error produced by caller code.
    pub fn application(err: impl Into<anyhow::Error>) -> Self {
        Error::Application(err.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::Session(SessionError::InvalidState(message.into()))
    }

    /// Labels attached to this error. Errors that cannot carry labels return an empty slice.
    pub fn labels(&self) -> &[String] {
        match self {
            Error::Command(e) => &e.labels,
            Error::WriteConcern(e) => &e.labels,
            Error::Network(e) => &e.labels,
            Error::ServerSelection(e) => &e.labels,
            _ => &[],
        }
    }

    pub fn contains_label(&self, label: &str) -> bool {
        self.labels().iter().any(|l| l == label)
    }

    /// Attach a label. A no-op for errors that cannot carry labels.
    pub fn add_label(&mut self, label: &str) {
        let labels = match self {
            Error::Command(e) => &mut e.labels,
            Error::WriteConcern(e) => &mut e.labels,
            Error::Network(e) => &mut e.labels,
            Error::ServerSelection(e) => &mut e.labels,
            _ => return,
        };
        if !labels.iter().any(|l| l == label) {
            labels.push(label.to_string());
        }
    }

    pub fn remove_label(&mut self, label: &str) {
        match self {
            Error::Command(e) => e.labels.retain(|l| l != label),
            Error::WriteConcern(e) => e.labels.retain(|l| l != label),
            Error::Network(e) => e.labels.retain(|l| l != label),
            Error::ServerSelection(e) => e.labels.retain(|l| l != label),
            _ => {}
        }
    }

    /// Server error code, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Command(e) => Some(e.code),
            Error::WriteConcern(e) => Some(e.code),
            Error::Write(e) => Some(e.code),
            _ => None,
        }
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    pub fn is_network_timeout(&self) -> bool {
        matches!(self, Error::Network(e) if e.kind == NetworkErrorKind::Timeout)
    }

    pub fn is_server_selection_error(&self) -> bool {
        matches!(self, Error::ServerSelection(_))
    }

    pub fn is_context_error(&self) -> bool {
        matches!(self, Error::DeadlineExceeded | Error::Cancelled)
    }

    pub fn is_client_state_error(&self) -> bool {
        matches!(self, Error::Session(_))
    }

    pub fn is_max_time_expired(&self) -> bool {
        self.code() == Some(MAX_TIME_MS_EXPIRED)
    }

    fn has_retryable_code(&self) -> bool {
        match self {
            Error::Command(e) => RETRYABLE_CODES.contains(&e.code),
            Error::WriteConcern(e) => RETRYABLE_CODES.contains(&e.code),
            _ => false,
        }
    }

    /// Whether a read that failed with this error may be retried once.
    pub fn is_retryable_read(&self) -> bool {
        self.is_network_error() || self.has_retryable_code()
    }

    /// Whether a write that failed with this error may be retried once.
    pub fn is_retryable_write(&self) -> bool {
        self.contains_label(RETRYABLE_WRITE_ERROR)
            || self.is_network_error()
            || self.has_retryable_code()
    }

    /// Whether a change stream may resume after a `getMore` failed with this error.
    ///
    /// Every server error outside `non_resumable_codes` is resumable, as is any network error.
    pub fn is_resumable(&self, non_resumable_codes: &[i32]) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Command(e) => !non_resumable_codes.contains(&e.code),
            _ => false,
        }
    }

    /// Whether a failed commit should be labelled `UnknownTransactionCommitResult`.
    pub fn is_unknown_commit_result(&self) -> bool {
        if self.is_max_time_expired() || self.is_retryable_write() || self.is_server_selection_error() {
            return true;
        }
        matches!(
            self,
            Error::WriteConcern(e)
                if e.code != UNSATISFIABLE_WRITE_CONCERN && e.code != UNKNOWN_REPL_WRITE_CONCERN
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bson::de::Error> for Error {
    fn from(e: bson::de::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bson::ser::Error> for Error {
    fn from(e: bson::ser::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bson::document::ValueAccessError> for Error {
    fn from(e: bson::document::ValueAccessError) -> Self {
        Error::InvalidResponse(e.to_string())
    }
}
