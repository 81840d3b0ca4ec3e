//! Error types for the clone orchestration crate.

use std::fmt;

/// Categorised error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneErrorKind {
    /// Source, target or inventory object missing
    NotFound,
    /// Version / state requirements for a clone strategy are not met
    PreconditionFailed,
    /// A platform task finished in the `error` state
    TaskFailed,
    /// Target network has a backing the planner cannot express
    UnsupportedNetworkType,
    /// SCSI unit numbers exhausted on the controller
    ResourceExhausted,
    /// Requested static IP already answers on the network
    AddressConflict,
    /// No Windows product key supplied or known for the guest OS
    MissingProductKey,
    /// Discovery or customization wait exceeded
    Timeout,
    /// Only link-local (169.254.0.0/16) addresses were observed
    DhcpExhausted,
    /// Guest credentials rejected by the in-guest agent
    GuestAuthFailed,
    /// Script inside the guest exited non-zero
    GuestCommandFailed,
    /// Request options are malformed or incomplete
    InvalidOptions,
    /// Run cancelled by the caller
    Cancelled,
    /// vCenter unreachable or session expired
    ConnectionError,
    /// vCenter login failed (401 / InvalidLogin)
    AuthenticationError,
    /// HTTP / API error with status code
    ApiError(u16),
    /// JSON parse / deserialization error
    ParseError,
    /// Generic
    Other,
}

/// Crate error type carrying a kind + human-readable message.
#[derive(Debug, Clone)]
pub struct CloneError {
    pub kind: CloneErrorKind,
    pub message: String,
    /// Run context (VM name, strategy, state, elapsed time) when known.
    pub details: Option<String>,
}

impl CloneError {
    pub fn new(kind: CloneErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            details: None,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::NotFound, msg)
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::PreconditionFailed, msg)
    }

    pub fn task(msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::TaskFailed, msg)
    }

    pub fn unsupported_network(msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::UnsupportedNetworkType, msg)
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::ResourceExhausted, msg)
    }

    pub fn address_conflict(msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::AddressConflict, msg)
    }

    pub fn missing_product_key(msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::MissingProductKey, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::Timeout, msg)
    }

    pub fn dhcp_exhausted(msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::DhcpExhausted, msg)
    }

    pub fn guest_auth(msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::GuestAuthFailed, msg)
    }

    pub fn guest_command(msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::GuestCommandFailed, msg)
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::InvalidOptions, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::Cancelled, msg)
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::ConnectionError, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::AuthenticationError, msg)
    }

    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::ApiError(status), msg)
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(CloneErrorKind::ParseError, msg)
    }

    /// Attach run context. Existing details are kept in front.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        let details = details.into();
        self.details = Some(match self.details.take() {
            Some(prev) => format!("{prev}; {details}"),
            None => details,
        });
        self
    }

    pub fn is(&self, kind: CloneErrorKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for CloneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(ref d) = self.details {
            write!(f, " ({d})")?;
        }
        Ok(())
    }
}

impl std::error::Error for CloneError {}

impl From<CloneError> for String {
    fn from(e: CloneError) -> String {
        e.to_string()
    }
}

impl From<reqwest::Error> for CloneError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(format!("HTTP timeout: {e}"))
        } else if e.is_connect() {
            Self::connection(format!("Connection failed: {e}"))
        } else {
            Self::new(CloneErrorKind::Other, format!("HTTP error: {e}"))
        }
    }
}

impl From<serde_json::Error> for CloneError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(format!("JSON parse error: {e}"))
    }
}

impl From<csv::Error> for CloneError {
    fn from(e: csv::Error) -> Self {
        Self::new(CloneErrorKind::Other, format!("Benchmark CSV error: {e}"))
    }
}

impl From<std::io::Error> for CloneError {
    fn from(e: std::io::Error) -> Self {
        Self::new(CloneErrorKind::Other, format!("I/O error: {e}"))
    }
}

/// Convenience alias.
pub type CloneResult<T> = Result<T, CloneError>;
