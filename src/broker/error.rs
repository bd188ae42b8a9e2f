use rkyv::{Archive, Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced by the registry and slice brokers.
///
/// Every variant carries a single detail string so an error can be sent to a
/// peer as `(ErrorKind, detail)` and rebuilt on the other side unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// No authority prefix matches a name used in a single-target operation.
    #[error("missing authority for {0}")]
    MissingAuthority(String),
    #[error("record not found: {0}")]
    RecordNotFound(String),
    #[error("record already exists: {0}")]
    ExistingRecord(String),
    #[error("unknown record type: {0}")]
    UnknownSfaType(String),
    /// The rights policy granted nothing.
    #[error("permission denied: {0}")]
    PermissionError(String),
    #[error("account not enabled: {0}")]
    AccountNotEnabled(String),
    /// None of the presented credentials authorizes the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("credential expired: {0}")]
    CredentialExpired(String),
    #[error("invalid name: {0}")]
    InvalidXrn(String),
    /// A testbed driver hook failed.
    #[error("testbed driver failed: {0}")]
    Driver(String),
    /// The RPC to a peer could not be completed.
    #[error("transport failed: {0}")]
    Transport(String),
    /// A peer answered with an error we have no local variant for.
    #[error("remote failure: {0}")]
    Remote(String),
    #[error("configuration error: {0}")]
    Config(String),
    /// A value could not be encoded for signing or the wire.
    #[error("encoding failed: {0}")]
    Encoding(String),
}

/// Stable tag for each [`BrokerError`] variant.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
#[repr(u8)]
pub enum ErrorKind {
    MissingAuthority,
    RecordNotFound,
    ExistingRecord,
    UnknownSfaType,
    PermissionError,
    AccountNotEnabled,
    Unauthorized,
    CredentialExpired,
    InvalidXrn,
    Driver,
    Transport,
    Remote,
    Config,
    Encoding,
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::MissingAuthority(_) => ErrorKind::MissingAuthority,
            BrokerError::RecordNotFound(_) => ErrorKind::RecordNotFound,
            BrokerError::ExistingRecord(_) => ErrorKind::ExistingRecord,
            BrokerError::UnknownSfaType(_) => ErrorKind::UnknownSfaType,
            BrokerError::PermissionError(_) => ErrorKind::PermissionError,
            BrokerError::AccountNotEnabled(_) => ErrorKind::AccountNotEnabled,
            BrokerError::Unauthorized(_) => ErrorKind::Unauthorized,
            BrokerError::CredentialExpired(_) => ErrorKind::CredentialExpired,
            BrokerError::InvalidXrn(_) => ErrorKind::InvalidXrn,
            BrokerError::Driver(_) => ErrorKind::Driver,
            BrokerError::Transport(_) => ErrorKind::Transport,
            BrokerError::Remote(_) => ErrorKind::Remote,
            BrokerError::Config(_) => ErrorKind::Config,
            BrokerError::Encoding(_) => ErrorKind::Encoding,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            BrokerError::MissingAuthority(d)
            | BrokerError::RecordNotFound(d)
            | BrokerError::ExistingRecord(d)
            | BrokerError::UnknownSfaType(d)
            | BrokerError::PermissionError(d)
            | BrokerError::AccountNotEnabled(d)
            | BrokerError::Unauthorized(d)
            | BrokerError::CredentialExpired(d)
            | BrokerError::InvalidXrn(d)
            | BrokerError::Driver(d)
            | BrokerError::Transport(d)
            | BrokerError::Remote(d)
            | BrokerError::Config(d)
            | BrokerError::Encoding(d) => d,
        }
    }

    pub fn from_wire(kind: ErrorKind, detail: String) -> Self {
        match kind {
            ErrorKind::MissingAuthority => BrokerError::MissingAuthority(detail),
            ErrorKind::RecordNotFound => BrokerError::RecordNotFound(detail),
            ErrorKind::ExistingRecord => BrokerError::ExistingRecord(detail),
            ErrorKind::UnknownSfaType => BrokerError::UnknownSfaType(detail),
            ErrorKind::PermissionError => BrokerError::PermissionError(detail),
            ErrorKind::AccountNotEnabled => BrokerError::AccountNotEnabled(detail),
            ErrorKind::Unauthorized => BrokerError::Unauthorized(detail),
            ErrorKind::CredentialExpired => BrokerError::CredentialExpired(detail),
            ErrorKind::InvalidXrn => BrokerError::InvalidXrn(detail),
            ErrorKind::Driver => BrokerError::Driver(detail),
            ErrorKind::Transport => BrokerError::Transport(detail),
            ErrorKind::Remote => BrokerError::Remote(detail),
            ErrorKind::Config => BrokerError::Config(detail),
            ErrorKind::Encoding => BrokerError::Encoding(detail),
        }
    }
}
