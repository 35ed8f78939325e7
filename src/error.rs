//! Error handling for the B2BUA core

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed SIP message: {0}")]
    MalformedMessage(String),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Unknown address-of-record: {0}")]
    UnknownAoR(String),

    #[error("Media backend unavailable: {0}")]
    MediaBackendUnavailable(String),

    #[error("Media session error (rtpproxy code {0})")]
    MediaSessionError(String),

    #[error("Transaction timeout: {0}")]
    TransactionTimeout(String),

    #[error("Answer timeout waiting for ACK")]
    AnswerTimeout,

    #[error("Too many hops (Max-Forwards reached zero)")]
    TooManyHops,

    #[error("Peer transport failure: {0}")]
    PeerTransportFailure(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("B2BUA error: {0}")]
    B2bua(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedMessage(msg.into())
    }

    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn not_supported<S: Into<String>>(msg: S) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse(msg.into())
    }

    pub fn b2bua<S: Into<String>>(msg: S) -> Self {
        Self::B2bua(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Maps a core error to the SIP status the A-leg should see. The dialog
    /// layer is the single point that decides the final status.
    pub fn sip_status(&self) -> Option<(u16, &'static str)> {
        match self {
            Error::AuthRequired => Some((401, "Unauthorized")),
            Error::AuthFailed(_) => Some((403, "Forbidden")),
            Error::UnknownAoR(_) => Some((404, "Not Found")),
            Error::MediaBackendUnavailable(_) => Some((503, "Service Unavailable")),
            Error::MediaSessionError(_) => Some((488, "Not Acceptable Here")),
            Error::TransactionTimeout(_) => Some((408, "Request Timeout")),
            Error::AnswerTimeout => Some((500, "Server Internal Error")),
            Error::TooManyHops => Some((483, "Too Many Hops")),
            Error::PeerTransportFailure(_) => Some((408, "Request Timeout")),
            Error::MalformedMessage(_) => Some((400, "Bad Request")),
            _ => None,
        }
    }
}
