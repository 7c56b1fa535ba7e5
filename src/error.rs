use thiserror::Error;
use warp::http::StatusCode;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Record not found")]
    RecordNotFound,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Missing key: {0}")]
    MissingKey(String),

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Encrypted data too short")]
    CiphertextTooShort,

    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Decryption failed")]
    DecryptFailed,
}

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Variable count mismatch: template wants {expected}, site has {actual}")]
    VariableCountMismatch { expected: usize, actual: usize },

    #[error("Reserved variable name: {0}")]
    ReservedVariable(String),
}

impl Error {
    /// Canonical HTTP status for this error kind.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Store(StoreError::RecordNotFound) => StatusCode::NOT_FOUND,
            Error::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::RecordNotFound,
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Store(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl warp::reject::Reject for Error {}
