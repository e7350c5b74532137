use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Access denied ({status}): {body}")]
    AccessDenied { status: u16, body: String },

    #[error("Malformed token response: {0}")]
    MalformedResponse(String),

    #[error("Identity provider returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("User lookup for {requested} returned {returned}")]
    UserMismatch { requested: String, returned: String },

    #[error("Failed to sign impersonation token: {0}")]
    Signing(String),

    #[error("Failed to read signing key {path}: {source}")]
    SigningKey {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, IdentityError>;
