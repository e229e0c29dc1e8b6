//! Error types for the visit-registration core.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Navigation error: {0}")]
    Navigation(#[from] NavigationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Submission error: {0}")]
    Submit(#[from] SubmitError),

    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),

    #[error("Recognition error: {0}")]
    Recognition(#[from] RecognitionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors fetching read-only data (destination tree, phone candidates).
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("No response from {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("{url} answered with status {status}")]
    Server { url: String, status: u16 },

    #[error("Could not parse response from {url}: {reason}")]
    Parse { url: String, reason: String },
}

/// Precondition violations while browsing the destination tree.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NavigationError {
    #[error("Node {child} is not a child of node {parent}")]
    NotAChild { parent: i64, child: i64 },

    #[error("Already at the root perimeter")]
    AtRoot,

    #[error("No destination tree loaded")]
    NoTreeLoaded,

    #[error("Node {id} cannot be confirmed as a destination in this flow")]
    NotSelectable { id: i64 },

    #[error("A submission is already in progress")]
    SubmissionInFlight,
}

/// Local precondition failures. No I/O has been attempted when one of these
/// is returned.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Phone number has not been verified")]
    PhoneNotVerified,

    #[error("Invalid phone number: {0}")]
    InvalidPhone(String),

    #[error("No identity document captured")]
    MissingDocument,

    #[error("Missing identity field: {field}")]
    MissingIdentity { field: &'static str },

    #[error("A destination is required")]
    MissingDestination,

    #[error("A destination label is required")]
    MissingDestinationLabel,

    #[error("At most {max} additional photos are allowed")]
    TooManyPhotos { max: usize },

    #[error("No photo at position {0}")]
    NoSuchPhoto(usize),

    #[error("A submission is already in progress")]
    SubmissionInFlight,

    #[error("The registration is already complete")]
    AlreadyComplete,
}

/// Visit submission errors.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server rejected the visit with status {status}")]
    Server { status: u16, body: String },
}

/// Phone verification errors.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Verification service answered with status {status}")]
    Server { status: u16 },

    #[error("Verification code rejected")]
    CodeRejected,

    #[error("{0}")]
    Validation(#[from] ValidationError),
}

/// Document recognition errors.
#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Recognition service answered with status {status}")]
    Server { status: u16 },

    #[error("Document could not be read: {0}")]
    Unreadable(String),

    #[error("{0}")]
    Validation(#[from] ValidationError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
