use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// The external extraction tool is not installed in any known location.
    #[error("Extraction tool not found (looked in: {0})")]
    ToolNotFound(String),

    /// The extraction tool did not finish in time and was killed.
    #[error("Extraction tool timed out after {0:?}")]
    ToolTimeout(std::time::Duration),

    /// The extraction tool ran but failed.
    #[error("Extraction tool failed: {0}")]
    ToolExecution(String),

    /// No plugin and no built-in path accepts this input.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A format plugin claimed the input and reported failure.
    #[error("Plugin conversion failed: {0}")]
    PluginConversionFailed(String),

    /// A plugin program could not be started or ran past its time limit.
    #[error("Plugin {0}")]
    Plugin(String),

    /// Extraction produced no HTML content.
    #[error("No HTML content extracted from {0}")]
    NoContentExtracted(String),

    /// The Amazon session is no longer accepted.
    #[error("Session expired")]
    SessionExpired,

    /// The CSRF token could not be fetched.
    #[error("CSRF token unavailable: {0}")]
    CsrfUnavailable(String),

    /// The init endpoint returned a non-success status.
    #[error("Init API failed: {0}")]
    InitApi(String),

    /// The init endpoint response lacked the upload URL or stkToken.
    #[error("Invalid init response: {0}")]
    InvalidInitResponse(String),

    /// The presigned upload was rejected.
    #[error("Failed to upload file: {0}")]
    UploadFailed(String),

    /// The send endpoint rejected the delivery.
    #[error("{0}")]
    SendApi(String),

    /// Input file is not a well-formed book of its format.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Input file does not exist.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// XML parsing error.
    #[error("XML parsing error: {0}")]
    Xml(#[from] roxmltree::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Message shown to the user for a failed delivery.
    pub fn user_message(&self) -> String {
        match self {
            AppError::SessionExpired | AppError::CsrfUnavailable(_) => {
                "Session expired. Please log in again.".to_string()
            }
            AppError::FileNotFound(_) => "File not found".to_string(),
            AppError::UploadFailed(_) => "Failed to upload file".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("Background task failed: {}", err))
    }
}

/// Result type alias for the application.
pub type Result<T> = std::result::Result<T, AppError>;
