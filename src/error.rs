use thiserror::Error;

/// Unified error type for rota-fetch
#[derive(Error, Debug)]
pub enum FetchError {
    // Proxy errors
    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Allocator errors
    #[error("Proxy allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Could not complete: no proxies available")]
    AllocationExhausted,

    // Lease store errors
    #[error("Lease store error: {0}")]
    Store(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Fetch abandoned after {elapsed_secs}s deadline")]
    DeadlineExceeded { elapsed_secs: u64 },

    #[error("Fetch abandoned after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for rota-fetch operations
pub type Result<T> = std::result::Result<T, FetchError>;

impl FetchError {
    /// Process exit code for this error (sysexits.h values)
    pub fn exit_code(&self) -> i32 {
        match self {
            // EX_USAGE
            FetchError::InvalidRequest(_) => 64,

            // EX_DATAERR
            FetchError::InvalidProxyAddress(_)
            | FetchError::UnsupportedProtocol(_)
            | FetchError::Json(_) => 65,

            // EX_UNAVAILABLE
            FetchError::AllocationFailed(_) | FetchError::AllocationExhausted => 69,

            // EX_SOFTWARE
            FetchError::Http(_) => 70,

            // EX_IOERR
            FetchError::Io(_) | FetchError::Store(_) => 74,

            // EX_TEMPFAIL
            FetchError::DeadlineExceeded { .. } | FetchError::AttemptsExhausted { .. } => 75,

            // EX_CONFIG
            FetchError::InvalidConfig(_) | FetchError::MissingEnvVar(_) => 78,
        }
    }

    /// Check if the error comes from the proxy allocator
    pub fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            FetchError::AllocationFailed(_) | FetchError::AllocationExhausted
        )
    }

    /// Check if a later fetch of the same URL could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::AllocationFailed(_)
                | FetchError::DeadlineExceeded { .. }
                | FetchError::AttemptsExhausted { .. }
                | FetchError::Io(_)
                | FetchError::Store(_)
        )
    }
}

// Convert from reqwest errors
impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Http(err.to_string())
    }
}
