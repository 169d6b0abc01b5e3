use thiserror::Error;

/// Rejections produced by the proxy before anything is forwarded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("Method not allowed")]
    MissingAction,
    #[error("Invalid action: {0}")]
    UnknownAction(String),
}

/// Missing local input, caught before any network call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Select an instance first")]
    NoInstanceSelected,
    #[error("Please enter a phone number")]
    MissingPhoneNumber,
    #[error("Please fill all config fields")]
    IncompleteConfig,
    #[error("Please fill all fields")]
    IncompleteMessage,
}

/// How a forwarded call went wrong, as seen from the reply envelope.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// The proxy never reached the gateway.
    #[error("gateway unreachable: {message}")]
    Transport { message: String },
    /// The gateway answered with something that is not JSON.
    #[error("gateway returned a non-JSON response (HTTP {status})")]
    Decode { status: u16, raw_response: String },
    /// The gateway answered with structured data describing a failure.
    #[error("gateway rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
}

impl UpstreamError {
    /// Transport failures are worth retrying, the others are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Failures of the link between the controller and the proxy itself.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("proxy request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("proxy answered HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("proxy reply could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("controller is shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("no config directory available")]
    NoConfigDir,
    #[error("failed to access settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("failed to build gateway client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("server i/o failed: {0}")]
    Io(#[from] std::io::Error),
}
