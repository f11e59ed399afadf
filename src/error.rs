use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetGeoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection table unavailable: {0}")]
    ConnectionTable(String),

    #[error("Unsupported platform: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Geolocation provider returned status {0}")]
    ProviderStatus(u16),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Timeout error: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, NetGeoError>;
