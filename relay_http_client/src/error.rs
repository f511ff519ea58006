use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Invalid origin header value: {0}")]
    InvalidOrigin(String),
    #[error("URL parsing failed: {0}")]
    UrlParse(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, RelayClientError>;
