use std::fmt;

/// Failure while dialing an upstream proxy or driving its CONNECT handshake.
///
/// Timeout stays separate from every other failure because it decides the
/// status the client sees once retries are exhausted (504 vs 502).
#[derive(Debug)]
pub enum UpstreamError {
    Timeout,
    Other(String),
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, UpstreamError::Timeout)
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::Timeout => write!(f, "timeout"),
            UpstreamError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<std::io::Error> for UpstreamError {
    fn from(e: std::io::Error) -> Self {
        UpstreamError::Other(e.to_string())
    }
}
