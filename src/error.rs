use http::StatusCode;
use std::fmt;

#[derive(Debug)]
pub enum ProxyError {
    /// Missing or invalid host header.
    BadRequest(String),
    /// Guard / safety rejection with an HTML body.
    Forbidden(String),
    /// DNS miss: the named host could not be resolved.
    NotResolvable(String),
    /// Upstream did not answer within the configured timeout.
    GatewayTimeout { upstream: String, elapsed_ms: u128 },
    Settings(String),
    Tls(String),
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
            ProxyError::NotResolvable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Settings(_) | ProxyError::Tls(_) | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::BadRequest(msg) => write!(f, "{}", msg),
            ProxyError::Forbidden(msg) => write!(f, "{}", msg),
            ProxyError::NotResolvable(host) => {
                write!(f, "hostname could not be resolved: {}", host)
            }
            ProxyError::GatewayTimeout {
                upstream,
                elapsed_ms,
            } => write!(f, "{} timed out after {}ms", upstream, elapsed_ms),
            ProxyError::Settings(msg) => write!(f, "settings error: {}", msg),
            ProxyError::Tls(msg) => write!(f, "tls error: {}", msg),
            ProxyError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

/// Returned from the request handler when a guard is configured to destroy
/// the socket instead of answering. Surfacing it as the service error makes
/// hyper drop the connection without writing a response.
#[derive(Debug)]
pub struct ConnectionAbort;

impl fmt::Display for ConnectionAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection aborted by source guard")
    }
}

impl std::error::Error for ConnectionAbort {}
