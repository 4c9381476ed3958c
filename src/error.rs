use std::fmt;

#[derive(Debug)]
pub enum TunnelError {
    InvalidHello(String),
    AuthFailed,
    InvalidSubdomain(String),
    SubdomainInUse(String),
    LimitReached,
    RegistryUnavailable(String),
    NotFound,
    Expired,
    SendBufferFull,
    ConnectionClosed,
    UpstreamTimeout,
    NoResponse,
    PeerProxyFailed(String),
    PasswordMissing,
    PasswordInvalid,
    Redis(redis::RedisError),
    Config(String),
    Internal(String),
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelError::InvalidHello(msg) => write!(f, "invalid hello: {}", msg),
            TunnelError::AuthFailed => write!(f, "authentication failed"),
            TunnelError::InvalidSubdomain(s) => write!(f, "invalid subdomain: {}", s),
            TunnelError::SubdomainInUse(s) => write!(f, "subdomain in use: {}", s),
            TunnelError::LimitReached => write!(f, "connection limit reached"),
            TunnelError::RegistryUnavailable(msg) => write!(f, "registry unavailable: {}", msg),
            TunnelError::NotFound => write!(f, "not found"),
            TunnelError::Expired => write!(f, "record expired"),
            TunnelError::SendBufferFull => write!(f, "send buffer full"),
            TunnelError::ConnectionClosed => write!(f, "connection closed"),
            TunnelError::UpstreamTimeout => write!(f, "upstream timeout"),
            TunnelError::NoResponse => write!(f, "no response from tunnel"),
            TunnelError::PeerProxyFailed(msg) => write!(f, "peer proxy failed: {}", msg),
            TunnelError::PasswordMissing => write!(f, "password required"),
            TunnelError::PasswordInvalid => write!(f, "password invalid"),
            TunnelError::Redis(e) => write!(f, "redis error: {}", e),
            TunnelError::Config(msg) => write!(f, "config error: {}", msg),
            TunnelError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for TunnelError {}

impl From<redis::RedisError> for TunnelError {
    fn from(e: redis::RedisError) -> Self {
        TunnelError::Redis(e)
    }
}
