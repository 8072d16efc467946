//! Caller key extraction.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

/// What the request boundary knows about an inbound unit of work.
pub trait RequestMeta {
    /// Address of the peer that sent the request.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Value of the header `name`, matched case-insensitively.
    fn header(&self, name: &str) -> Option<&str>;
}

/// Which budget a request is charged against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Every request shares the global budget.
    Global,
    /// One budget per remote IP address; the port is ignored.
    RemoteAddr,
    /// One budget per value of a header such as `X-Forwarded-For`.
    Header(String),
}

impl KeySource {
    pub fn header(name: impl Into<String>) -> Self {
        KeySource::Header(name.into())
    }

    /// The caller key for `req`, or `None` for the global budget.
    ///
    /// Requests lacking the header or a remote address all share the empty
    /// key rather than bypassing the limit.
    pub fn key_for<R: RequestMeta + ?Sized>(&self, req: &R) -> Option<String> {
        match self {
            KeySource::Global => None,
            KeySource::RemoteAddr => Some(
                req.remote_addr()
                    .map(|addr| addr.ip().to_string())
                    .unwrap_or_default(),
            ),
            KeySource::Header(name) => Some(req.header(name).unwrap_or_default().to_string()),
        }
    }
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Global => write!(f, "global"),
            KeySource::RemoteAddr => write!(f, "remote-addr"),
            KeySource::Header(name) => write!(f, "header:{}", name),
        }
    }
}

/// A plain request description, for transports without their own request type.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub remote_addr: Option<SocketAddr>,
    /// Header names are stored lowercased.
    headers: HashMap<String, String>,
}

impl RequestInfo {
    pub fn new(remote_addr: Option<SocketAddr>) -> Self {
        Self {
            remote_addr,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }
}

impl RequestMeta for RequestInfo {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RequestInfo {
        RequestInfo::new(Some("192.168.1.7:51234".parse().unwrap()))
            .with_header("X-Real-Ip", "10.1.2.3")
    }

    #[test]
    fn test_global_has_no_key() {
        assert_eq!(KeySource::Global.key_for(&request()), None);
    }

    #[test]
    fn test_remote_addr_key_drops_port() {
        assert_eq!(
            KeySource::RemoteAddr.key_for(&request()),
            Some("192.168.1.7".to_string())
        );
        assert_eq!(
            KeySource::RemoteAddr.key_for(&RequestInfo::default()),
            Some(String::new())
        );
    }

    #[test]
    fn test_header_key_is_case_insensitive() {
        let source = KeySource::header("x-real-ip");
        assert_eq!(source.key_for(&request()), Some("10.1.2.3".to_string()));
    }

    #[test]
    fn test_missing_header_shares_empty_key() {
        let source = KeySource::header("X-Forwarded-For");
        assert_eq!(source.key_for(&request()), Some(String::new()));
    }

    #[test]
    fn test_display() {
        assert_eq!(KeySource::header("X-Api-Key").to_string(), "header:X-Api-Key");
        assert_eq!(KeySource::RemoteAddr.to_string(), "remote-addr");
    }
}
