pub mod auth;
pub mod handler;
pub mod http_codec;
pub mod pages;
pub mod peer;

pub use handler::handle_public_request;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Matches public Host headers against the configured domain template and
/// pulls out the subdomain routing key.
///
/// The template is a literal hostname with one `{{ .subdomain }}`
/// placeholder, e.g. `{{ .subdomain }}.tunnel.example.com`.
pub struct DomainMatcher {
    prefix: String,
    suffix: String,
}

impl DomainMatcher {
    pub fn new(template: &str) -> Self {
        let (prefix, suffix) = template
            .split_once("{{ .subdomain }}")
            .unwrap_or(("", template));
        Self {
            prefix: prefix.to_ascii_lowercase(),
            suffix: suffix.to_ascii_lowercase(),
        }
    }

    /// Extract the subdomain from a Host header value. Ports are ignored;
    /// the extracted label must be a single valid subdomain.
    pub fn extract(&self, host: &str) -> Option<String> {
        let host = host.rsplit_once(':').map_or(host, |(h, port)| {
            // Only strip a real port suffix, not part of an IPv6 literal.
            if port.chars().all(|c| c.is_ascii_digit()) {
                h
            } else {
                host
            }
        });
        let host = host.to_ascii_lowercase();

        let inner = host
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())?;
        if crate::server::control::is_valid_subdomain(inner) {
            Some(inner.to_string())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_subdomain() {
        let matcher = DomainMatcher::new("{{ .subdomain }}.localhost");
        assert_eq!(matcher.extract("demo.localhost").as_deref(), Some("demo"));
        assert_eq!(
            matcher.extract("abc12xyz.localhost:8080").as_deref(),
            Some("abc12xyz")
        );
    }

    #[test]
    fn test_rejects_non_matching_hosts() {
        let matcher = DomainMatcher::new("{{ .subdomain }}.tunnel.dev");
        assert!(matcher.extract("tunnel.dev").is_none());
        assert!(matcher.extract("demo.other.dev").is_none());
        // Nested labels are not one subdomain.
        assert!(matcher.extract("a.b.tunnel.dev").is_none());
    }

    #[test]
    fn test_host_matching_is_case_insensitive() {
        let matcher = DomainMatcher::new("{{ .subdomain }}.Tunnel.Dev");
        assert_eq!(matcher.extract("DEMO.tunnel.dev").as_deref(), Some("demo"));
    }
}
