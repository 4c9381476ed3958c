//! Tenant password enforcement on the public surface.
//!
//! Two credentials are accepted: the `x-tungo-password` header (compared by
//! hash) and the `tungo-auth-{subdomain}` cookie, whose value IS the hash,
//! `hex(sha256(password))`. Only the hash is ever stored or compared.

use http::HeaderMap;
use sha2::{Digest, Sha256};

pub const PASSWORD_HEADER: &str = "x-tungo-password";
pub const AUTH_COOKIE_PREFIX: &str = "tungo-auth-";

/// Cookie lifetime granted on successful header auth.
pub const AUTH_COOKIE_MAX_AGE_SECS: u64 = 24 * 60 * 60;

pub fn password_hash(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthDecision {
    /// No password on the tunnel, or a valid cookie: proxy the request.
    Allowed,
    /// Header password matched: acknowledge with JSON and set the cookie.
    GrantCookie,
    /// Header password presented but wrong: 401 JSON error.
    BadPassword,
    /// No usable credential: 401 prompt page.
    PromptRequired,
}

/// Evaluate the request's credentials against the tunnel's stored hash.
pub fn check(headers: &HeaderMap, sub_domain: &str, stored_hash: Option<&str>) -> AuthDecision {
    let Some(stored_hash) = stored_hash else {
        return AuthDecision::Allowed;
    };

    if let Some(presented) = headers.get(PASSWORD_HEADER).and_then(|v| v.to_str().ok()) {
        return if password_hash(presented) == stored_hash {
            AuthDecision::GrantCookie
        } else {
            AuthDecision::BadPassword
        };
    }

    let cookie_name = format!("{}{}", AUTH_COOKIE_PREFIX, sub_domain);
    if let Some(value) = cookie_value(headers, &cookie_name) {
        if value == stored_hash {
            return AuthDecision::Allowed;
        }
    }

    AuthDecision::PromptRequired
}

/// `Set-Cookie` line minted on successful header auth.
pub fn grant_cookie(sub_domain: &str, stored_hash: &str) -> String {
    format!(
        "{}{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        AUTH_COOKIE_PREFIX, sub_domain, stored_hash, AUTH_COOKIE_MAX_AGE_SECS
    )
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    // Multiple Cookie headers are legal; each holds ";"-separated pairs.
    for header in headers.get_all(http::header::COOKIE) {
        let Ok(text) = header.to_str() else { continue };
        for pair in text.split(';') {
            if let Some((k, v)) = pair.split_once('=') {
                if k.trim() == name {
                    return Some(v.trim());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderValue, COOKIE};

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_no_password_always_allowed() {
        assert_eq!(check(&HeaderMap::new(), "demo", None), AuthDecision::Allowed);
    }

    #[test]
    fn test_header_match_grants_cookie() {
        let hash = password_hash("letmein");
        let headers = headers_with(PASSWORD_HEADER, "letmein");
        assert_eq!(
            check(&headers, "secure", Some(&hash)),
            AuthDecision::GrantCookie
        );
    }

    #[test]
    fn test_wrong_header_is_rejected_not_prompted() {
        let hash = password_hash("letmein");
        let headers = headers_with(PASSWORD_HEADER, "wrong");
        assert_eq!(
            check(&headers, "secure", Some(&hash)),
            AuthDecision::BadPassword
        );
    }

    #[test]
    fn test_cookie_match_allows() {
        let hash = password_hash("letmein");
        let headers = headers_with("cookie", &format!("a=b; tungo-auth-secure={}", hash));
        assert_eq!(check(&headers, "secure", Some(&hash)), AuthDecision::Allowed);
    }

    #[test]
    fn test_cookie_for_other_subdomain_prompts() {
        let hash = password_hash("letmein");
        let headers = headers_with("cookie", &format!("tungo-auth-other={}", hash));
        assert_eq!(
            check(&headers, "secure", Some(&hash)),
            AuthDecision::PromptRequired
        );
    }

    #[test]
    fn test_no_credentials_prompts() {
        let hash = password_hash("letmein");
        assert_eq!(
            check(&HeaderMap::new(), "secure", Some(&hash)),
            AuthDecision::PromptRequired
        );
    }

    #[test]
    fn test_cookie_across_multiple_headers() {
        let hash = password_hash("pw");
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("x=1"));
        headers.append(
            COOKIE,
            HeaderValue::from_str(&format!("tungo-auth-s={}", hash)).unwrap(),
        );
        assert_eq!(check(&headers, "s", Some(&hash)), AuthDecision::Allowed);
    }

    #[test]
    fn test_known_hash_value() {
        // Pin the cookie value format: hex(sha256(password)).
        assert_eq!(
            password_hash("letmein"),
            "1c8bfe8f801d79745c4631d09fff36c82aa37fc4cce4fc946683d7b336b63032"
        );
    }
}
