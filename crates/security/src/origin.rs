//! Calling-page origins.

use std::fmt;
use url::Url;

/// Represents an origin (scheme, host, port tuple).
///
/// The port is only present when the page URL names a non-default port, so
/// `http://localhost:80` and `http://localhost` are the same origin.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Origin {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
}

impl Origin {
    /// Create a new origin from components.
    pub fn new(scheme: &str, host: &str, port: Option<u16>) -> Self {
        let scheme = scheme.to_lowercase();
        let port = port.filter(|p| Some(*p) != default_port(&scheme));
        Self {
            host: host.to_lowercase(),
            scheme,
            port,
        }
    }

    /// Derive the origin of a page location.
    ///
    /// Returns `None` for URLs without a tuple origin (`data:`, `file:`, ...).
    pub fn from_url(url: &Url) -> Option<Self> {
        let scheme = url.scheme().to_lowercase();

        if matches!(
            scheme.as_str(),
            "data" | "file" | "blob" | "javascript" | "about"
        ) {
            return None;
        }

        let host = url.host_str()?;
        if host.is_empty() {
            return None;
        }

        Some(Self::new(&scheme, host, url.port()))
    }

    /// Parse an origin from a string URL or `scheme://host[:port]` pattern.
    pub fn parse(url_str: &str) -> Option<Self> {
        let url = Url::parse(url_str.trim()).ok()?;
        Self::from_url(&url)
    }

    /// Get the effective port (using default ports for known schemes).
    pub fn effective_port(&self) -> u16 {
        self.port
            .or_else(|| default_port(&self.scheme))
            .unwrap_or(0)
    }

    /// Check if the origin was served over a secure transport.
    pub fn is_secure(&self) -> bool {
        matches!(self.scheme.as_str(), "https" | "wss")
    }

    /// Serialize the origin to a string.
    pub fn serialize(&self) -> String {
        self.to_string()
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        "ftp" => Some(21),
        _ => None,
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}://{}:{}", self.scheme, self.host, port),
            None => write!(f, "{}://{}", self.scheme, self.host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_from_url() {
        let origin = Origin::parse("https://example.com/path?q=1").unwrap();
        assert_eq!(origin.scheme, "https");
        assert_eq!(origin.host, "example.com");
        assert_eq!(origin.port, None);
        assert_eq!(origin.effective_port(), 443);
        assert_eq!(origin.serialize(), "https://example.com");
    }

    #[test]
    fn test_origin_case_insensitive() {
        let a = Origin::parse("HTTP://LocalHost:8080/index.html").unwrap();
        let b = Origin::parse("http://localhost:8080").unwrap();
        assert_eq!(a, b);
        assert_eq!(Origin::new("HTTP", "LOCALHOST", Some(8080)), b);
    }

    #[test]
    fn test_origin_components_must_all_match() {
        let base = Origin::parse("http://example.com").unwrap();
        assert_ne!(base, Origin::parse("https://example.com").unwrap());
        assert_ne!(base, Origin::parse("http://other.com").unwrap());
        assert_ne!(base, Origin::parse("http://example.com:8080").unwrap());
    }

    #[test]
    fn test_origin_default_port_dropped() {
        let explicit = Origin::parse("http://localhost:80/").unwrap();
        let implicit = Origin::parse("http://localhost/").unwrap();
        assert_eq!(explicit, implicit);
        assert_eq!(Origin::new("https", "a.com", Some(443)).to_string(), "https://a.com");
        assert_eq!(Origin::parse("http://a.com:8080").unwrap().to_string(), "http://a.com:8080");
    }

    #[test]
    fn test_opaque_urls_have_no_origin() {
        assert!(Origin::parse("data:text/html,hello").is_none());
        assert!(Origin::parse("file:///tmp/page.html").is_none());
        assert!(Origin::parse("about:blank").is_none());
        assert!(Origin::parse("not a url").is_none());
    }
}
