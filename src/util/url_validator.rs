use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Reasons a subscription URL is refused.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    #[error("Localhost not allowed")]
    Localhost,
}

/// Check a feed URL before it is saved as a subscription.
///
/// The URL must parse, use `http` or `https` and name a host. Unless
/// `allow_private_hosts` is set, localhost, loopback and private/link-local
/// addresses are refused as well (SEC-001: SSRF).
pub fn validate_feed_url(
    url_str: &str,
    allow_private_hosts: bool,
) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host,
        _ => return Err(UrlValidationError::MissingHost),
    };

    if allow_private_hosts {
        return Ok(url);
    }

    if host.eq_ignore_ascii_case("localhost") {
        return Err(UrlValidationError::Localhost);
    }

    // IPv6 hosts come back bracketed
    let bare_host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if let Ok(ip) = bare_host.parse::<IpAddr>() {
        if ip.is_loopback() {
            return Err(UrlValidationError::Localhost);
        }
        if is_private_ip(&ip) {
            return Err(UrlValidationError::PrivateIp(ip.to_string()));
        }
    }

    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_feed_urls_accepted() {
        let url = validate_feed_url("https://example.com/feed.xml", false).unwrap();
        assert_eq!(url.host_str(), Some("example.com"));
        assert!(validate_feed_url("http://news.example.org:8080/rss", false).is_ok());
        assert!(validate_feed_url("  https://example.com/padded  ", false).is_ok());
    }

    #[test]
    fn test_non_http_schemes_rejected() {
        assert!(matches!(
            validate_feed_url("file:///etc/passwd", false),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
        assert!(validate_feed_url("ftp://example.com/feed", true).is_err());
    }

    #[test]
    fn test_unparsable_rejected() {
        assert!(matches!(
            validate_feed_url("not a url", false),
            Err(UrlValidationError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_local_hosts_rejected_by_default() {
        for url in [
            "http://localhost/feed",
            "http://LOCALHOST/feed",
            "http://127.0.0.1/feed",
            "http://[::1]/feed",
        ] {
            assert!(
                matches!(validate_feed_url(url, false), Err(UrlValidationError::Localhost)),
                "{}",
                url
            );
        }
    }

    #[test]
    fn test_private_ranges_rejected_by_default() {
        for url in [
            "http://192.168.1.1/feed",
            "http://10.0.0.1:3000/feed",
            "http://172.16.0.1/feed",
            "http://169.254.1.1/feed",
            "http://0.0.0.0/feed",
            "http://[fe80::1]/feed",
            "http://[fd00::1]/feed",
        ] {
            assert!(validate_feed_url(url, false).is_err(), "{}", url);
        }
    }

    #[test]
    fn test_private_hosts_allowed_when_opted_in() {
        assert!(validate_feed_url("http://127.0.0.1:8080/feed", true).is_ok());
        assert!(validate_feed_url("http://localhost/feed", true).is_ok());
        assert!(validate_feed_url("http://192.168.1.1/feed", true).is_ok());
    }
}
