use std::net::IpAddr;
use url::Url;

/// Validates an upstream URL for SSRF before a connector ever opens a
/// transport to it. In production, private/loopback/link-local addresses
/// and `.local` hostnames are rejected; `dev_mode` lifts that restriction
/// for local development against upstreams on the same host.
pub fn validate_upstream_url(raw: &str, dev_mode: bool) -> Result<(), String> {
    let parsed = Url::parse(raw).map_err(|e| format!("invalid URL: {e}"))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme \"{other}\", only http/https allowed")),
    }

    if dev_mode {
        return Ok(());
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| "URL has no host".to_string())?;

    if host.ends_with(".local") {
        return Err(format!("\".local\" hostnames are rejected outside dev mode: {host}"));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_disallowed_ip(ip) {
            return Err(format!("private/loopback/link-local address rejected: {ip}"));
        }
    }

    Ok(())
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00 // unique local fc00::/7
                || (v6.segments()[0] & 0xffc0) == 0xfe80 // link-local fe80::/10
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_schemes() {
        assert!(validate_upstream_url("ftp://example.com", false).is_err());
    }

    #[test]
    fn rejects_private_and_loopback_in_production() {
        assert!(validate_upstream_url("http://127.0.0.1:8080", false).is_err());
        assert!(validate_upstream_url("http://192.168.1.5", false).is_err());
        assert!(validate_upstream_url("http://my-box.local", false).is_err());
    }

    #[test]
    fn allows_private_addresses_in_dev_mode() {
        assert!(validate_upstream_url("http://127.0.0.1:8080", true).is_ok());
    }

    #[test]
    fn allows_public_https_in_production() {
        assert!(validate_upstream_url("https://api.example.com/mcp", false).is_ok());
    }
}
