//! Create-task input validation: URL scheme checks and the SSRF-blocked
//! callback host list (§4.3.1).

const BLOCKED_CALLBACK_HOSTS: &[&str] = &["169.254.169.254", "localhost", "127.0.0.1", "::1", "0.0.0.0"];

/// `repo.url` must match `^https://`.
pub fn validate_repo_url(url: &str) -> Result<(), String> {
    if !url.starts_with("https://") {
        return Err("repo.url must use https".to_string());
    }
    Ok(())
}

/// `callback.url` must match `^https?://` and not point at a blocked host.
pub fn validate_callback_url(url: &str) -> Result<(), String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| "callbackUrl must use http or https".to_string())?;

    let host = extract_host(rest);
    if BLOCKED_CALLBACK_HOSTS.contains(&host.as_str()) {
        return Err("blocked host".to_string());
    }
    Ok(())
}

/// Pulls the host (no port, no userinfo, no path) out of a URL's remainder
/// after the scheme has been stripped.
fn extract_host(rest: &str) -> String {
    let without_path = rest.split('/').next().unwrap_or(rest);
    let without_userinfo = without_path.rsplit_once('@').map(|(_, h)| h).unwrap_or(without_path);
    if without_userinfo.starts_with('[') {
        // IPv6 literal: "[::1]:8080" -> "::1"
        without_userinfo
            .split_once(']')
            .map(|(h, _)| h.trim_start_matches('['))
            .unwrap_or(without_userinfo)
            .to_string()
    } else {
        without_userinfo
            .split_once(':')
            .map(|(h, _)| h)
            .unwrap_or(without_userinfo)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_https_repo_url() {
        assert!(validate_repo_url("https://github.com/acme/widget.git").is_ok());
    }

    #[test]
    fn rejects_non_https_repo_url() {
        assert!(validate_repo_url("http://github.com/acme/widget.git").is_err());
    }

    #[test]
    fn accepts_normal_callback_url() {
        assert!(validate_callback_url("https://adapter.example/cb").is_ok());
    }

    #[test]
    fn rejects_link_local_metadata_host() {
        assert!(validate_callback_url("http://169.254.169.254/latest").is_err());
    }

    #[test]
    fn rejects_localhost_variants() {
        assert!(validate_callback_url("http://localhost:8080/cb").is_err());
        assert!(validate_callback_url("http://127.0.0.1/cb").is_err());
        assert!(validate_callback_url("http://[::1]/cb").is_err());
    }

    #[test]
    fn rejects_non_http_scheme() {
        assert!(validate_callback_url("ftp://adapter.example/cb").is_err());
    }
}
