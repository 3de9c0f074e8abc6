use std::net::IpAddr;

use super::ProxyError;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Lowercases, strips a trailing dot and checks label syntax.
///
/// # Errors
/// Returns `InvalidDomain` describing the first problem found.
pub fn normalize(raw: &str) -> Result<String, ProxyError> {
    let name = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    let invalid = |reason: &str| ProxyError::InvalidDomain(format!("{raw}: {reason}"));

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_DOMAIN_LEN {
        return Err(invalid("longer than 253 characters"));
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return Err(invalid("needs at least two labels"));
    }
    for label in labels {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(invalid("labels must be 1-63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("labels cannot start or end with '-'"));
        }
        if !label
            .chars()
            .all(|character| character.is_ascii_lowercase() || character.is_ascii_digit() || character == '-')
        {
            return Err(invalid("labels may only contain a-z, 0-9 and '-'"));
        }
    }

    Ok(name)
}

/// Checks that `name` resolves to one of `allowed_ips`. An empty allow list
/// disables the check.
///
/// # Errors
/// Returns `InvalidDomain` when the name does not resolve or points elsewhere.
pub async fn ensure_points_here(name: &str, allowed_ips: &[String]) -> Result<(), ProxyError> {
    if allowed_ips.is_empty() {
        return Ok(());
    }
    let allowed: Vec<IpAddr> = allowed_ips.iter().filter_map(|ip| ip.parse().ok()).collect();

    let resolved = tokio::net::lookup_host((name, 443))
        .await
        .map_err(|error| ProxyError::InvalidDomain(format!("{name} does not resolve: {error}")))?;
    for address in resolved {
        if allowed.contains(&address.ip()) {
            return Ok(());
        }
    }

    Err(ProxyError::InvalidDomain(format!(
        "{name} does not point at this server"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_trailing_dot() {
        assert_eq!(normalize("API.Example.COM.").expect("valid"), "api.example.com");
    }

    #[test]
    fn rejects_bad_names() {
        for name in ["", "localhost", "-api.example.com", "api-.example.com", "a..b", "api_1.example.com", "ex ample.com"] {
            assert!(normalize(name).is_err(), "{name} should be rejected");
        }
        let long_label = format!("{}.com", "a".repeat(64));
        assert!(normalize(&long_label).is_err());
    }

    #[tokio::test]
    async fn empty_allow_list_skips_resolution() {
        ensure_points_here("does-not-exist.invalid", &[]).await.expect("skipped");
    }

    #[tokio::test]
    async fn localhost_names_resolve_against_loopback() {
        ensure_points_here("localhost", &["127.0.0.1".to_string(), "::1".to_string()])
            .await
            .expect("loopback");
    }
}
