//! Input validation and sanitization functions for meshwall
//!
//! Everything coming from the desired-state store passes through here before
//! it is used in a table, set or resource name.

use std::net::Ipv4Addr;

/// Longest DNS label, which bounds cluster IDs and policy names
const MAX_DNS_LABEL_LEN: usize = 63;
/// `IFNAMSIZ - 1`
const MAX_IFNAME_LEN: usize = 15;
const MAX_COMMENT_LEN: usize = 64;

/// Sanitizes free text before it becomes an nftables rule comment or part
/// of a condition message.
///
/// Keeps ASCII alphanumerics and ` -_.:`, drops everything else (quotes,
/// shell metacharacters, control characters) and truncates to 64 bytes.
///
/// # Examples
///
/// ```
/// use meshwall::validators::sanitize_label;
///
/// assert_eq!(sanitize_label("established/related"), "establishedrelated");
/// assert_eq!(sanitize_label("pods of \"remote\";\n"), "pods of remote");
/// ```
pub fn sanitize_label(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':'))
        .take(MAX_COMMENT_LEN)
        .collect()
}

/// Validates a network interface name as the kernel accepts it: at most
/// `IFNAMSIZ - 1` bytes of `[A-Za-z0-9._-]`, and neither `.` nor `..`.
///
/// # Errors
///
/// Returns `Err` naming the violated constraint.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }
    if name.len() > MAX_IFNAME_LEN {
        return Err(format!(
            "Interface name {name:?} too long (max {MAX_IFNAME_LEN} characters)"
        ));
    }
    if matches!(name, "." | "..") {
        return Err(format!("{name:?} is not a valid interface name"));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
    {
        return Err(format!("Interface name contains invalid character {bad:?}"));
    }

    Ok(name.to_string())
}

fn validate_dns_label(what: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{what} cannot be empty"));
    }

    if value.len() > MAX_DNS_LABEL_LEN {
        return Err(format!(
            "{what} too long (max {MAX_DNS_LABEL_LEN} characters)"
        ));
    }

    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!(
            "{what} may only contain lowercase letters, digits and '-'"
        ));
    }

    if value.starts_with('-') || value.ends_with('-') {
        return Err(format!("{what} must start and end with a letter or digit"));
    }

    Ok(())
}

/// Validates a remote cluster identifier.
///
/// Cluster IDs end up verbatim in resource, namespace and set names, so they
/// must be DNS labels: 1-63 lowercase alphanumerics or `-`, alphanumeric at
/// both ends.
///
/// # Errors
///
/// Returns `Err` describing the first violated constraint.
pub fn validate_cluster_id(id: &str) -> Result<(), String> {
    validate_dns_label("Cluster ID", id)
}

/// Validates a policy object name, which becomes part of a fabric table name.
///
/// # Errors
///
/// Returns `Err` describing the first violated constraint.
pub fn validate_policy_name(name: &str) -> Result<(), String> {
    validate_dns_label("Policy name", name)
}

/// Validates a namespace name or namespace prefix.
///
/// # Errors
///
/// Returns `Err` describing the first violated constraint.
pub fn validate_namespace(name: &str) -> Result<(), String> {
    validate_dns_label("Namespace", name)
}

/// Parses a pod IP as reported by the store.
///
/// Pods that have not been assigned an address yet report an empty string;
/// those and anything that is not IPv4 yield `None`.
pub fn parse_pod_ip(raw: &str) -> Option<Ipv4Addr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_label_keeps_rule_comments() {
        assert_eq!(sanitize_label("bypass non-tunnel"), "bypass non-tunnel");
        assert_eq!(sanitize_label("pod_ips_remote-a"), "pod_ips_remote-a");
        assert_eq!(sanitize_label("policy tenant-a:remote-a"), "policy tenant-a:remote-a");
    }

    #[test]
    fn test_sanitize_label_strips_injection() {
        assert_eq!(sanitize_label("accept\"; flush ruleset; \""), "accept flush ruleset ");
        assert_eq!(sanitize_label("remote\n\r\t\0a"), "remotea");
        assert_eq!(sanitize_label("$(reboot)`id`"), "rebootid");
        assert_eq!(sanitize_label(&"x".repeat(100)).len(), 64);
    }

    #[test]
    fn test_validate_interface() {
        let longest = "a".repeat(15);
        let too_long = "a".repeat(16);
        for ok in ["eth0", "liqo-tunnel", "br0.100", "wg_mesh", longest.as_str()] {
            assert!(validate_interface(ok).is_ok(), "{ok}");
        }
        for bad in ["", ".", "..", "eth0 ; rm -rf /", "tun/0", too_long.as_str()] {
            assert!(validate_interface(bad).is_err(), "{bad}");
        }
        assert_eq!(
            validate_interface("tun/0").unwrap_err(),
            "Interface name contains invalid character '/'"
        );
    }

    #[test]
    fn test_validate_cluster_id() {
        assert!(validate_cluster_id("remote-a").is_ok());
        assert!(validate_cluster_id("c1").is_ok());
        assert!(validate_cluster_id("7").is_ok());
        assert!(validate_cluster_id(&"a".repeat(63)).is_ok());

        assert!(validate_cluster_id("").is_err());
        assert!(validate_cluster_id(&"a".repeat(64)).is_err());
        assert!(validate_cluster_id("Remote").is_err());
        assert!(validate_cluster_id("remote_a").is_err());
        assert!(validate_cluster_id("remote.a").is_err());
        assert!(validate_cluster_id("-remote").is_err());
        assert!(validate_cluster_id("remote-").is_err());
    }

    #[test]
    fn test_validate_policy_name() {
        assert!(validate_policy_name("remote-a").is_ok());
        assert!(validate_policy_name("remote a").is_err());
    }

    #[test]
    fn test_parse_pod_ip() {
        assert_eq!(parse_pod_ip("10.0.0.7"), Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(parse_pod_ip(" 10.0.0.7 "), Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(parse_pod_ip(""), None);
        assert_eq!(parse_pod_ip("fd00::7"), None);
        assert_eq!(parse_pod_ip("pending"), None);
    }
}
