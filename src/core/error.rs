use thiserror::Error;

/// Core error types for meshwall
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An upstream object is malformed (missing label, bad cluster ID, ...)
    #[error("Invalid input in {field}: {message}")]
    InvalidInput { field: String, message: String },

    /// Required topology data (remote CIDR, policy name) is absent
    #[error("Missing topology: {0}")]
    MissingTopology(String),

    /// Ingress policy mode outside {Allow, Isolate, Deny}
    #[error("Invalid ingress policy mode: {0:?}")]
    InvalidPolicyMode(String),

    /// A match predicate that cannot be expressed as an nftables expression
    #[error("Unsupported match: {0}")]
    UnsupportedMatch(String),

    /// Packet filter or desired-state store call failed
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Fetch or apply was cancelled or exceeded its deadline
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

/// Coarse classification driving retry and reporting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Skipped until the upstream object is fixed; surfaced as a condition
    InvalidInput,
    /// Programming/contract violation; compilation aborted for the target
    Contract,
    /// Retriable; the target stays unconverged
    Transport,
}

impl Error {
    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            stderr: None,
            exit_code: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput { .. } | Error::MissingTopology(_) => ErrorKind::InvalidInput,
            Error::InvalidPolicyMode(_) | Error::UnsupportedMatch(_) | Error::Serialization(_) => {
                ErrorKind::Contract
            }
            Error::Io(_) | Error::Transport { .. } | Error::Cancelled(_) => ErrorKind::Transport,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

/// Turns raw `nft` stderr into a short operator hint.
pub fn translate_transport_error(stderr: &str) -> String {
    let lower = stderr.to_lowercase();

    if lower.contains("permission denied") || lower.contains("operation not permitted") {
        return "insufficient privileges to program nftables (CAP_NET_ADMIN required)".to_string();
    }
    // kernel ENOENT: a missing binary fails at spawn and never gets here
    if lower.contains("no such file")
        || lower.contains("could not process rule")
        || lower.contains("does not exist")
    {
        return "referenced table, chain or set does not exist".to_string();
    }
    if lower.contains("command not found") {
        return "nft binary not found; install nftables or set MESHWALL_NFT_COMMAND".to_string();
    }
    if lower.contains("resource busy") {
        return "nftables resource busy; another process is modifying the ruleset".to_string();
    }
    if lower.contains("netlink") {
        return "kernel netlink interface error; is nf_tables loaded?".to_string();
    }

    let first = stderr.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    format!("nft failed: {}", first.trim().trim_start_matches("Error: "))
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::invalid_input("labels", "missing").kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            Error::MissingTopology("remote pod CIDR".into()).kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            Error::InvalidPolicyMode("Open".into()).kind(),
            ErrorKind::Contract
        );
        assert_eq!(
            Error::UnsupportedMatch("empty ct state".into()).kind(),
            ErrorKind::Contract
        );
        assert!(Error::transport("apply failed").is_retriable());
        assert!(Error::Cancelled("timeout".into()).is_retriable());
        assert!(!Error::UnsupportedMatch("x".into()).is_retriable());
    }

    #[test]
    fn test_translate_permission_error() {
        let hint = translate_transport_error("Error: Operation not permitted");
        assert!(hint.contains("CAP_NET_ADMIN"));
    }

    #[test]
    fn test_translate_missing_object() {
        for stderr in [
            "Error: Could not process rule: No such file or directory\nflush set ip cluster-security source_pod_ips\n",
            "Error: No such file or directory; did you mean table 'filter' in family ip?",
            "Error: table ip cluster-security does not exist",
        ] {
            let hint = translate_transport_error(stderr);
            assert_eq!(hint, "referenced table, chain or set does not exist", "{stderr}");
        }
    }

    #[test]
    fn test_translate_wrapper_command_not_found() {
        let hint = translate_transport_error("sudo: nft: command not found");
        assert!(hint.contains("nft binary not found"));
    }

    #[test]
    fn test_translate_fallback_uses_first_line() {
        let hint = translate_transport_error("\nError: syntax error, unexpected junk\nmore");
        assert_eq!(hint, "nft failed: syntax error, unexpected junk");
    }
}
