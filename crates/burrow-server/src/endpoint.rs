//! Endpoint identifiers and host-name handling
//!
//! Registry keys and public hosts both go through [`normalize`], so the
//! router and the registry can never disagree about what a label means.

use uuid::Uuid;

/// Maximum length of a DNS label
pub const MAX_LABEL_LEN: usize = 63;

/// Canonical form of a host name or endpoint label: one trailing dot
/// removed, ASCII-lowercased
pub fn normalize(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase()
}

/// Validate endpoint format (a single DNS label: alphanumerics and hyphens)
pub fn is_valid_endpoint_id(id: &str) -> bool {
    if id.is_empty() || id.len() > MAX_LABEL_LEN {
        return false;
    }

    // Must start and end with alphanumeric
    if id.starts_with('-') || id.ends_with('-') {
        return false;
    }

    id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Generate a random endpoint id (8 chars, first char always a letter)
pub fn generate_endpoint_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    let first = match id.as_bytes()[0] {
        // Map 0-9 to a-j
        digit @ b'0'..=b'9' => char::from(b'a' + (digit - b'0')),
        other => char::from(other),
    };
    format!("{}{}", first, &id[1..8])
}

/// Generate a request id: 128 random bits, hex encoded
pub fn generate_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Derive the endpoint id from a `Host` value under `root_domain`
///
/// The port is ignored and the comparison is case-insensitive. Returns `None`
/// when the host is not strictly below the root domain or when the part in
/// front of it is not a single valid label.
pub fn endpoint_from_host(host: &str, root_domain: &str) -> Option<String> {
    // IP literals never carry an endpoint
    if host.starts_with('[') {
        return None;
    }

    let hostname = normalize(host.split(':').next()?);
    let root = normalize(root_domain.trim_start_matches('.'));
    if root.is_empty() {
        return None;
    }

    let label = hostname.strip_suffix(&root)?.strip_suffix('.')?;

    if is_valid_endpoint_id(label) {
        Some(label.to_string())
    } else {
        None
    }
}
