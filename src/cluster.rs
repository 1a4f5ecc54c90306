//! Cluster URL normalization and `--mapping` parsing.
//!
//! A normalized cluster URL is the only key used to identify an endpoint
//! anywhere in the router: lower-cased, trimmed, trailing slashes removed,
//! with `https://` prepended when no scheme is given. Normalization is
//! idempotent, so values can be re-normalized freely at trust boundaries.

use thiserror::Error;

/// Error produced while parsing a `--mapping` value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    /// The URL half of the mapping was empty (e.g. `=/some/identity`).
    #[error("mapping {0:?} has an empty cluster URL")]
    EmptyUrl(String),
}

/// Normalize a cluster URL into its canonical form.
///
/// - surrounding whitespace is trimmed
/// - the whole URL is lower-cased
/// - `https://` is prepended unless an `http://` or `https://` scheme is
///   already present (an explicit `http://` is preserved)
/// - trailing slashes are removed
pub fn normalize_cluster_url(raw: &str) -> String {
    let mut url = raw.trim().to_ascii_lowercase();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        url.insert_str(0, "https://");
    }
    while url.ends_with('/') {
        url.pop();
    }
    url
}

/// One operator-supplied cluster mapping: a normalized URL plus an opaque
/// identity hint forwarded to the downstream child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMapping {
    /// Normalized cluster URL (the endpoint key).
    pub url: String,
    /// Managed-identity client id or resource id; may be empty.
    pub identity: String,
}

impl ClusterMapping {
    /// Parse a `--mapping` value of the form `URL` or `URL=IDENTITY`.
    ///
    /// The split happens at the *first* `=`; everything after it (further
    /// `=` included) belongs to the identity. A missing identity yields an
    /// empty string.
    pub fn parse(input: &str) -> Result<Self, MappingError> {
        let (url_part, identity) = match input.split_once('=') {
            Some((url, identity)) => (url, identity),
            None => (input, ""),
        };

        if url_part.trim().is_empty() {
            return Err(MappingError::EmptyUrl(input.to_string()));
        }

        Ok(Self {
            url: normalize_cluster_url(url_part),
            identity: identity.to_string(),
        })
    }
}

/// Drop mappings whose normalized URL duplicates an earlier one.
///
/// The first occurrence wins; later duplicates are logged and discarded.
pub fn dedupe_mappings(mappings: &[ClusterMapping]) -> Vec<ClusterMapping> {
    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::with_capacity(mappings.len());

    for mapping in mappings {
        if seen.insert(mapping.url.clone()) {
            unique.push(mapping.clone());
        } else {
            tracing::warn!(cluster = %mapping.url, "duplicate cluster mapping ignored");
        }
    }

    unique
}
