//! Redaction of presigned URLs in service responses
//!
//! Error bodies from the cache service can embed time-limited presigned
//! links. Every URL path is replaced before a body reaches logs or error
//! messages, keeping only the scheme and host for debugging.

use regex::Regex;
use std::sync::LazyLock;

/// Placeholder substituted for a URL's path and query.
pub const REDACTED_PATH: &str = "*****";

static URL_PATH: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r#"(https?://[^/\s"'<>]+)/[^\s"'<>]*"#).expect("static regex must compile")
});

/// Replace the path of every URL in `input` with `*****`, preserving the
/// scheme and host.
#[must_use]
pub fn redact_urls(input: &str) -> String {
    URL_PATH
        .replace_all(input, format!("$1/{REDACTED_PATH}"))
        .into_owned()
}
