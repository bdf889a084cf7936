//! Normalization of URLs handed to the browser.

use url::Url;

use crate::error::{Error, Result};

/// Trim and default a missing scheme to https.
pub fn sanitize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Only absolute http(s) URLs with a host are accepted.
pub fn validate_url(raw: &str) -> Result<Url> {
    let parsed = Url::parse(raw).map_err(|e| Error::InvalidUrl(format!("{}: {}", raw, e)))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::InvalidUrl(format!(
                "scheme must be http or https, got {}",
                other
            )))
        }
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(Error::InvalidUrl("host is required".to_string()));
    }
    Ok(parsed)
}

pub fn normalize_url(raw: &str) -> Result<String> {
    let sanitized = sanitize_url(raw);
    validate_url(&sanitized)?;
    Ok(sanitized)
}
