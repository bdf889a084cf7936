//! Capture manifests and the builder that hashes them.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::canonical::canonicalize;
use super::hash::sha256_hex;
use crate::error::Result;

pub const BROWSER_NAME: &str = "chromium";
pub const DEFAULT_VISIBILITY: &str = "public";
pub const UNKNOWN_VERSION: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Browser {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHashes {
    pub screenshot_sha256: String,
    pub dom_sha256: String,
}

/// Descriptor of one capture. Built once, never modified; the manifest's own
/// digest is kept outside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    capture_id: String,
    url: String,
    final_url: String,
    #[serde(with = "timestamp")]
    captured_at_utc: DateTime<Utc>,
    browser: Browser,
    viewport: Viewport,
    hashes: ArtifactHashes,
    visibility: String,
}

impl Manifest {
    pub fn capture_id(&self) -> &str {
        &self.capture_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn final_url(&self) -> &str {
        &self.final_url
    }

    pub fn captured_at_utc(&self) -> DateTime<Utc> {
        self.captured_at_utc
    }

    pub fn browser(&self) -> &Browser {
        &self.browser
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn hashes(&self) -> &ArtifactHashes {
        &self.hashes
    }

    pub fn visibility(&self) -> &str {
        &self.visibility
    }
}

#[derive(Debug, Clone)]
pub struct BuildInput<'a> {
    pub capture_id: String,
    pub url: String,
    pub final_url: String,
    pub captured_at_utc: DateTime<Utc>,
    pub browser_name: String,
    pub browser_version: String,
    pub viewport: Viewport,
    pub screenshot: &'a [u8],
    pub dom: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub manifest: Manifest,
    /// Canonical encoding of `manifest`; `manifest_hash` is its digest.
    pub canonical: Vec<u8>,
    pub screenshot_hash: String,
    pub dom_hash: String,
    pub manifest_hash: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestBuilder;

impl ManifestBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, input: BuildInput<'_>) -> Result<BuildOutput> {
        let screenshot_hash = sha256_hex(input.screenshot);
        let dom_hash = sha256_hex(input.dom);

        let manifest = Manifest {
            capture_id: input.capture_id,
            url: input.url,
            final_url: input.final_url,
            captured_at_utc: input.captured_at_utc,
            browser: Browser {
                name: input.browser_name,
                version: input.browser_version,
            },
            viewport: input.viewport,
            hashes: ArtifactHashes {
                screenshot_sha256: screenshot_hash.clone(),
                dom_sha256: dom_hash.clone(),
            },
            visibility: DEFAULT_VISIBILITY.to_string(),
        };

        let canonical = canonicalize(&manifest)?;
        let manifest_hash = sha256_hex(&canonical);

        Ok(BuildOutput {
            manifest,
            canonical,
            screenshot_hash,
            dom_hash,
            manifest_hash,
        })
    }
}

/// RFC 3339 in UTC with the fractional second trimmed of trailing zeros
/// (`2024-05-01T12:30:00.5Z`, `2024-05-01T12:30:00Z`).
pub mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn format(ts: &DateTime<Utc>) -> String {
        let whole = ts.format("%Y-%m-%dT%H:%M:%S");
        let nanos = ts.timestamp_subsec_nanos() % 1_000_000_000;
        if nanos == 0 {
            return format!("{}Z", whole);
        }
        let fraction = format!("{:09}", nanos);
        format!("{}.{}Z", whole, fraction.trim_end_matches('0'))
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Chrome/(\d+\.\d+\.\d+\.\d+)").expect("static pattern"))
}

/// `Chrome/<a.b.c.d>` from a user agent, or `"unknown"`.
pub fn browser_version(user_agent: &str) -> String {
    version_pattern()
        .captures(user_agent)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| UNKNOWN_VERSION.to_string())
}
