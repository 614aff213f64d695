//! Feed document parser.
//!
//! The feed is a JSON document (see the crate docs for the schema). Parsing
//! is two-level: the document envelope must be well-formed or the whole feed
//! is rejected, while each entry is decoded independently so that one bad
//! entry is dropped without poisoning the rest.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ParseError;
use crate::feed::{DownloadVariant, Feed, FeedEntry, SignatureBlock};
use crate::version::Version;

/// Envelope of the feed document. Unknown members are ignored.
#[derive(Debug, Deserialize)]
struct RawFeed {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    entries: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    release_notes_url: Option<String>,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    critical: bool,
    #[serde(default)]
    variants: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawVariant {
    url: String,
    #[serde(default)]
    length: Option<u64>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    min_os_version: Option<String>,
    #[serde(default)]
    max_os_version: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    signature: Option<RawSignature>,
    #[serde(default)]
    delta_from: Option<String>,
    #[serde(default)]
    encrypted: bool,
}

#[derive(Debug, Deserialize)]
struct RawSignature {
    algorithm: String,
    value: String,
}

/// Result of parsing a feed: the surviving entries plus what was dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseReport {
    /// The parsed feed
    pub feed: Feed,
    /// One [`ParseError::IncompleteEntry`] per dropped entry
    pub dropped: Vec<ParseError>,
}

/// Turns raw feed bytes into a [`Feed`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedParser;

impl FeedParser {
    /// Create a parser.
    pub fn new() -> Self {
        Self
    }

    /// Parse a feed document, logging and discarding dropped entries.
    pub fn parse(&self, document: &[u8]) -> Result<Feed, ParseError> {
        let report = self.parse_with_report(document)?;
        for dropped in &report.dropped {
            warn!(error = %dropped, "Dropped feed entry");
        }
        Ok(report.feed)
    }

    /// Parse a feed document and report every dropped entry.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Malformed`] if the document is not valid JSON,
    /// its root is not an object, or `entries` is not an array.
    pub fn parse_with_report(&self, document: &[u8]) -> Result<ParseReport, ParseError> {
        let root: Value =
            serde_json::from_slice(document).map_err(|e| ParseError::Malformed(e.to_string()))?;
        if !root.is_object() {
            return Err(ParseError::Malformed(
                "feed root must be an object".to_string(),
            ));
        }
        let raw: RawFeed =
            serde_json::from_value(root).map_err(|e| ParseError::Malformed(e.to_string()))?;

        let mut entries = Vec::new();
        let mut dropped = Vec::new();
        for (index, value) in raw.entries.unwrap_or_default().into_iter().enumerate() {
            match parse_entry(value) {
                Ok(entry) => entries.push(entry),
                Err(reason) => dropped.push(ParseError::IncompleteEntry { index, reason }),
            }
        }

        debug!(
            entries = entries.len(),
            dropped = dropped.len(),
            "Parsed feed document"
        );

        Ok(ParseReport {
            feed: Feed {
                title: raw.title,
                link: raw.link,
                entries,
            },
            dropped,
        })
    }
}

fn parse_entry(value: Value) -> Result<FeedEntry, String> {
    if !value.is_object() {
        return Err("entry is not an object".to_string());
    }
    let raw: RawEntry = serde_json::from_value(value).map_err(|e| e.to_string())?;

    let version = match raw.version.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Version::parse(v),
        _ => return Err("missing version".to_string()),
    };

    let mut variants = Vec::with_capacity(raw.variants.len());
    for (index, value) in raw.variants.into_iter().enumerate() {
        match parse_variant(value) {
            Ok(variant) => variants.push(variant),
            Err(reason) => {
                debug!(version = %version, index, reason = %reason, "Dropped download variant");
            }
        }
    }
    if variants.is_empty() {
        return Err(format!("no usable download variant for version {}", version));
    }

    let published_at = raw.published_at.as_deref().and_then(|ts| {
        DateTime::parse_from_rfc3339(ts)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| debug!(version = %version, error = %e, "Ignoring unparsable timestamp"))
            .ok()
    });

    Ok(FeedEntry {
        version,
        title: raw.title,
        release_notes_url: raw.release_notes_url,
        published_at,
        critical: raw.critical,
        variants,
    })
}

fn parse_variant(value: Value) -> Result<DownloadVariant, String> {
    let raw: RawVariant = serde_json::from_value(value).map_err(|e| e.to_string())?;

    let url = url::Url::parse(raw.url.trim()).map_err(|e| format!("invalid url: {}", e))?;

    let sha256 = raw
        .sha256
        .as_deref()
        .map(|hex_str| {
            let bytes = hex::decode(hex_str.trim()).map_err(|e| format!("invalid sha256: {}", e))?;
            <[u8; 32]>::try_from(bytes).map_err(|_| "sha256 must be 32 bytes".to_string())
        })
        .transpose()?;

    let signature = raw
        .signature
        .map(|sig| {
            let bytes = BASE64
                .decode(sig.value.trim())
                .map_err(|e| format!("invalid signature encoding: {}", e))?;
            Ok::<_, String>(SignatureBlock::new(sig.algorithm, bytes))
        })
        .transpose()?;

    Ok(DownloadVariant {
        url: url.to_string(),
        length: raw.length,
        platform: raw.platform,
        min_os_version: raw.min_os_version.as_deref().map(Version::parse),
        max_os_version: raw.max_os_version.as_deref().map(Version::parse),
        sha256,
        signature,
        delta_from: raw.delta_from.as_deref().map(Version::parse),
        encrypted: raw.encrypted,
    })
}
