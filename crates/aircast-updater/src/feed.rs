//! Typed model of the update feed.
//!
//! A [`Feed`] is produced fresh by the parser on every check cycle and is
//! immutable afterwards. Entries keep document order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::host::HostEnvironment;
use crate::version::Version;

/// Signature algorithms the verifier accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    /// Ed25519 over the exact payload bytes
    Ed25519,
}

impl SignatureAlgorithm {
    /// Map a feed tag onto the accepted set (case-insensitive).
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "ed25519" => Some(Self::Ed25519),
            _ => None,
        }
    }

    /// The canonical tag.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
        }
    }
}

/// A detached signature as declared in the feed.
///
/// The algorithm tag is kept verbatim so that an unrecognized tag reaches the
/// verifier and is rejected there rather than being dropped silently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBlock {
    /// Algorithm tag as written in the feed
    pub algorithm: String,
    /// Decoded signature bytes
    pub bytes: Vec<u8>,
}

impl SignatureBlock {
    /// Create a signature block.
    pub fn new(algorithm: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            bytes,
        }
    }
}

/// One downloadable form of a release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadVariant {
    /// Absolute download URL
    pub url: String,
    /// Declared byte length (advisory until checked by the downloader)
    pub length: Option<u64>,
    /// Target platform ("linux-x86_64"); `None` means any
    pub platform: Option<String>,
    /// Lowest OS version this variant supports (inclusive)
    pub min_os_version: Option<Version>,
    /// Highest OS version this variant supports (inclusive)
    pub max_os_version: Option<Version>,
    /// Expected SHA-256 of the payload
    pub sha256: Option<[u8; 32]>,
    /// Detached signature over the payload
    pub signature: Option<SignatureBlock>,
    /// Base version when this variant is an incremental patch
    pub delta_from: Option<Version>,
    /// Payload is an encrypted container that needs a password
    pub encrypted: bool,
}

impl DownloadVariant {
    /// Create a full (non-delta, unencrypted) variant with no bounds.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            length: None,
            platform: None,
            min_os_version: None,
            max_os_version: None,
            sha256: None,
            signature: None,
            delta_from: None,
            encrypted: false,
        }
    }

    /// Whether this variant is an incremental patch.
    pub fn is_delta(&self) -> bool {
        self.delta_from.is_some()
    }

    /// Whether the declared platform and OS bounds admit the host.
    pub fn admits(&self, host: &HostEnvironment) -> bool {
        if let Some(platform) = &self.platform {
            if !platform.eq_ignore_ascii_case(&host.platform) {
                return false;
            }
        }
        if let Some(min) = &self.min_os_version {
            if host.os_version < *min {
                return false;
            }
        }
        if let Some(max) = &self.max_os_version {
            if host.os_version > *max {
                return false;
            }
        }
        true
    }
}

/// One release listed in the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    /// Release version
    pub version: Version,
    /// Human-readable title
    pub title: Option<String>,
    /// Link to release notes
    pub release_notes_url: Option<String>,
    /// Publication time
    pub published_at: Option<DateTime<Utc>>,
    /// Marked as a critical update by the publisher
    pub critical: bool,
    /// Download variants in document order (never empty)
    pub variants: Vec<DownloadVariant>,
}

impl FeedEntry {
    /// Create an entry with the given version and variants.
    pub fn new(version: impl Into<Version>, variants: Vec<DownloadVariant>) -> Self {
        Self {
            version: version.into(),
            title: None,
            release_notes_url: None,
            published_at: None,
            critical: false,
            variants,
        }
    }

    /// Whether any variant admits the host.
    pub fn admits(&self, host: &HostEnvironment) -> bool {
        self.variants.iter().any(|variant| variant.admits(host))
    }
}

/// The parsed update feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    /// Feed title
    pub title: Option<String>,
    /// Feed home link
    pub link: Option<String>,
    /// Entries in document order
    pub entries: Vec<FeedEntry>,
}

impl Feed {
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the feed has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
