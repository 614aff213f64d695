//! # aircast-updater
//!
//! Update acquisition and verification pipeline for Aircast desktop builds.
//!
//! This crate handles:
//! - Version parsing and ordering for free-form version strings
//! - Feed parsing, tolerant of unknown fields and single bad entries
//! - Candidate selection against the host platform and OS version
//! - Payload download with resume, bounded retry and cancellation
//! - Ed25519 signature and SHA-256 verification of downloaded bytes
//! - Decryption of encrypted payload containers after verification
//! - Handoff of the verified payload to an external installer
//!
//! ## Security
//!
//! No payload reaches the installer unless its signature verifies against a
//! pinned key, or the operator explicitly set `security.allow_unsigned`.
//! Verification always runs over the exact downloaded bytes, before any
//! decryption.
//!
//! ## Feed format
//!
//! ```json
//! {
//!   "title": "Aircast",
//!   "link": "https://aircast.example.com",
//!   "entries": [
//!     {
//!       "version": "2.1.0",
//!       "title": "Aircast 2.1",
//!       "release_notes_url": "https://aircast.example.com/notes/2.1.0",
//!       "published_at": "2024-05-17T12:00:00Z",
//!       "critical": false,
//!       "variants": [
//!         {
//!           "url": "https://dl.example.com/aircast-2.1.0-linux-x86_64.tar.gz",
//!           "length": 48213,
//!           "platform": "linux-x86_64",
//!           "min_os_version": "5.4",
//!           "sha256": "<hex>",
//!           "signature": { "algorithm": "ed25519", "value": "<base64>" }
//!         }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Variants may also carry `max_os_version`, `delta_from` (base version of an
//! incremental patch) and `encrypted`.

pub mod config;
pub mod decrypt;
pub mod download;
pub mod driver;
pub mod error;
pub mod events;
pub mod feed;
pub mod handoff;
pub mod hooks;
pub mod host;
pub mod parser;
#[cfg(test)]
mod proptests;
pub mod selector;
#[cfg(test)]
mod testing;
pub mod transport;
pub mod verify;
pub mod version;

// Re-export main types for convenience
pub use config::{LoggingConfig, NetworkConfig, SecurityConfig, UpdaterConfig};
pub use download::{DownloadProgress, Downloader, DownloaderConfig, ProgressCallback, RetryPolicy};
pub use driver::{CycleHandle, CycleOutcome, UpdateDriver, UpdateDriverBuilder, UpdatePhase};
pub use error::{
    DecryptionError, DownloadError, ParseError, SelectionError, TransportError, UpdateError,
    VerificationError,
};
pub use events::{NoUpdateReason, UpdateEvent, UpdateObserver};
pub use feed::{DownloadVariant, Feed, FeedEntry, SignatureAlgorithm, SignatureBlock};
pub use handoff::{InstallManifest, InstallerHandoff, StagingInstaller, VerifiedPayload};
pub use hooks::{HandoffContinuation, PolicyHooks};
pub use host::{current_platform, HostEnvironment};
pub use parser::{FeedParser, ParseReport};
pub use selector::{Candidate, CandidateSelector};
pub use transport::{FeedFetcher, HttpTransport, ReqwestTransport, TransportConfig};
pub use verify::{TrustVerifier, UnsignedPolicy};
pub use version::{StandardVersionComparator, Version, VersionComparator};
