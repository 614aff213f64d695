//! Typed cycle notifications.
//!
//! One event is emitted per major transition of a check cycle. Observers are
//! passive: they cannot influence the cycle, and any number may be attached.

use std::fmt;
use std::sync::Arc;

use crate::error::UpdateError;
use crate::feed::{Feed, FeedEntry};

/// A notification emitted by the update driver.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// The feed was fetched and parsed
    FeedLoaded(Arc<Feed>),
    /// A newer applicable entry was selected
    ValidUpdateFound(FeedEntry),
    /// Nothing to install; `reason` says why
    NoUpdateFound { reason: NoUpdateReason },
    /// The payload download is about to start
    WillDownload(FeedEntry),
    /// The payload download failed terminally
    DownloadFailed {
        entry: FeedEntry,
        error: Arc<UpdateError>,
    },
    /// The verified payload is about to be handed to the installer
    WillInstall(FeedEntry),
    /// The cycle failed; carries the originating error
    Aborted(Arc<UpdateError>),
    /// The cycle was cancelled
    Cancelled,
}

impl UpdateEvent {
    /// Short stable name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FeedLoaded(_) => "feed-loaded",
            Self::ValidUpdateFound(_) => "valid-update-found",
            Self::NoUpdateFound { .. } => "no-update-found",
            Self::WillDownload(_) => "will-download",
            Self::DownloadFailed { .. } => "download-failed",
            Self::WillInstall(_) => "will-install",
            Self::Aborted(_) => "aborted",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Why a cycle found nothing to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoUpdateReason {
    /// No entry is newer than the running version and applicable to the host
    UpToDate,
    /// The candidate override picked an entry that fails the filters
    InvalidOverride { version: String, reason: String },
}

impl fmt::Display for NoUpdateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate => write!(f, "up to date"),
            Self::InvalidOverride { version, reason } => {
                write!(f, "override candidate {} rejected: {}", version, reason)
            }
        }
    }
}

/// Receives cycle events.
pub trait UpdateObserver: Send + Sync {
    /// Called synchronously on the cycle task; keep it short.
    fn on_event(&self, event: &UpdateEvent);
}

impl<F> UpdateObserver for F
where
    F: Fn(&UpdateEvent) + Send + Sync,
{
    fn on_event(&self, event: &UpdateEvent) {
        self(event)
    }
}

/// Fan-out to every registered observer.
#[derive(Clone, Default)]
pub(crate) struct Observers {
    observers: Vec<Arc<dyn UpdateObserver>>,
}

impl Observers {
    pub(crate) fn push(&mut self, observer: Arc<dyn UpdateObserver>) {
        self.observers.push(observer);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.observers.len()
    }

    pub(crate) fn emit(&self, event: UpdateEvent) {
        tracing::debug!(event = event.name(), observers = self.observers.len(), "Emitting event");
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.observers.len())
            .finish()
    }
}
