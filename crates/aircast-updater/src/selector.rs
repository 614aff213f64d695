//! Candidate selection.
//!
//! Filters the feed down to entries that are newer than the running version
//! and applicable to the host, then picks the highest. A host override may
//! pick a different entry, but the override is held to the same filters.

use std::cmp::Ordering;

use tracing::{debug, warn};

use crate::error::SelectionError;
use crate::feed::{DownloadVariant, Feed, FeedEntry};
use crate::hooks::PolicyHooks;
use crate::host::HostEnvironment;
use crate::version::{Version, VersionComparator};

/// The chosen entry and the variant to download.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Selected feed entry
    pub entry: FeedEntry,
    /// Variant of `entry` that will be downloaded
    pub variant: DownloadVariant,
}

/// Picks the best applicable update from a feed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandidateSelector;

impl CandidateSelector {
    /// Create a selector.
    pub fn new() -> Self {
        Self
    }

    /// Select the update to install.
    ///
    /// Returns `Ok(None)` when nothing is newer and applicable.
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError::NoValidCandidate`] when the override hook
    /// supplies an entry that fails the version or host filters.
    pub fn select(
        &self,
        feed: &Feed,
        current: &Version,
        host: &HostEnvironment,
        hooks: &PolicyHooks,
    ) -> Result<Option<Candidate>, SelectionError> {
        let comparator = hooks.version_comparator();

        if let Some(chosen) = hooks.best_candidate(feed) {
            let Some(entry) = chosen else {
                debug!("Candidate override reported no update");
                return Ok(None);
            };
            return match self.candidate_for(&entry, current, host, comparator.as_ref()) {
                Ok(variant) => Ok(Some(Candidate { entry, variant })),
                Err(reason) => {
                    warn!(version = %entry.version, reason = %reason, "Rejected override candidate");
                    Err(SelectionError::NoValidCandidate {
                        version: entry.version.to_string(),
                        reason,
                    })
                }
            };
        }

        let mut best: Option<Candidate> = None;
        for entry in &feed.entries {
            let Ok(variant) = self.candidate_for(entry, current, host, comparator.as_ref()) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some(b) => comparator.compare(&entry.version, &b.entry.version) == Ordering::Greater,
            };
            if better {
                best = Some(Candidate {
                    entry: entry.clone(),
                    variant,
                });
            }
        }

        match &best {
            Some(c) => debug!(version = %c.entry.version, url = %c.variant.url, "Selected candidate"),
            None => debug!(current = %current, "No applicable newer entry"),
        }
        Ok(best)
    }

    /// Check the filters for one entry and pick its variant.
    fn candidate_for(
        &self,
        entry: &FeedEntry,
        current: &Version,
        host: &HostEnvironment,
        comparator: &dyn VersionComparator,
    ) -> Result<DownloadVariant, String> {
        if comparator.compare(&entry.version, current) != Ordering::Greater {
            return Err(format!("not newer than running version {}", current));
        }
        choose_variant(entry, current, host)
            .cloned()
            .ok_or_else(|| "no variant applicable to this host".to_string())
    }
}

/// Prefer a delta built against the running version, else the first full
/// variant. Deltas against any other base are never applicable.
fn choose_variant<'a>(
    entry: &'a FeedEntry,
    current: &Version,
    host: &HostEnvironment,
) -> Option<&'a DownloadVariant> {
    let applicable = || entry.variants.iter().filter(move |v| v.admits(host));

    applicable()
        .find(|v| v.delta_from.as_ref() == Some(current))
        .or_else(|| applicable().find(|v| !v.is_delta()))
}
