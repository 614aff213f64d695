//! Host policy hooks.
//!
//! Every hook is optional and independently settable. An unset hook falls
//! back to the documented default:
//!
//! | Hook | Default |
//! |------|---------|
//! | `may_check` | checks are permitted |
//! | `feed_parameters` | no extra query parameters |
//! | `feed_url` | configured feed URL |
//! | `best_candidate` | highest applicable version |
//! | `version_comparator` | [`StandardVersionComparator`] |
//! | `decryption_password` | none (encrypted payloads fail) |
//! | `relaunch_path` | configured relaunch path |
//! | `should_relaunch` | relaunch |
//! | `should_inherit_privileges` | installer does not inherit privileges |
//! | `postpone_handoff` | hand off immediately |

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::feed::{Feed, FeedEntry};
use crate::version::{StandardVersionComparator, VersionComparator};

type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;
type ParametersFn = Arc<dyn Fn(bool) -> Vec<(String, String)> + Send + Sync>;
type StringFn = Arc<dyn Fn() -> Option<String> + Send + Sync>;
type CandidateFn = Arc<dyn Fn(&Feed) -> Option<FeedEntry> + Send + Sync>;
type PostponeFn = Arc<dyn Fn(&FeedEntry, HandoffContinuation) -> bool + Send + Sync>;

/// Continuation handed to the postpone hook.
///
/// Call [`resume`](Self::resume) to let the installer handoff proceed.
/// Dropping it without resuming abandons the handoff.
#[derive(Debug)]
pub struct HandoffContinuation {
    tx: oneshot::Sender<()>,
}

impl HandoffContinuation {
    pub(crate) fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Continue with the installer handoff.
    pub fn resume(self) {
        let _ = self.tx.send(());
    }
}

/// Capability set of host-supplied overrides.
#[derive(Clone, Default)]
pub struct PolicyHooks {
    may_check: Option<Predicate>,
    feed_parameters: Option<ParametersFn>,
    feed_url: Option<StringFn>,
    best_candidate: Option<CandidateFn>,
    version_comparator: Option<Arc<dyn VersionComparator>>,
    decryption_password: Option<StringFn>,
    relaunch_path: Option<StringFn>,
    should_relaunch: Option<Predicate>,
    should_inherit_privileges: Option<Predicate>,
    postpone_handoff: Option<PostponeFn>,
}

impl PolicyHooks {
    /// No overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a check may run at all.
    pub fn with_may_check<F>(mut self, f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.may_check = Some(Arc::new(f));
        self
    }

    /// Extra query parameters appended to the feed request.
    ///
    /// The argument is `true` when the host system profile is also being sent.
    pub fn with_feed_parameters<F>(mut self, f: F) -> Self
    where
        F: Fn(bool) -> Vec<(String, String)> + Send + Sync + 'static,
    {
        self.feed_parameters = Some(Arc::new(f));
        self
    }

    /// Replace the feed URL. Returning `None` keeps the configured URL.
    pub fn with_feed_url<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.feed_url = Some(Arc::new(f));
        self
    }

    /// Choose the candidate entry instead of the highest applicable version.
    ///
    /// The returned entry must still be newer than the running version and
    /// applicable to the host, otherwise selection fails.
    pub fn with_best_candidate<F>(mut self, f: F) -> Self
    where
        F: Fn(&Feed) -> Option<FeedEntry> + Send + Sync + 'static,
    {
        self.best_candidate = Some(Arc::new(f));
        self
    }

    /// Compare versions during selection with a custom comparator.
    pub fn with_version_comparator(mut self, comparator: Arc<dyn VersionComparator>) -> Self {
        self.version_comparator = Some(comparator);
        self
    }

    /// Supply the password for encrypted payloads.
    pub fn with_decryption_password<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.decryption_password = Some(Arc::new(f));
        self
    }

    /// Override the path the installer relaunches.
    pub fn with_relaunch_path<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.relaunch_path = Some(Arc::new(f));
        self
    }

    /// Decide whether the installer relaunches the application.
    pub fn with_should_relaunch<F>(mut self, f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.should_relaunch = Some(Arc::new(f));
        self
    }

    /// Decide whether the installer inherits the updater's install privileges.
    pub fn with_should_inherit_privileges<F>(mut self, f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.should_inherit_privileges = Some(Arc::new(f));
        self
    }

    /// Delay the installer handoff.
    ///
    /// Return `true` to postpone; the handoff then waits until the supplied
    /// continuation is resumed.
    pub fn with_postpone_handoff<F>(mut self, f: F) -> Self
    where
        F: Fn(&FeedEntry, HandoffContinuation) -> bool + Send + Sync + 'static,
    {
        self.postpone_handoff = Some(Arc::new(f));
        self
    }

    pub(crate) fn may_check(&self) -> bool {
        self.may_check.as_ref().map_or(true, |f| f())
    }

    pub(crate) fn feed_parameters(&self, sending_profile: bool) -> Vec<(String, String)> {
        self.feed_parameters
            .as_ref()
            .map(|f| f(sending_profile))
            .unwrap_or_default()
    }

    pub(crate) fn feed_url(&self) -> Option<String> {
        self.feed_url.as_ref().and_then(|f| f())
    }

    pub(crate) fn best_candidate(&self, feed: &Feed) -> Option<Option<FeedEntry>> {
        self.best_candidate.as_ref().map(|f| f(feed))
    }

    pub(crate) fn version_comparator(&self) -> Arc<dyn VersionComparator> {
        self.version_comparator
            .clone()
            .unwrap_or_else(|| Arc::new(StandardVersionComparator))
    }

    pub(crate) fn decryption_password(&self) -> Option<String> {
        self.decryption_password.as_ref().and_then(|f| f())
    }

    pub(crate) fn relaunch_path(&self) -> Option<String> {
        self.relaunch_path.as_ref().and_then(|f| f())
    }

    pub(crate) fn should_relaunch(&self) -> bool {
        self.should_relaunch.as_ref().map_or(true, |f| f())
    }

    pub(crate) fn should_inherit_privileges(&self) -> bool {
        self.should_inherit_privileges.as_ref().is_some_and(|f| f())
    }

    /// Ask the postpone hook. `Some(rx)` means wait on `rx` before handoff.
    pub(crate) fn postpone_handoff(&self, entry: &FeedEntry) -> Option<oneshot::Receiver<()>> {
        let hook = self.postpone_handoff.as_ref()?;
        let (continuation, rx) = HandoffContinuation::new();
        hook(entry, continuation).then_some(rx)
    }
}

impl fmt::Debug for PolicyHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyHooks")
            .field("may_check", &self.may_check.is_some())
            .field("feed_parameters", &self.feed_parameters.is_some())
            .field("feed_url", &self.feed_url.is_some())
            .field("best_candidate", &self.best_candidate.is_some())
            .field("version_comparator", &self.version_comparator.is_some())
            .field("decryption_password", &self.decryption_password.is_some())
            .field("relaunch_path", &self.relaunch_path.is_some())
            .field("should_relaunch", &self.should_relaunch.is_some())
            .field(
                "should_inherit_privileges",
                &self.should_inherit_privileges.is_some(),
            )
            .field("postpone_handoff", &self.postpone_handoff.is_some())
            .finish()
    }
}
