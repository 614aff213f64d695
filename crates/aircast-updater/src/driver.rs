//! Update driver: the check-cycle state machine.
//!
//! ```text
//! Idle -> CheckingFeed -> SelectingCandidate -> NoUpdateAvailable
//!                                            -> Downloading -> Verifying -> ReadyToInstall
//!                                                                        -> Failed
//! ```
//!
//! Every terminal state returns to `Idle` before the cycle outcome is
//! delivered. One cycle runs at a time; a second request while a cycle is
//! active is rejected with [`UpdateError::AlreadyInProgress`].
//!
//! # Cancellation
//!
//! The cycle's [`CancellationToken`] is observed while fetching the feed,
//! between download chunks, during retry backoff, before verification and
//! while a handoff is postponed. A cancelled cycle deletes its temp files,
//! emits [`UpdateEvent::Cancelled`] and never reaches the installer.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::UpdaterConfig;
use crate::decrypt;
use crate::download::{require_secure_url, Downloader, DownloaderConfig, ProgressCallback};
use crate::error::{DownloadError, SelectionError, UpdateError};
use crate::events::{NoUpdateReason, Observers, UpdateEvent, UpdateObserver};
use crate::feed::FeedEntry;
use crate::handoff::{InstallManifest, InstallerHandoff, StagingInstaller, VerifiedPayload};
use crate::hooks::PolicyHooks;
use crate::host::HostEnvironment;
use crate::parser::FeedParser;
use crate::selector::{Candidate, CandidateSelector};
use crate::transport::{FeedFetcher, HttpTransport, ReqwestTransport};
use crate::verify::TrustVerifier;
use crate::version::Version;

/// Phase of the active cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatePhase {
    /// No cycle is running
    #[default]
    Idle,
    /// Fetching and parsing the feed
    CheckingFeed,
    /// Choosing the entry to install
    SelectingCandidate,
    /// Nothing newer is applicable
    NoUpdateAvailable,
    /// Downloading the payload
    Downloading,
    /// Checking the payload signature and hash
    Verifying,
    /// Payload verified, handing off to the installer
    ReadyToInstall,
    /// Cycle failed
    Failed,
}

/// State of the active cycle. Created per cycle and dropped when it ends.
#[derive(Debug)]
struct DriverState {
    cycle: u64,
    phase: UpdatePhase,
    entry: Option<FeedEntry>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// How a cycle ended without error.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The permission hook declined the check
    CheckNotPermitted,
    /// Nothing newer is applicable to this host
    NoUpdateAvailable,
    /// The candidate override chose an entry that fails the filters
    NoValidCandidate { version: String, reason: String },
    /// The verified payload was handed to the installer
    HandedOff { entry: FeedEntry },
    /// The cycle was cancelled
    Cancelled,
}

/// Handle on a running cycle.
#[derive(Debug)]
pub struct CycleHandle {
    cycle: u64,
    cancel: CancellationToken,
    outcome: oneshot::Receiver<Result<CycleOutcome, Arc<UpdateError>>>,
}

impl CycleHandle {
    /// Sequence number of the cycle.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Request cancellation of this cycle.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this cycle when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the cycle to finish.
    ///
    /// The driver is back in [`UpdatePhase::Idle`] by the time this resolves.
    pub async fn outcome(self) -> Result<CycleOutcome, Arc<UpdateError>> {
        self.outcome
            .await
            .unwrap_or_else(|_| Err(Arc::new(UpdateError::Interrupted)))
    }
}

/// Builder for [`UpdateDriver`].
pub struct UpdateDriverBuilder {
    current_version: Version,
    feed_url: String,
    relaunch_path: Option<PathBuf>,
    staging_dir: PathBuf,
    host: Option<HostEnvironment>,
    send_system_profile: bool,
    fetcher: Option<Arc<dyn FeedFetcher>>,
    transport: Option<Arc<dyn HttpTransport>>,
    installer: Option<Arc<dyn InstallerHandoff>>,
    verifier: TrustVerifier,
    downloader_config: DownloaderConfig,
    progress: Option<ProgressCallback>,
    hooks: PolicyHooks,
    observers: Observers,
}

impl UpdateDriverBuilder {
    /// Feed document URL.
    pub fn feed_url(mut self, url: impl Into<String>) -> Self {
        self.feed_url = url.into();
        self
    }

    /// Application path the installer relaunches.
    pub fn relaunch_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.relaunch_path = Some(path.into());
        self
    }

    /// Directory for downloaded payloads.
    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    /// Host description used to filter variants. Defaults to the running host.
    pub fn host(mut self, host: HostEnvironment) -> Self {
        self.host = Some(host);
        self
    }

    /// Append the host system profile to the feed request.
    pub fn send_system_profile(mut self, enabled: bool) -> Self {
        self.send_system_profile = enabled;
        self
    }

    /// Feed fetch collaborator.
    pub fn fetcher(mut self, fetcher: Arc<dyn FeedFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Payload transport collaborator.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Installer collaborator.
    pub fn installer(mut self, installer: Arc<dyn InstallerHandoff>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Trust verifier with the pinned keys.
    pub fn verifier(mut self, verifier: TrustVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Retry and URL policy for downloads.
    pub fn downloader_config(mut self, config: DownloaderConfig) -> Self {
        self.downloader_config = config;
        self
    }

    /// Download progress callback.
    pub fn progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Host policy hooks.
    pub fn hooks(mut self, hooks: PolicyHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Register an event observer.
    pub fn observer(mut self, observer: Arc<dyn UpdateObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Build the driver.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if a collaborator is missing.
    pub fn build(self) -> Result<UpdateDriver, UpdateError> {
        let fetcher = self
            .fetcher
            .ok_or_else(|| UpdateError::Config("feed fetcher not set".to_string()))?;
        let transport = self
            .transport
            .ok_or_else(|| UpdateError::Config("payload transport not set".to_string()))?;
        let installer = self
            .installer
            .ok_or_else(|| UpdateError::Config("installer not set".to_string()))?;

        if self.verifier.trusted_keys().is_empty() {
            warn!("No trusted public keys configured; signed payloads will fail verification");
        }

        let allow_insecure_http = self.downloader_config.allow_insecure_http;
        let mut downloader = Downloader::new(transport, self.downloader_config);
        if let Some(progress) = self.progress {
            downloader = downloader.with_progress(progress);
        }

        Ok(UpdateDriver {
            inner: Arc::new(Inner {
                current_version: self.current_version,
                feed_url: self.feed_url,
                relaunch_path: self.relaunch_path,
                staging_dir: self.staging_dir,
                host: self.host.unwrap_or_else(HostEnvironment::current),
                send_system_profile: self.send_system_profile,
                allow_insecure_http,
                fetcher,
                downloader,
                verifier: self.verifier,
                installer,
                hooks: self.hooks,
                observers: self.observers,
                state: RwLock::new(None),
                next_cycle: std::sync::atomic::AtomicU64::new(1),
            }),
        })
    }
}

/// Orchestrates check cycles.
///
/// Cheap to clone; clones share the same state.
///
/// # Example
///
/// ```ignore
/// use aircast_updater::{UpdateDriver, UpdaterConfig, Version};
///
/// let config = UpdaterConfig::load_from_file(path)?;
/// let driver = UpdateDriver::from_config(&config, Version::parse("1.4.2"))?.build()?;
///
/// let handle = driver.check_for_updates().await?;
/// match handle.outcome().await {
///     Ok(outcome) => println!("{:?}", outcome),
///     Err(e) => eprintln!("update failed: {}", e),
/// }
/// ```
#[derive(Clone)]
pub struct UpdateDriver {
    inner: Arc<Inner>,
}

struct Inner {
    current_version: Version,
    feed_url: String,
    relaunch_path: Option<PathBuf>,
    staging_dir: PathBuf,
    host: HostEnvironment,
    send_system_profile: bool,
    allow_insecure_http: bool,
    fetcher: Arc<dyn FeedFetcher>,
    downloader: Downloader,
    verifier: TrustVerifier,
    installer: Arc<dyn InstallerHandoff>,
    hooks: PolicyHooks,
    observers: Observers,
    /// `None` while idle
    state: RwLock<Option<DriverState>>,
    next_cycle: std::sync::atomic::AtomicU64,
}

impl UpdateDriver {
    /// Start building a driver for an application running `current_version`.
    pub fn builder(current_version: Version) -> UpdateDriverBuilder {
        UpdateDriverBuilder {
            current_version,
            feed_url: String::new(),
            relaunch_path: None,
            staging_dir: std::env::temp_dir().join("aircast-updates"),
            host: None,
            send_system_profile: false,
            fetcher: None,
            transport: None,
            installer: None,
            verifier: TrustVerifier::new(Vec::new()),
            downloader_config: DownloaderConfig::default(),
            progress: None,
            hooks: PolicyHooks::default(),
            observers: Observers::default(),
        }
    }

    /// Builder preloaded from configuration, with the `reqwest` transport and
    /// a [`StagingInstaller`] writing into `<staging_dir>/ready`.
    pub fn from_config(
        config: &UpdaterConfig,
        current_version: Version,
    ) -> Result<UpdateDriverBuilder, UpdateError> {
        let transport = Arc::new(ReqwestTransport::new(&config.transport_config())?);
        let staging_dir = config.staging_dir();
        let mut builder = Self::builder(current_version)
            .feed_url(config.feed_url.clone())
            .staging_dir(staging_dir.clone())
            .fetcher(transport.clone())
            .transport(transport)
            .installer(Arc::new(StagingInstaller::new(staging_dir.join("ready"))))
            .verifier(config.trust_verifier()?)
            .downloader_config(config.downloader_config())
            .send_system_profile(config.send_system_profile);
        if let Some(path) = &config.relaunch_path {
            builder = builder.relaunch_path(path.clone());
        }
        Ok(builder)
    }

    /// Get the running version.
    pub fn current_version(&self) -> &Version {
        &self.inner.current_version
    }

    /// Get the host description.
    pub fn host(&self) -> &HostEnvironment {
        &self.inner.host
    }

    /// Get the current phase.
    pub async fn state(&self) -> UpdatePhase {
        self.inner
            .state
            .read()
            .await
            .as_ref()
            .map_or(UpdatePhase::Idle, |s| s.phase)
    }

    /// Entry being processed by the active cycle, if any.
    pub async fn active_entry(&self) -> Option<FeedEntry> {
        self.inner
            .state
            .read()
            .await
            .as_ref()
            .and_then(|s| s.entry.clone())
    }

    /// Cancel the active cycle. Returns `false` when idle.
    pub async fn cancel(&self) -> bool {
        match self.inner.state.read().await.as_ref() {
            Some(state) => {
                info!(cycle = state.cycle, phase = ?state.phase, "Cancelling update cycle");
                state.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Start a check cycle.
    ///
    /// The cycle runs on a spawned task; use the returned handle to wait for
    /// its outcome or cancel it.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::AlreadyInProgress`] if a cycle is active. The
    /// active cycle is not affected.
    pub async fn check_for_updates(&self) -> Result<CycleHandle, UpdateError> {
        let cancel = CancellationToken::new();
        let cycle = {
            let mut state = self.inner.state.write().await;
            if let Some(active) = state.as_ref() {
                warn!(
                    cycle = active.cycle,
                    phase = ?active.phase,
                    "Rejecting check request: a cycle is already in progress"
                );
                return Err(UpdateError::AlreadyInProgress);
            }
            let cycle = self
                .inner
                .next_cycle
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            *state = Some(DriverState {
                cycle,
                phase: UpdatePhase::CheckingFeed,
                entry: None,
                started_at: Utc::now(),
                cancel: cancel.clone(),
            });
            cycle
        };

        info!(cycle, current_version = %self.inner.current_version, "Starting update check");

        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let worker = {
                let inner = inner.clone();
                tokio::spawn(async move { inner.run_cycle(&token).await })
            };
            let result = match worker.await {
                Ok(result) => result,
                Err(join_error) => {
                    error!(cycle, error = %join_error, "Update cycle task panicked");
                    Err(Arc::new(UpdateError::Interrupted))
                }
            };
            let result = inner.finish(result).await;
            let _ = tx.send(result);
        });

        Ok(CycleHandle {
            cycle,
            cancel,
            outcome: rx,
        })
    }
}

impl std::fmt::Debug for UpdateDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateDriver")
            .field("current_version", &self.inner.current_version)
            .field("feed_url", &self.inner.feed_url)
            .field("host", &self.inner.host)
            .field("hooks", &self.inner.hooks)
            .field("observers", &self.inner.observers)
            .finish_non_exhaustive()
    }
}

type CycleResult = Result<CycleOutcome, Arc<UpdateError>>;

impl Inner {
    async fn set_phase(&self, phase: UpdatePhase) {
        if let Some(state) = self.state.write().await.as_mut() {
            info!(cycle = state.cycle, from = ?state.phase, to = ?phase, "Update state transition");
            state.phase = phase;
        }
    }

    async fn set_entry(&self, entry: &FeedEntry) {
        if let Some(state) = self.state.write().await.as_mut() {
            state.entry = Some(entry.clone());
        }
    }

    fn emit(&self, event: UpdateEvent) {
        self.observers.emit(event);
    }

    /// Return to idle, then report the result.
    ///
    /// The state is cleared before observers run so a panicking observer
    /// cannot leave the driver busy.
    async fn finish(&self, result: CycleResult) -> CycleResult {
        if result.is_err() {
            self.set_phase(UpdatePhase::Failed).await;
        }
        if let Some(state) = self.state.write().await.take() {
            let elapsed = Utc::now() - state.started_at;
            info!(
                cycle = state.cycle,
                phase = ?state.phase,
                elapsed_ms = elapsed.num_milliseconds(),
                "Update state transition to Idle"
            );
        }

        match &result {
            Ok(CycleOutcome::Cancelled) => {
                info!("Update cycle cancelled");
                self.emit(UpdateEvent::Cancelled);
            }
            Ok(outcome) => debug!(outcome = ?outcome, "Update cycle finished"),
            Err(err) => {
                error!(error = %err, "Update cycle failed");
                self.emit(UpdateEvent::Aborted(err.clone()));
            }
        }
        result
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> CycleResult {
        if !self.hooks.may_check() {
            info!("Update check declined by host policy");
            return Ok(CycleOutcome::CheckNotPermitted);
        }

        // Feed
        let feed_url = self
            .hooks
            .feed_url()
            .unwrap_or_else(|| self.feed_url.clone());
        require_secure_url(&feed_url, self.allow_insecure_http).map_err(UpdateError::from)?;
        let mut parameters = if self.send_system_profile {
            self.host.system_profile(&self.current_version)
        } else {
            Vec::new()
        };
        parameters.extend(self.hooks.feed_parameters(self.send_system_profile));

        let document = tokio::select! {
            _ = cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
            document = self.fetcher.fetch_feed(&feed_url, &parameters) => {
                document.map_err(UpdateError::from)?
            }
        };
        let report = FeedParser::new()
            .parse_with_report(&document)
            .map_err(UpdateError::from)?;
        for dropped in &report.dropped {
            warn!(url = %feed_url, error = %dropped, "Dropped feed entry");
        }
        let feed = Arc::new(report.feed);
        info!(url = %feed_url, entries = feed.len(), "Feed loaded");
        self.emit(UpdateEvent::FeedLoaded(feed.clone()));

        // Selection
        self.set_phase(UpdatePhase::SelectingCandidate).await;
        let selection = CandidateSelector::new().select(
            &feed,
            &self.current_version,
            &self.host,
            &self.hooks,
        );
        let Candidate { entry, variant } = match selection {
            Ok(Some(candidate)) => candidate,
            Ok(None) => {
                self.set_phase(UpdatePhase::NoUpdateAvailable).await;
                self.emit(UpdateEvent::NoUpdateFound {
                    reason: NoUpdateReason::UpToDate,
                });
                return Ok(CycleOutcome::NoUpdateAvailable);
            }
            Err(SelectionError::NoValidCandidate { version, reason }) => {
                self.set_phase(UpdatePhase::NoUpdateAvailable).await;
                self.emit(UpdateEvent::NoUpdateFound {
                    reason: NoUpdateReason::InvalidOverride {
                        version: version.clone(),
                        reason: reason.clone(),
                    },
                });
                return Ok(CycleOutcome::NoValidCandidate { version, reason });
            }
        };
        info!(version = %entry.version, url = %variant.url, "Valid update found");
        self.set_entry(&entry).await;
        self.emit(UpdateEvent::ValidUpdateFound(entry.clone()));

        // Download
        self.set_phase(UpdatePhase::Downloading).await;
        self.emit(UpdateEvent::WillDownload(entry.clone()));
        let downloaded = match self.download(&variant.url, variant.length, cancel).await {
            Ok(file) => file,
            Err(DownloadError::Cancelled) => return Ok(CycleOutcome::Cancelled),
            Err(err) => {
                let err = Arc::new(UpdateError::from(err));
                self.emit(UpdateEvent::DownloadFailed {
                    entry: entry.clone(),
                    error: err.clone(),
                });
                return Err(err);
            }
        };

        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }

        // Verification covers the downloaded bytes, before any decryption
        self.set_phase(UpdatePhase::Verifying).await;
        let sha256 = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
            verified = self.verifier.verify_file(downloaded.path(), &variant) => {
                verified.map_err(UpdateError::from)?
            }
        };

        let (payload_file, decrypted) = if variant.encrypted {
            let password = self.hooks.decryption_password();
            let plain = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
                plain = decrypt::open_file(downloaded.path(), password.as_deref(), &self.staging_dir) => {
                    plain.map_err(UpdateError::from)?
                }
            };
            drop(downloaded);
            (plain, true)
        } else {
            (downloaded, false)
        };

        // Downgrade prevention ignores any comparator override
        if Version::compare(&entry.version, &self.current_version) != Ordering::Greater {
            warn!(
                current = %self.current_version,
                offered = %entry.version,
                "Refusing downgrade"
            );
            return Err(Arc::new(UpdateError::DowngradeRejected {
                current: self.current_version.to_string(),
                offered: entry.version.to_string(),
            }));
        }

        self.set_phase(UpdatePhase::ReadyToInstall).await;
        if let Some(continuation) = self.hooks.postpone_handoff(&entry) {
            info!(version = %entry.version, "Installer handoff postponed by host");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
                resumed = continuation => {
                    if resumed.is_err() {
                        info!("Postponed handoff abandoned");
                        return Ok(CycleOutcome::Cancelled);
                    }
                }
            }
            if cancel.is_cancelled() {
                return Ok(CycleOutcome::Cancelled);
            }
        }

        let manifest = InstallManifest {
            version: entry.version.to_string(),
            title: entry.title.clone(),
            relaunch_path: self
                .hooks
                .relaunch_path()
                .map(PathBuf::from)
                .or_else(|| self.relaunch_path.clone()),
            relaunch: self.hooks.should_relaunch(),
            inherit_privileges: self.hooks.should_inherit_privileges(),
            decrypted,
            delta_from: variant.delta_from.as_ref().map(|v| v.to_string()),
            sha256: hex::encode(sha256),
            critical: entry.critical,
        };

        self.emit(UpdateEvent::WillInstall(entry.clone()));
        if cancel.is_cancelled() {
            return Ok(CycleOutcome::Cancelled);
        }
        let payload = VerifiedPayload::new(payload_file, sha256, entry.clone(), variant);
        self.installer.hand_off(payload, manifest).await?;
        info!(version = %entry.version, "Update handed off to installer");

        Ok(CycleOutcome::HandedOff { entry })
    }

    async fn download(
        &self,
        url: &str,
        length: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<NamedTempFile, DownloadError> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        self.downloader
            .fetch(url, length, cancel, &self.staging_dir)
            .await
    }
}
