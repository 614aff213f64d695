//! CLI command definitions and argument parsing

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aircast_updater::{
    CycleOutcome, DownloadProgress, FeedParser, HostEnvironment, UpdateDriver, UpdateEvent,
    UpdaterConfig, Version,
};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Operation completed successfully, including "no update"
    Success = 0,
    /// Bad input or configuration
    GeneralError = 1,
    /// The update cycle failed
    CycleFailed = 2,
    /// The update cycle was cancelled
    Cancelled = 130,
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }
}

/// Aircast update check CLI
#[derive(Parser, Debug)]
#[command(name = "aircast-check")]
#[command(version, about = "Check for, verify and stage Aircast updates")]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path (TOML)
    #[arg(long, global = true, env = "AIRCAST_UPDATER_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one update check cycle and stage the verified payload
    Check(CheckArgs),

    /// Compare two version strings
    Compare {
        /// Left-hand version
        a: String,
        /// Right-hand version
        b: String,
    },

    /// Parse a local feed document and list its entries
    ParseFeed {
        /// Feed document path
        file: PathBuf,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct CheckArgs {
    /// Version of the running application
    #[arg(long)]
    pub current_version: String,

    /// Feed URL (overrides config)
    #[arg(long)]
    pub feed_url: Option<String>,

    /// Host OS version (defaults to the detected version)
    #[arg(long)]
    pub os_version: Option<String>,

    /// Staging directory (overrides config)
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Accept unsigned payloads
    #[arg(long)]
    pub allow_unsigned: bool,

    /// Send the host system profile with the feed request
    #[arg(long)]
    pub send_profile: bool,
}

impl CheckArgs {
    /// Apply command-line overrides on top of the loaded config.
    pub fn apply(&self, config: &mut UpdaterConfig) {
        if let Some(url) = &self.feed_url {
            config.feed_url = url.clone();
        }
        if let Some(dir) = &self.staging_dir {
            config.staging_dir = Some(dir.clone());
        }
        if self.allow_unsigned {
            config.security.allow_unsigned = true;
        }
        if self.send_profile {
            config.send_system_profile = true;
        }
    }
}

/// Load the config file, or defaults when no path was given.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<UpdaterConfig> {
    match path {
        Some(path) => UpdaterConfig::load_from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(UpdaterConfig::default()),
    }
}

impl Cli {
    /// Execute the CLI command with a pre-loaded configuration
    pub async fn execute_with_config(self, config: UpdaterConfig) -> anyhow::Result<ExitCode> {
        match self.command {
            Commands::Check(args) => run_check(args, config).await,
            Commands::Compare { a, b } => {
                println!("{}", compare_symbol(&a, &b));
                Ok(ExitCode::Success)
            }
            Commands::ParseFeed { file } => parse_feed(&file),
        }
    }
}

/// `<`, `=` or `>` under the standard comparator.
pub fn compare_symbol(a: &str, b: &str) -> &'static str {
    match Version::compare(&Version::parse(a), &Version::parse(b)) {
        Ordering::Less => "<",
        Ordering::Equal => "=",
        Ordering::Greater => ">",
    }
}

fn parse_feed(file: &Path) -> anyhow::Result<ExitCode> {
    let document =
        std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let report = FeedParser::new()
        .parse_with_report(&document)
        .context("feed document is malformed")?;

    if let Some(title) = &report.feed.title {
        println!("{}", title);
    }
    for entry in &report.feed.entries {
        println!(
            "{}\t{}\t{} variant(s){}",
            entry.version,
            entry.title.as_deref().unwrap_or("-"),
            entry.variants.len(),
            if entry.critical { "\tcritical" } else { "" }
        );
    }
    for dropped in &report.dropped {
        eprintln!("dropped: {}", dropped);
    }
    Ok(ExitCode::Success)
}

fn describe(event: &UpdateEvent) -> String {
    match event {
        UpdateEvent::FeedLoaded(feed) => format!("feed loaded ({} entries)", feed.len()),
        UpdateEvent::ValidUpdateFound(entry) => format!("update found: {}", entry.version),
        UpdateEvent::NoUpdateFound { reason } => format!("no update: {}", reason),
        UpdateEvent::WillDownload(entry) => format!("downloading {}", entry.version),
        UpdateEvent::DownloadFailed { entry, error } => {
            format!("download of {} failed: {}", entry.version, error)
        }
        UpdateEvent::WillInstall(entry) => format!("handing off {}", entry.version),
        UpdateEvent::Aborted(error) => format!("aborted: {}", error),
        UpdateEvent::Cancelled => "cancelled".to_string(),
    }
}

async fn run_check(args: CheckArgs, mut config: UpdaterConfig) -> anyhow::Result<ExitCode> {
    args.apply(&mut config);
    if config.feed_url.is_empty() {
        anyhow::bail!("no feed URL: pass --feed-url or set feed_url in the config file");
    }

    let mut builder = UpdateDriver::from_config(&config, Version::parse(&args.current_version))?
        .observer(Arc::new(|event: &UpdateEvent| eprintln!("{}", describe(event))))
        .progress(Arc::new(|progress: DownloadProgress| debug!(%progress, "Download progress")));
    if let Some(os_version) = &args.os_version {
        let detected = HostEnvironment::current();
        builder = builder.host(HostEnvironment::new(
            detected.platform,
            Version::parse(os_version),
        ));
    }
    let driver = builder.build()?;
    info!(
        feed_url = %config.feed_url,
        current_version = %args.current_version,
        staging_dir = %config.staging_dir().display(),
        "Running update check"
    );

    let handle = driver.check_for_updates().await?;
    let token = handle.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    let outcome = handle.outcome().await;
    interrupt.abort();

    Ok(match outcome {
        Ok(CycleOutcome::HandedOff { entry }) => {
            println!(
                "staged {} in {}",
                entry.version,
                config.staging_dir().join("ready").display()
            );
            ExitCode::Success
        }
        Ok(CycleOutcome::NoUpdateAvailable) => {
            println!("up to date");
            ExitCode::Success
        }
        Ok(CycleOutcome::NoValidCandidate { version, reason }) => {
            println!("no valid candidate ({}: {})", version, reason);
            ExitCode::Success
        }
        Ok(CycleOutcome::CheckNotPermitted) => {
            println!("check not permitted");
            ExitCode::Success
        }
        Ok(CycleOutcome::Cancelled) => ExitCode::Cancelled,
        Err(err) => {
            eprintln!("Error: {}", err);
            ExitCode::CycleFailed
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_check_command() {
        let cli = Cli::try_parse_from([
            "aircast-check",
            "--verbose",
            "check",
            "--current-version",
            "1.4.2",
            "--feed-url",
            "https://updates.example.com/feed.json",
            "--allow-unsigned",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::Check(args) = cli.command else {
            panic!("expected check command");
        };
        assert_eq!(args.current_version, "1.4.2");
        assert!(args.allow_unsigned);
        assert!(args.os_version.is_none());
    }

    #[test]
    fn test_check_requires_current_version() {
        assert!(Cli::try_parse_from(["aircast-check", "check"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "aircast-check",
            "compare",
            "1.0",
            "2.0",
            "--debug",
            "--config",
            "/etc/aircast/updater.toml",
        ])
        .unwrap();
        assert!(cli.debug);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/aircast/updater.toml")));
    }

    #[test]
    fn test_check_args_override_config() {
        let mut config = UpdaterConfig::default();
        config.feed_url = "https://config.example.com/feed.json".to_string();

        let args = CheckArgs {
            current_version: "1.0".to_string(),
            feed_url: Some("https://cli.example.com/feed.json".to_string()),
            staging_dir: Some(PathBuf::from("/tmp/aircast-staging")),
            allow_unsigned: true,
            send_profile: true,
            ..CheckArgs::default()
        };
        args.apply(&mut config);

        assert!(config.send_system_profile);
        assert_eq!(config.feed_url, "https://cli.example.com/feed.json");
        assert_eq!(config.staging_dir, Some(PathBuf::from("/tmp/aircast-staging")));
        assert!(config.security.allow_unsigned);
    }

    #[test]
    fn test_check_args_keep_config_when_absent() {
        let mut config = UpdaterConfig::default();
        config.feed_url = "https://config.example.com/feed.json".to_string();

        CheckArgs::default().apply(&mut config);
        assert_eq!(config.feed_url, "https://config.example.com/feed.json");
        assert!(!config.security.allow_unsigned);
    }

    #[test]
    fn test_compare_symbol() {
        assert_eq!(compare_symbol("1.0", "1.0.1"), "<");
        assert_eq!(compare_symbol("1.0", "1.0.0"), "=");
        assert_eq!(compare_symbol("2.0", "1.9"), ">");
        assert_eq!(compare_symbol("1.0beta", "1.0"), "<");
    }

    #[test]
    fn test_load_config() {
        assert_eq!(load_config(None).unwrap(), UpdaterConfig::default());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("updater.toml");
        std::fs::write(&path, "feed_url = \"https://updates.example.com/feed.json\"\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.feed_url, "https://updates.example.com/feed.json");

        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_parse_feed_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        std::fs::write(
            &path,
            r#"{"entries": [{"version": "2.0", "variants": [{"url": "https://example.com/a.bin"}]}, {"title": "broken"}]}"#,
        )
        .unwrap();
        assert_eq!(parse_feed(&path).unwrap(), ExitCode::Success);

        std::fs::write(&path, "not a feed").unwrap();
        assert!(parse_feed(&path).is_err());
    }

    #[test]
    fn test_exit_code_values() {
        assert_eq!(ExitCode::Success as u8, 0);
        assert_eq!(ExitCode::CycleFailed as u8, 2);
        assert_eq!(ExitCode::Cancelled as u8, 130);
    }
}
