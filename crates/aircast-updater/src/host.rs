//! Host environment description used to filter feed variants.

use crate::version::Version;

/// The machine the update would be installed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEnvironment {
    /// Platform string, e.g. "linux-x86_64" or "macos-aarch64"
    pub platform: String,
    /// Operating system version
    pub os_version: Version,
}

impl HostEnvironment {
    /// Describe a host explicitly.
    pub fn new(platform: impl Into<String>, os_version: Version) -> Self {
        Self {
            platform: platform.into(),
            os_version,
        }
    }

    /// Query pairs describing this host for an application at `app_version`.
    ///
    /// Only sent with the feed request when the host opts in.
    pub fn system_profile(&self, app_version: &Version) -> Vec<(String, String)> {
        vec![
            ("platform".to_string(), self.platform.clone()),
            ("os_version".to_string(), self.os_version.to_string()),
            ("app_version".to_string(), app_version.to_string()),
        ]
    }

    /// Describe the running host.
    ///
    /// When the OS version cannot be determined it is left empty, which sorts
    /// below every bound: variants declaring a minimum OS version are then
    /// treated as inapplicable.
    pub fn current() -> Self {
        let os_version = detect_os_version().unwrap_or_else(|| Version::parse(""));
        tracing::debug!(platform = %current_platform(), os_version = %os_version, "Detected host environment");
        Self {
            platform: current_platform(),
            os_version,
        }
    }
}

/// Get the current platform string.
///
/// Returns a string like "windows-x86_64", "macos-aarch64", "linux-x86_64".
pub fn current_platform() -> String {
    let os = if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "unknown"
    };

    let arch = if cfg!(target_arch = "x86_64") {
        "x86_64"
    } else if cfg!(target_arch = "aarch64") {
        "aarch64"
    } else if cfg!(target_arch = "x86") {
        "x86"
    } else if cfg!(target_arch = "arm") {
        "arm"
    } else {
        "unknown"
    };

    format!("{}-{}", os, arch)
}

#[cfg(target_os = "linux")]
fn detect_os_version() -> Option<Version> {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease").ok()?;
    let release = release.trim();
    (!release.is_empty()).then(|| Version::parse(release))
}

#[cfg(target_os = "macos")]
fn detect_os_version() -> Option<Version> {
    let output = std::process::Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| Version::parse(text))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn detect_os_version() -> Option<Version> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_platform_shape() {
        let platform = current_platform();
        assert!(platform.contains('-'));
        assert!(!platform.starts_with('-'));
    }

    #[test]
    fn test_system_profile_pairs() {
        let host = HostEnvironment::new("macos-aarch64", Version::parse("14.4"));
        let profile = host.system_profile(&Version::parse("1.4.2"));
        assert_eq!(
            profile,
            vec![
                ("platform".to_string(), "macos-aarch64".to_string()),
                ("os_version".to_string(), "14.4".to_string()),
                ("app_version".to_string(), "1.4.2".to_string()),
            ]
        );
    }

    #[test]
    fn test_current_host_uses_current_platform() {
        let host = HostEnvironment::current();
        assert_eq!(host.platform, current_platform());
    }
}
