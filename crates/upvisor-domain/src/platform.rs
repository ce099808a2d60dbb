use std::{env, fmt, str::FromStr};

/// Key that matches every platform in a `binaries` map.
pub const ANY_PLATFORM: &str = "any";

/// `<os>/<arch>` pair used to pick a download out of a multi-platform `binaries` map.
///
/// Names follow the convention release tooling for node daemons publishes under
/// (`linux/amd64`, `darwin/arm64`, ...), not Rust's target triple vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlatformKey {
    os: String,
    arch: String,
}

impl PlatformKey {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Platform of the running process.
    pub fn current() -> Self {
        Self::new(release_os(env::consts::OS), release_arch(env::consts::ARCH))
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }
}

impl fmt::Display for PlatformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

impl FromStr for PlatformKey {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (os, arch) = raw
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("platform must look like '<os>/<arch>' (got '{raw}')"))?;
        if os.is_empty() || arch.is_empty() || arch.contains('/') {
            return Err(format!(
                "platform must look like '<os>/<arch>' (got '{raw}')"
            ));
        }
        Ok(Self::new(os, arch))
    }
}

fn release_os(os: &str) -> &str {
    match os {
        "macos" => "darwin",
        other => other,
    }
}

fn release_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64",
        "loongarch64" => "loong64",
        other => other,
    }
}
