//! Mapping from a dump's target platform to provider artifact names and the
//! on-disk symbol layout.
//!
//! Everything in this module is a pure function of the
//! [`PlatformDescriptor`]; the same descriptor always produces the same
//! suffix, artifact set and framework folder.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Operating system of the dumped process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Linux,
    Windows,
    Macos,
}

impl Os {
    /// Short name used as the leading artifact-name component.
    pub fn prefix(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Windows => "windows",
            Os::Macos => "osx",
        }
    }
}

/// Processor architecture, normalized to the canonical four.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X64,
    X86,
    Arm64,
    Arm,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::X86 => "x86",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x64" | "amd64" | "x86_64" => Ok(Arch::X64),
            "x86" | "i386" | "i686" => Ok(Arch::X86),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            "arm" | "armv7" => Ok(Arch::Arm),
            other => Err(format!("unsupported architecture: {other}")),
        }
    }
}

/// C library flavor, only meaningful on Linux.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Libc {
    Glibc,
    Musl,
}

/// Logical symbol bundles produced by the pipeline provider.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    TracerSymbols,
    ProfilerSymbols,
    MonitoringHome,
    UniversalSymbols,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::TracerSymbols => "tracer-symbols",
            ArtifactKind::ProfilerSymbols => "profiler-symbols",
            ArtifactKind::MonitoringHome => "monitoring-home",
            ArtifactKind::UniversalSymbols => "universal-symbols",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target platform of a crash dump.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PlatformDescriptor {
    pub os: Os,
    pub arch: Arch,
    pub libc: Option<Libc>,
    /// Alpine containers are musl even when the loader did not report a libc.
    pub is_alpine: bool,
    /// Raw target framework string from the dump, e.g. `".NET 6.0"`.
    pub framework: Option<String>,
}

impl PlatformDescriptor {
    pub fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch, libc: None, is_alpine: false, framework: None }
    }

    pub fn with_libc(mut self, libc: Libc) -> Self {
        self.libc = Some(libc);
        self
    }

    pub fn with_alpine(mut self, is_alpine: bool) -> Self {
        self.is_alpine = is_alpine;
        self
    }

    pub fn with_framework(mut self, framework: impl Into<String>) -> Self {
        self.framework = Some(framework.into());
        self
    }

    /// Whether the musl artifact flavor applies. Either signal (reported
    /// libc or Alpine detection) is sufficient.
    pub fn is_musl(&self) -> bool {
        self.libc == Some(Libc::Musl) || (self.os == Os::Linux && self.is_alpine)
    }

    /// Canonical platform suffix: `linux-x64`, `linux-musl-arm64`,
    /// `win-x86`, `osx-arm64`.
    pub fn suffix(&self) -> String {
        match self.os {
            Os::Linux if self.is_musl() => format!("linux-musl-{}", self.arch),
            Os::Linux => format!("linux-{}", self.arch),
            Os::Windows => format!("win-{}", self.arch),
            Os::Macos => format!("osx-{}", self.arch),
        }
    }

    /// The non-musl suffix, used by universal symbols which are built once
    /// per architecture.
    pub fn glibc_suffix(&self) -> String {
        match self.os {
            Os::Linux => format!("linux-{}", self.arch),
            Os::Windows => format!("win-{}", self.arch),
            Os::Macos => format!("osx-{}", self.arch),
        }
    }

    /// Provider artifact name for every kind that exists on this platform.
    ///
    /// Windows artifacts are arch-independent and carry fixed names; the
    /// other platforms suffix each kind with the platform suffix. Universal
    /// symbols exist on Linux only.
    pub fn artifact_names(&self) -> BTreeMap<ArtifactKind, String> {
        let mut names = BTreeMap::new();
        match self.os {
            Os::Windows => {
                names.insert(ArtifactKind::TracerSymbols, "windows-tracer-symbols".to_string());
                names.insert(ArtifactKind::ProfilerSymbols, "windows-profiler-symbols".to_string());
                names.insert(ArtifactKind::MonitoringHome, "windows-monitoring-home".to_string());
            }
            Os::Linux | Os::Macos => {
                let prefix = self.os.prefix();
                let suffix = self.suffix();
                for kind in [
                    ArtifactKind::TracerSymbols,
                    ArtifactKind::ProfilerSymbols,
                    ArtifactKind::MonitoringHome,
                ] {
                    names.insert(kind, format!("{prefix}-{kind}-{suffix}"));
                }
                if self.os == Os::Linux {
                    names.insert(
                        ArtifactKind::UniversalSymbols,
                        format!("{prefix}-universal-symbols-{}", self.glibc_suffix()),
                    );
                }
            }
        }
        names
    }

    /// Framework folder for this platform's dump, from the raw framework
    /// string when present, else the platform default.
    pub fn framework_folder(&self) -> &'static str {
        framework_folder(self.framework.as_deref())
    }
}

static RE_FRAMEWORK_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)(?:\.(\d+))?").unwrap());

/// Maps a raw target-framework string to the folder name managed symbols
/// live under.
///
/// The mapping is a closed table: majors 8–10 share `net8.0`, 5–7 share
/// `net6.0`, .NET Core 3.x is `netcoreapp3.1` and everything older or
/// unrecognized falls back to `netstandard2.0`. A missing framework string
/// defaults to `net6.0`.
pub fn framework_folder(framework: Option<&str>) -> &'static str {
    let Some(framework) = framework.map(str::trim).filter(|s| !s.is_empty()) else {
        return "net6.0";
    };
    let lower = framework.to_ascii_lowercase();
    if lower.contains("framework") {
        return "netstandard2.0";
    }
    let Some(caps) = RE_FRAMEWORK_VERSION.captures(&lower) else {
        return "netstandard2.0";
    };
    let major: u32 = caps[1].parse().unwrap_or(0);
    match major {
        8..=10 => "net8.0",
        5..=7 => "net6.0",
        3 if lower.contains("core") => "netcoreapp3.1",
        _ => "netstandard2.0",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn arch_normalization() {
        assert_eq!("amd64".parse::<Arch>().unwrap(), Arch::X64);
        assert_eq!("x86_64".parse::<Arch>().unwrap(), Arch::X64);
        assert_eq!("i386".parse::<Arch>().unwrap(), Arch::X86);
        assert_eq!("i686".parse::<Arch>().unwrap(), Arch::X86);
        assert_eq!("aarch64".parse::<Arch>().unwrap(), Arch::Arm64);
        assert_eq!("armv7".parse::<Arch>().unwrap(), Arch::Arm);
        assert!("mips".parse::<Arch>().is_err());
    }

    #[test]
    fn suffixes() {
        assert_eq!(PlatformDescriptor::new(Os::Linux, Arch::X64).suffix(), "linux-x64");
        assert_eq!(
            PlatformDescriptor::new(Os::Linux, Arch::X64).with_libc(Libc::Musl).suffix(),
            "linux-musl-x64"
        );
        assert_eq!(
            PlatformDescriptor::new(Os::Linux, Arch::Arm64).with_alpine(true).suffix(),
            "linux-musl-arm64"
        );
        assert_eq!(PlatformDescriptor::new(Os::Windows, Arch::X86).suffix(), "win-x86");
        assert_eq!(PlatformDescriptor::new(Os::Macos, Arch::Arm64).suffix(), "osx-arm64");
    }

    #[test]
    fn alpine_arm64_artifact_names() {
        let desc = PlatformDescriptor::new(Os::Linux, Arch::Arm64)
            .with_libc(Libc::Musl)
            .with_framework(".NET 6.0");
        assert_eq!(desc.suffix(), "linux-musl-arm64");

        let names = desc.artifact_names();
        assert_eq!(
            names[&ArtifactKind::TracerSymbols],
            "linux-tracer-symbols-linux-musl-arm64"
        );
        assert_eq!(
            names[&ArtifactKind::ProfilerSymbols],
            "linux-profiler-symbols-linux-musl-arm64"
        );
        assert_eq!(
            names[&ArtifactKind::MonitoringHome],
            "linux-monitoring-home-linux-musl-arm64"
        );
        // universal symbols never use the musl flavor
        assert_eq!(
            names[&ArtifactKind::UniversalSymbols],
            "linux-universal-symbols-linux-arm64"
        );
        assert_eq!(desc.framework_folder(), "net6.0");
    }

    #[test]
    fn windows_artifact_names_are_fixed() {
        for arch in [Arch::X64, Arch::X86, Arch::Arm64] {
            let names = PlatformDescriptor::new(Os::Windows, arch).artifact_names();
            assert_eq!(names.len(), 3);
            assert_eq!(names[&ArtifactKind::TracerSymbols], "windows-tracer-symbols");
            assert_eq!(names[&ArtifactKind::ProfilerSymbols], "windows-profiler-symbols");
            assert_eq!(names[&ArtifactKind::MonitoringHome], "windows-monitoring-home");
        }
    }

    #[test]
    fn macos_has_no_universal_symbols() {
        let names = PlatformDescriptor::new(Os::Macos, Arch::Arm64).artifact_names();
        assert_eq!(names.len(), 3);
        assert_eq!(names[&ArtifactKind::TracerSymbols], "osx-tracer-symbols-osx-arm64");
        assert!(!names.contains_key(&ArtifactKind::UniversalSymbols));
    }

    #[test]
    fn framework_folder_table() {
        assert_eq!(framework_folder(Some(".NET 8.0")), "net8.0");
        assert_eq!(framework_folder(Some(".NET 9.0")), "net8.0");
        assert_eq!(framework_folder(Some(".NET 10.0")), "net8.0");
        assert_eq!(framework_folder(Some(".NET 5.0")), "net6.0");
        assert_eq!(framework_folder(Some(".NET 6.0")), "net6.0");
        assert_eq!(framework_folder(Some(".NET 7.0")), "net6.0");
        assert_eq!(framework_folder(Some(".NETCoreApp,Version=v3.1")), "netcoreapp3.1");
        assert_eq!(framework_folder(Some(".NET Core 3.0")), "netcoreapp3.1");
        assert_eq!(framework_folder(Some(".NET Core 2.1")), "netstandard2.0");
        assert_eq!(framework_folder(Some(".NET Framework 4.6.1")), "netstandard2.0");
        assert_eq!(framework_folder(Some("something weird")), "netstandard2.0");
        assert_eq!(framework_folder(Some("")), "net6.0");
        assert_eq!(framework_folder(None), "net6.0");
    }
}
