//! Assembly identity extracted from a crash dump.
//!
//! Instrumented assemblies embed their build provenance in the informational
//! version string (`3.31.0+14fd3a2f…`). This module derives the commit and
//! release version that key all provider lookups.

use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};

/// Attribute kinds recognized on scanned modules. Unknown attribute types
/// are ignored rather than rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AttributeKind {
    InformationalVersion,
    Metadata,
    TargetFramework,
}

impl AttributeKind {
    /// Matches a fully qualified attribute type name by suffix, e.g. both
    /// `AssemblyInformationalVersionAttribute` and
    /// `System.Reflection.AssemblyInformationalVersionAttribute`.
    pub fn from_type_name(type_name: &str) -> Option<Self> {
        if type_name.ends_with("AssemblyInformationalVersionAttribute") {
            Some(AttributeKind::InformationalVersion)
        } else if type_name.ends_with("AssemblyMetadataAttribute") {
            Some(AttributeKind::Metadata)
        } else if type_name.ends_with("TargetFrameworkAttribute") {
            Some(AttributeKind::TargetFramework)
        } else {
            None
        }
    }
}

/// A single custom attribute reported by the dump analyzer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModuleAttribute {
    #[serde(rename = "type")]
    pub attribute_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub value: String,
}

/// A module and its attribute collection, as reported by the dump analyzer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<ModuleAttribute>,
}

/// Identity of an instrumented assembly found in a dump.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AssemblyIdentity {
    pub name: String,
    pub informational_version: String,
    /// Release version parsed from the informational version, when it has a
    /// semver shape.
    pub version: Option<Version>,
    /// Lowercase hex commit, at least 7 chars, or `None` when the assembly
    /// is ineligible for commit-keyed lookup.
    pub commit_sha: Option<String>,
    pub target_framework: Option<String>,
    pub repository_url: Option<String>,
}

impl AssemblyIdentity {
    /// Builds an identity from a scanned module, returning `None` when the
    /// module carries no informational version at all.
    pub fn from_module(module: &ModuleInfo) -> Option<Self> {
        let mut informational_version = None;
        let mut target_framework = None;
        let mut repository_url = None;

        for attr in &module.attributes {
            match AttributeKind::from_type_name(&attr.attribute_type) {
                Some(AttributeKind::InformationalVersion) => {
                    informational_version.get_or_insert_with(|| attr.value.clone());
                }
                Some(AttributeKind::Metadata) => {
                    if attr.key.as_deref() == Some("RepositoryUrl") {
                        repository_url.get_or_insert_with(|| attr.value.clone());
                    }
                }
                Some(AttributeKind::TargetFramework) => {
                    target_framework.get_or_insert_with(|| attr.value.clone());
                }
                None => {}
            }
        }

        let informational_version = informational_version?;
        let commit_sha = extract_commit_sha(&informational_version);
        let version = extract_version(&informational_version);
        Some(Self {
            name: module.name.clone(),
            informational_version,
            version,
            commit_sha,
            target_framework,
            repository_url,
        })
    }

    /// Whether this assembly can be looked up by commit.
    pub fn has_commit(&self) -> bool {
        self.commit_sha.is_some()
    }
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Derives the commit SHA embedded in an informational version string.
///
/// The commit follows a `+` (`3.31.0+14fd3a2f`) or the last `.`
/// (`3.31.0.14fd3a2f9c`). In the `+` form any trailing non-hex decoration
/// is stripped; in the `.` form the final segment must be pure hex, since a
/// decorated segment there is a prerelease label rather than a commit. The
/// result is lowercased and must be at least 7 hex chars.
pub fn extract_commit_sha(informational_version: &str) -> Option<String> {
    let value = informational_version.trim();

    let candidate = if let Some((_, after)) = value.split_once('+') {
        let hex_len = after.bytes().take_while(|b| b.is_ascii_hexdigit()).count();
        &after[..hex_len]
    } else if let Some((_, after)) = value.rsplit_once('.') {
        if is_hex(after) {
            after
        } else {
            return None;
        }
    } else if is_hex(value) {
        // already a bare commit, extraction is idempotent
        value
    } else {
        return None;
    };

    if candidate.len() >= 7 && is_hex(candidate) {
        Some(candidate.to_ascii_lowercase())
    } else {
        None
    }
}

static RE_VERSION_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+").unwrap());

/// Parses the release version at the head of an informational version.
pub fn extract_version(informational_version: &str) -> Option<Version> {
    let value = informational_version.trim();
    let head = value.split('+').next().unwrap_or(value);
    if let Ok(version) = Version::parse(head) {
        return Some(version);
    }
    let m = RE_VERSION_PREFIX.find(head)?;
    Version::parse(m.as_str()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn commit_after_plus() {
        assert_eq!(extract_commit_sha("3.31.0+14FD3A2F"), Some("14fd3a2f".to_string()));
        assert_eq!(
            extract_commit_sha("3.31.0+abc123def456-ci"),
            Some("abc123def456".to_string())
        );
        // too short after stripping
        assert_eq!(extract_commit_sha("3.31.0+abc12"), None);
    }

    #[test]
    fn commit_after_last_dot() {
        assert_eq!(extract_commit_sha("3.31.0.abc123def456"), Some("abc123def456".to_string()));
        // the last segment is a plain number, not a commit
        assert_eq!(extract_commit_sha("3.31.0"), None);
        // decorated segments after a dot are prerelease labels, not commits
        assert_eq!(extract_commit_sha("3.31.0.abc123def456-extra"), None);
    }

    #[test]
    fn extraction_is_idempotent() {
        let first = extract_commit_sha("3.31.0+14FD3A2F").unwrap();
        assert_eq!(extract_commit_sha(&first), Some(first.clone()));
    }

    #[test]
    fn version_prefix() {
        assert_eq!(extract_version("3.31.0+14fd3a2f"), Some(Version::new(3, 31, 0)));
        assert_eq!(extract_version("3.31.0.abc123def456"), Some(Version::new(3, 31, 0)));
        assert_eq!(extract_version("2.0.1-beta+sha"), Version::parse("2.0.1-beta").ok());
        assert_eq!(extract_version("garbage"), None);
    }

    #[test]
    fn attribute_suffix_matching() {
        assert_eq!(
            AttributeKind::from_type_name(
                "System.Reflection.AssemblyInformationalVersionAttribute"
            ),
            Some(AttributeKind::InformationalVersion)
        );
        assert_eq!(
            AttributeKind::from_type_name("AssemblyMetadataAttribute"),
            Some(AttributeKind::Metadata)
        );
        assert_eq!(
            AttributeKind::from_type_name(
                "System.Runtime.Versioning.TargetFrameworkAttribute"
            ),
            Some(AttributeKind::TargetFramework)
        );
        assert_eq!(AttributeKind::from_type_name("SomethingElseAttribute"), None);
    }

    #[test]
    fn identity_from_module() {
        let module = ModuleInfo {
            name: "Datadog.Trace".to_string(),
            attributes: vec![
                ModuleAttribute {
                    attribute_type: "System.Reflection.AssemblyInformationalVersionAttribute"
                        .to_string(),
                    key: None,
                    value: "3.31.0+14fd3a2f9c0ddeadbeef".to_string(),
                },
                ModuleAttribute {
                    attribute_type: "System.Reflection.AssemblyMetadataAttribute".to_string(),
                    key: Some("RepositoryUrl".to_string()),
                    value: "https://github.com/DataDog/dd-trace-dotnet".to_string(),
                },
                ModuleAttribute {
                    attribute_type: "System.Runtime.Versioning.TargetFrameworkAttribute"
                        .to_string(),
                    key: None,
                    value: ".NETCoreApp,Version=v6.0".to_string(),
                },
            ],
        };

        let identity = AssemblyIdentity::from_module(&module).unwrap();
        assert_eq!(identity.name, "Datadog.Trace");
        assert_eq!(identity.commit_sha.as_deref(), Some("14fd3a2f9c0ddeadbeef"));
        assert_eq!(identity.version, Some(Version::new(3, 31, 0)));
        assert_eq!(
            identity.repository_url.as_deref(),
            Some("https://github.com/DataDog/dd-trace-dotnet")
        );
        assert_eq!(identity.target_framework.as_deref(), Some(".NETCoreApp,Version=v6.0"));
        assert!(identity.has_commit());
    }

    #[test]
    fn module_without_informational_version() {
        let module = ModuleInfo { name: "Datadog.Profiler".to_string(), attributes: vec![] };
        assert!(AssemblyIdentity::from_module(&module).is_none());
    }
}
