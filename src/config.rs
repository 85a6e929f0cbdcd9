//! Configuration for symbol acquisition.
//!
//! All tunables are collected into an immutable [`SymbolConfig`] value that
//! is produced once at startup (usually via [`SymbolConfig::from_env`]) and
//! threaded explicitly through the resolvers. Tests construct one through
//! [`SymbolConfigBuilder`].

use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

/// `User-Agent` sent to both providers.
pub const USER_AGENT: &str = "DebuggerMcp";

/// Enables/disables symbol download altogether. Everything except an
/// explicit `false` keeps it enabled.
pub const ENV_ENABLED: &str = "DATADOG_TRACE_SYMBOLS_ENABLED";
/// HTTP timeout in seconds, default 120.
pub const ENV_TIMEOUT_SECONDS: &str = "DATADOG_TRACE_SYMBOLS_TIMEOUT_SECONDS";
/// Per-artifact download cap in bytes, default 500 MiB.
pub const ENV_MAX_ARTIFACT_SIZE: &str = "DATADOG_TRACE_SYMBOLS_MAX_ARTIFACT_SIZE";
/// Directory for the persistent provider caches.
pub const ENV_CACHE_DIR: &str = "DATADOG_TRACE_SYMBOLS_CACHE_DIR";
/// Personal access token for the pipeline provider (HTTP Basic, empty user).
pub const ENV_AZURE_PAT: &str = "DATADOG_TRACE_SYMBOLS_PAT";
/// Tokens for the release provider, checked in this order.
pub const ENV_GITHUB_TOKENS: &[&str] = &["GITHUB_TOKEN", "GH_TOKEN"];

pub(crate) const DEFAULT_TIMEOUT_SECONDS: u64 = 120;
pub(crate) const DEFAULT_MAX_ARTIFACT_SIZE: u64 = 524_288_000;
pub(crate) const DEFAULT_CACHE_DIR_NAME: &str = ".datadog_symbols_cache";

/// Tunables for symbol resolution and download.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SymbolConfig {
    /// Whether symbol download is enabled at all.
    pub enabled: bool,
    /// Timeout applied to every HTTP request.
    pub timeout: Duration,
    /// Maximum size of a single downloaded artifact in bytes.
    pub max_artifact_size: u64,
    /// Directory holding the persistent provider caches.
    pub cache_dir: PathBuf,
    /// Optional personal access token for the pipeline provider.
    pub azure_token: Option<String>,
    /// Optional token for the release provider.
    pub github_token: Option<String>,
    /// Assemblies whose name starts with one of these prefixes are treated
    /// as instrumented and eligible for symbol download.
    pub instrumentation_prefixes: Vec<String>,
    /// Pipeline provider organization.
    pub organization: String,
    /// Pipeline provider project.
    pub project: String,
    /// Release provider repository owner.
    pub owner: String,
    /// Release provider repository name.
    pub repo: String,
}

impl SymbolConfig {
    /// Convenience function to call `SymbolConfigBuilder::default()`.
    pub fn builder() -> SymbolConfigBuilder {
        SymbolConfigBuilder::default()
    }

    /// Reads the configuration from the process environment.
    ///
    /// `dump_root` provides the default cache directory
    /// (`<dump-root>/.datadog_symbols_cache`) when [`ENV_CACHE_DIR`] is not
    /// set.
    pub fn from_env(dump_root: &Path) -> Self {
        let mut builder = Self::builder().cache_dir(
            env::var_os(ENV_CACHE_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| dump_root.join(DEFAULT_CACHE_DIR_NAME)),
        );

        if let Ok(enabled) = env::var(ENV_ENABLED) {
            builder = builder.enabled(!enabled.trim().eq_ignore_ascii_case("false"));
        }
        if let Some(secs) = env::var(ENV_TIMEOUT_SECONDS).ok().and_then(|v| v.trim().parse().ok())
        {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(max) = env::var(ENV_MAX_ARTIFACT_SIZE).ok().and_then(|v| v.trim().parse().ok())
        {
            builder = builder.max_artifact_size(max);
        }
        if let Ok(token) = env::var(ENV_AZURE_PAT) {
            if !token.is_empty() {
                builder = builder.azure_token(token);
            }
        }
        for var in ENV_GITHUB_TOKENS {
            if let Ok(token) = env::var(var) {
                if !token.is_empty() {
                    builder = builder.github_token(token);
                    break;
                }
            }
        }
        builder.build()
    }
}

/// Builder for [`SymbolConfig`].
#[derive(Clone, Debug)]
pub struct SymbolConfigBuilder {
    enabled: bool,
    timeout: Duration,
    max_artifact_size: u64,
    cache_dir: PathBuf,
    azure_token: Option<String>,
    github_token: Option<String>,
    instrumentation_prefixes: Vec<String>,
    organization: String,
    project: String,
    owner: String,
    repo: String,
}

impl Default for SymbolConfigBuilder {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            max_artifact_size: DEFAULT_MAX_ARTIFACT_SIZE,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR_NAME),
            azure_token: None,
            github_token: None,
            instrumentation_prefixes: vec!["Datadog.".to_string()],
            organization: "datadoghq".to_string(),
            project: "dd-trace-dotnet".to_string(),
            owner: "DataDog".to_string(),
            repo: "dd-trace-dotnet".to_string(),
        }
    }
}

impl SymbolConfigBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_artifact_size(mut self, max: u64) -> Self {
        self.max_artifact_size = max;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn azure_token(mut self, token: impl Into<String>) -> Self {
        self.azure_token = Some(token.into());
        self
    }

    pub fn github_token(mut self, token: impl Into<String>) -> Self {
        self.github_token = Some(token.into());
        self
    }

    pub fn instrumentation_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.instrumentation_prefixes = prefixes;
        self
    }

    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = organization.into();
        self
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = repo.into();
        self
    }

    pub fn build(self) -> SymbolConfig {
        let Self {
            enabled,
            timeout,
            max_artifact_size,
            cache_dir,
            azure_token,
            github_token,
            instrumentation_prefixes,
            organization,
            project,
            owner,
            repo,
        } = self;
        SymbolConfig {
            enabled,
            timeout,
            max_artifact_size,
            cache_dir,
            azure_token,
            github_token,
            instrumentation_prefixes,
            organization,
            project,
            owner,
            repo,
        }
    }
}
