//! Orchestration of a full symbol preparation.
//!
//! Scans the dump for instrumented assemblies, derives the commit and
//! framework, drives the two providers in a fixed fallback order and
//! finally derives the debugger commands that load the merged layout.

use crate::{
    config::SymbolConfig,
    error::{Result, SymbolError},
    identity::{AssemblyIdentity, ModuleInfo},
    merge::MergeResult,
    platform::{self, PlatformDescriptor},
    providers::{http_client, AzurePipelinesResolver, DownloadResult, GitHubReleasesResolver},
    utils::CancelToken,
};
use semver::Version;
use serde::Serialize;
use std::{
    fmt,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// Read access to the crash dump, provided by the session layer.
pub trait DumpAnalyzer {
    /// Every module in the dump together with its assembly-level
    /// attributes.
    fn modules_with_attributes(&self) -> Result<Vec<ModuleInfo>>;
}

/// Executes debugger commands, provided by the debugger adapter.
pub trait DebuggerBridge {
    fn execute(&mut self, command: &str) -> Result<String>;
}

/// One step of the provider fallback chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum FallbackStep {
    PipelineByCommit,
    ReleaseByCommit,
    PipelineByVersion,
    ReleaseByVersion,
}

impl FallbackStep {
    /// Version-tag steps may hand back symbols from a close-but-different
    /// build.
    fn is_version_fallback(&self) -> bool {
        matches!(self, FallbackStep::PipelineByVersion | FallbackStep::ReleaseByVersion)
    }
}

impl fmt::Display for FallbackStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FallbackStep::PipelineByCommit => "pipeline build by commit",
            FallbackStep::ReleaseByCommit => "release by commit",
            FallbackStep::PipelineByVersion => "pipeline build by version tag",
            FallbackStep::ReleaseByVersion => "release by version tag",
        };
        f.write_str(name)
    }
}

/// Why one fallback step did not produce symbols.
#[derive(Clone, Debug, Serialize)]
pub struct StepFailure {
    pub step: FallbackStep,
    pub reason: String,
}

/// Structured outcome of [`SymbolPreparer::prepare_symbols`].
#[derive(Debug, Default)]
pub struct PreparationResult {
    pub success: bool,
    pub message: String,
    /// Set when symbols came from a version-tag fallback and may not match
    /// the dumped binaries exactly.
    pub sha_mismatch: bool,
    pub commit_sha: Option<String>,
    pub version: Option<Version>,
    /// Instrumented assemblies found in the dump.
    pub assemblies: Vec<AssemblyIdentity>,
    /// Root of the merged symbol layout.
    pub root: Option<PathBuf>,
    pub merge: Option<MergeResult>,
    /// Failure reason per attempted fallback step.
    pub failures: Vec<StepFailure>,
    /// Debugger commands that ran without raising.
    pub commands_executed: usize,
    pub symbols_loaded: bool,
}

impl PreparationResult {
    /// A run that found nothing to do; not an error.
    fn benign(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into(), ..Default::default() }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), ..Default::default() }
    }
}

/// Prefer the main tracer assembly, else the first instrumented one.
fn select_primary(assemblies: &[AssemblyIdentity]) -> Option<&AssemblyIdentity> {
    assemblies
        .iter()
        .find(|a| a.name == "Datadog.Trace")
        .or_else(|| assemblies.first())
}

/// The deterministic command list that loads a layout into the debugger:
/// a native search path, one `symbols add` per debug file, and the managed
/// directory as a symbol server.
fn derive_debugger_commands(root: &Path, suffix: &str, framework_folder: &str) -> Vec<String> {
    let mut commands = Vec::new();
    let native_dir = root.join(suffix);
    if native_dir.is_dir() {
        commands.push(format!("search-path append {}", native_dir.display()));
    }
    let mut debug_files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension().map(|ext| ext.eq_ignore_ascii_case("debug")).unwrap_or(false)
        })
        .collect();
    debug_files.sort();
    for file in debug_files {
        commands.push(format!("symbols add {}", file.display()));
    }
    let managed_dir = root.join(framework_folder);
    if managed_dir.is_dir() {
        commands.push(format!("symbol-server directory {}", managed_dir.display()));
    }
    commands
}

/// Drives the whole symbol acquisition for one dump.
///
/// Owns both provider resolvers (which own their caches) and the shared
/// cancellation token. The two resolvers share one HTTP client handle.
#[derive(Debug)]
pub struct SymbolPreparer {
    config: SymbolConfig,
    pipeline: AzurePipelinesResolver,
    releases: GitHubReleasesResolver,
    cancel: CancelToken,
}

impl SymbolPreparer {
    pub fn new(config: SymbolConfig) -> Result<Self> {
        let client = http_client(&config)?;
        let pipeline = AzurePipelinesResolver::with_client(config.clone(), client.clone());
        let releases = GitHubReleasesResolver::with_client(config.clone(), client);
        Ok(Self { config, pipeline, releases, cancel: CancelToken::new() })
    }

    /// A clone of the cancellation token observed by every suspendable
    /// operation of this preparer.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Flushes all persistent caches.
    pub fn save_caches(&mut self) {
        self.pipeline.save_caches();
        self.releases.save_caches();
    }

    /// Prepares symbols for the dump described by `analyzer`.
    ///
    /// Phases: scan the dump for instrumented assemblies, pick the primary
    /// one, walk the provider fallback chain, and optionally load the
    /// resulting layout through `bridge`.
    pub async fn prepare_symbols(
        &mut self,
        analyzer: &dyn DumpAnalyzer,
        platform: &PlatformDescriptor,
        output_dir: &Path,
        bridge: &mut dyn DebuggerBridge,
        load_into_debugger: bool,
        force_version: bool,
    ) -> PreparationResult {
        if !self.config.enabled {
            return PreparationResult::benign("symbol download is disabled by configuration");
        }

        // phase A: scan
        let modules = match analyzer.modules_with_attributes() {
            Ok(modules) => modules,
            Err(err) => return PreparationResult::failed(format!("failed to scan dump: {err}")),
        };
        let assemblies: Vec<AssemblyIdentity> = modules
            .iter()
            .filter(|m| {
                self.config.instrumentation_prefixes.iter().any(|p| m.name.starts_with(p.as_str()))
            })
            .filter_map(AssemblyIdentity::from_module)
            .collect();
        if assemblies.is_empty() {
            return PreparationResult::benign("no instrumented assemblies found in the dump");
        }
        let eligible: Vec<AssemblyIdentity> =
            assemblies.iter().filter(|a| a.has_commit()).cloned().collect();
        if eligible.is_empty() {
            let mut result = PreparationResult::benign(
                "no commit could be derived from the instrumented assemblies",
            );
            result.assemblies = assemblies;
            return result;
        }

        // phase B: primary assembly and framework folder
        let primary = select_primary(&eligible).expect("eligible is non-empty").clone();
        let commit = primary.commit_sha.clone().expect("eligible implies commit");
        let version = primary.version.clone();
        let framework_folder = match primary.target_framework.as_deref() {
            Some(framework) => platform::framework_folder(Some(framework)),
            None => platform.framework_folder(),
        };
        let suffix = platform.suffix();
        info!(
            "preparing symbols for {} {} (commit {commit}, {suffix}, {framework_folder})",
            primary.name, primary.informational_version
        );

        // phase C: fallback chain
        let mut failures = Vec::new();
        let mut outcome: Option<(DownloadResult, FallbackStep)> = None;
        for step in [
            FallbackStep::PipelineByCommit,
            FallbackStep::ReleaseByCommit,
            FallbackStep::PipelineByVersion,
            FallbackStep::ReleaseByVersion,
        ] {
            if step.is_version_fallback() && (!force_version || version.is_none()) {
                continue;
            }
            match self
                .run_step(step, &commit, version.as_ref(), platform, output_dir, framework_folder)
                .await
            {
                Ok(download) => {
                    info!("{step} produced symbols at \"{}\"", download.root.display());
                    outcome = Some((download, step));
                    break;
                }
                Err(err) => {
                    debug!("{step} failed: {err}");
                    failures.push(StepFailure { step, reason: err.to_string() });
                }
            }
        }
        self.save_caches();

        let Some((download, step)) = outcome else {
            let mut message = format!("failed to prepare symbols for commit {commit}: ");
            let reasons: Vec<String> =
                failures.iter().map(|f| format!("{}: {}", f.step, f.reason)).collect();
            message.push_str(&reasons.join("; "));
            if !force_version && version.is_some() {
                message.push_str("; retry with force_version to fall back to the release version");
            }
            return PreparationResult {
                commit_sha: Some(commit),
                version,
                assemblies,
                failures,
                ..PreparationResult::failed(message)
            };
        };

        let sha_mismatch = step.is_version_fallback();
        let mut result = PreparationResult {
            success: true,
            message: if sha_mismatch {
                format!(
                    "symbols for version {} prepared at \"{}\"; they were found by version tag and may not exactly match the dumped binaries",
                    version.as_ref().expect("version fallback ran"),
                    download.root.display()
                )
            } else {
                format!("symbols for commit {commit} prepared at \"{}\"", download.root.display())
            },
            sha_mismatch,
            commit_sha: Some(commit.clone()),
            version,
            assemblies,
            root: Some(download.root.clone()),
            merge: download.merge,
            failures,
            commands_executed: 0,
            symbols_loaded: false,
        };

        // phase D: load into the debugger
        if load_into_debugger {
            let commands = derive_debugger_commands(&download.root, &suffix, framework_folder);
            for command in &commands {
                match bridge.execute(command) {
                    Ok(_) => result.commands_executed += 1,
                    Err(err) => warn!("debugger command \"{command}\" failed: {err}"),
                }
            }
            result.symbols_loaded = result.commands_executed > 0;
            if !commands.is_empty() && result.commands_executed == 0 {
                result.message.push_str("; no debugger command could be executed");
            }
        }
        result
    }

    async fn run_step(
        &mut self,
        step: FallbackStep,
        commit: &str,
        version: Option<&Version>,
        platform: &PlatformDescriptor,
        output_dir: &Path,
        framework_folder: &str,
    ) -> Result<DownloadResult> {
        let download = match step {
            FallbackStep::PipelineByCommit => {
                self.pipeline
                    .download_symbols(
                        commit,
                        platform,
                        output_dir,
                        framework_folder,
                        None,
                        None,
                        &self.cancel,
                    )
                    .await?
            }
            FallbackStep::PipelineByVersion => {
                self.pipeline
                    .download_symbols(
                        commit,
                        platform,
                        output_dir,
                        framework_folder,
                        version,
                        None,
                        &self.cancel,
                    )
                    .await?
            }
            FallbackStep::ReleaseByCommit | FallbackStep::ReleaseByVersion => {
                let release = match step {
                    FallbackStep::ReleaseByCommit => {
                        self.releases.find_release_by_commit(commit).await?
                    }
                    _ => {
                        let version = version.expect("version fallback requires a version");
                        self.releases.find_release_by_version(version).await?
                    }
                };
                let release = release.ok_or_else(|| {
                    SymbolError::NotFound(format!("no release found for commit {commit}"))
                })?;
                let download = self
                    .releases
                    .download_symbols(&release, platform, output_dir, framework_folder, &self.cancel)
                    .await?;
                if download_succeeded(&download) {
                    self.pipeline.record_downloaded(
                        commit,
                        &platform.suffix(),
                        download.root.clone(),
                    );
                }
                download
            }
        };

        if download_succeeded(&download) {
            Ok(download)
        } else {
            let reason = download
                .merge
                .as_ref()
                .and_then(|m| m.error.clone())
                .unwrap_or_else(|| "no symbol files were extracted".to_string());
            Err(SymbolError::msg(reason))
        }
    }
}

fn download_succeeded(download: &DownloadResult) -> bool {
    download.reused
        || download
            .merge
            .as_ref()
            .map(|m| m.success && m.extracted_count > 0)
            .unwrap_or(false)
}
