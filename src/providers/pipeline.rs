//! Pipeline provider: resolves CI builds and downloads their symbol
//! artifacts.
//!
//! Builds are found by commit (`sourceVersion`) with an optional
//! version-tag fallback over the release ref spellings, artifacts are
//! streamed as zips into a scratch directory and merged into the symbol
//! layout. Lookup outcomes are cached persistently, including negative
//! ones.

use super::{commit_matches, http_client, stream_to_file, DownloadResult};
use crate::{
    cache::{self, DownloadedSymbolsIndex, PersistentCache},
    config::SymbolConfig,
    error::{Result, SymbolError},
    merge,
    platform::PlatformDescriptor,
    utils::{CancelToken, TempDirGuard},
};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// Base URL of the pipeline provider.
pub const AZURE_DEVOPS_BASE: &str = "https://dev.azure.com";
/// API version sent with every request.
pub const API_VERSION: &str = "7.1";

/// Scratch directory for artifact downloads, removed on unwind.
const TEMP_DOWNLOAD_DIR: &str = ".temp_download";

/// A CI build as reported by the build list endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    pub id: u64,
    #[serde(default, rename = "buildNumber")]
    pub number: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub source_version: Option<String>,
    #[serde(default)]
    pub source_branch: Option<String>,
    #[serde(default)]
    pub queue_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default, rename = "_links")]
    links: BuildLinks,
}

impl BuildRecord {
    /// The human-facing build page, when the provider reported one.
    pub fn web_url(&self) -> Option<&str> {
        self.links.web.as_ref().map(|l| l.href.as_str())
    }

    pub fn succeeded(&self) -> bool {
        self.result.as_deref() == Some("succeeded")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct BuildLinks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    web: Option<Link>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Link {
    href: String,
}

/// One published artifact of a build.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildArtifact {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub resource: Option<ArtifactResource>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactResource {
    #[serde(default)]
    pub download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

/// The release ref spellings tried, in order, when a build is looked up by
/// version instead of commit.
fn ref_candidates(version: &Version) -> Vec<String> {
    [
        format!("refs/tags/v{version}"),
        format!("refs/tags/{version}"),
        format!("refs/heads/release/{version}"),
        format!("refs/heads/release/v{version}"),
        format!("refs/heads/releases/{version}"),
        format!("refs/heads/releases/v{version}"),
        format!("refs/heads/release-{version}"),
        format!("refs/heads/v{version}"),
    ]
    .into()
}

/// Among the builds returned for a commit query, the one whose source
/// version actually matches.
fn select_build_by_commit(builds: Vec<BuildRecord>, commit: &str) -> Option<BuildRecord> {
    builds
        .into_iter()
        .find(|b| b.source_version.as_deref().map(|v| commit_matches(v, commit)).unwrap_or(false))
}

/// Among the builds of a release ref, prefer the commit match, else the
/// first successful one.
fn select_build_by_ref(builds: &[BuildRecord], commit: &str) -> Option<BuildRecord> {
    builds
        .iter()
        .find(|b| b.source_version.as_deref().map(|v| commit_matches(v, commit)).unwrap_or(false))
        .or_else(|| builds.iter().find(|b| b.succeeded()))
        .cloned()
}

/// Resolver for the pipeline provider.
///
/// Owns the persistent build cache and the downloaded-symbols index; the
/// HTTP client is either owned (built from config) or borrowed as a shared
/// handle.
#[derive(Debug)]
pub struct AzurePipelinesResolver {
    client: reqwest::Client,
    config: SymbolConfig,
    builds: PersistentCache<BuildRecord>,
    index: DownloadedSymbolsIndex,
}

impl AzurePipelinesResolver {
    /// Creates a resolver owning its HTTP client.
    pub fn new(config: SymbolConfig) -> Result<Self> {
        let client = http_client(&config)?;
        Ok(Self::with_client(config, client))
    }

    /// Creates a resolver over an externally managed client handle.
    pub fn with_client(config: SymbolConfig, client: reqwest::Client) -> Self {
        let builds =
            PersistentCache::load(&config.cache_dir, cache::BUILD_CACHE_FILENAME, cache::lookup_ttl());
        let index = DownloadedSymbolsIndex::load(&config.cache_dir);
        Self { client, config, builds, index }
    }

    /// Flushes the build cache and the downloaded-symbols index.
    pub fn save_caches(&mut self) {
        self.builds.save();
        self.index.save();
    }

    /// Returns the already-merged layout for `(commit, suffix)`, if the
    /// index knows one that still exists.
    pub fn lookup_downloaded(&mut self, commit: &str, suffix: &str) -> Option<PathBuf> {
        self.index.get(commit, suffix)
    }

    /// Records a merged layout, regardless of which provider produced it.
    pub fn record_downloaded(&mut self, commit: &str, suffix: &str, root: PathBuf) {
        self.index.insert(commit, suffix, root);
        self.index.save();
    }

    fn cache_key(organization: &str, project: &str, commit: &str) -> String {
        format!("{organization}/{project}/{commit}")
    }

    fn builds_url(&self, organization: &str, project: &str) -> String {
        format!("{AZURE_DEVOPS_BASE}/{organization}/{project}/_apis/build/builds")
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let mut request = self.client.get(url).query(query);
        if let Some(token) = &self.config.azure_token {
            request = request.basic_auth("", Some(token));
        }
        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Err(SymbolError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(SymbolError::Status { status: status.as_u16(), url: url.to_string() });
        }
        Ok(response.json().await?)
    }

    /// Finds the build for `commit`, cache first.
    ///
    /// A cached build whose source version no longer matches the commit is
    /// invalidated. A fresh negative entry suppresses the commit query; it
    /// is only bypassed when `version` enables the release-ref fallback,
    /// and a build found that way replaces the negative entry.
    pub async fn find_build_by_commit(
        &mut self,
        organization: &str,
        project: &str,
        commit: &str,
        version: Option<&Version>,
    ) -> Result<Option<BuildRecord>> {
        let key = Self::cache_key(organization, project, commit);
        let mut negative_hit = false;
        match self.builds.try_get(&key) {
            Some(Some(build)) => {
                let matches = build
                    .source_version
                    .as_deref()
                    .map(|v| commit_matches(v, commit))
                    .unwrap_or(false);
                if matches {
                    trace!("build cache hit for {key}");
                    return Ok(Some(build.clone()));
                }
                debug!("invalidating cached build with mismatched source version for {key}");
                self.builds.remove(&key);
            }
            Some(None) => {
                trace!("negative build cache hit for {key}");
                if version.is_none() {
                    return Ok(None);
                }
                negative_hit = true;
            }
            None => {}
        }

        let url = self.builds_url(organization, project);

        if !negative_hit {
            let list: ListResponse<BuildRecord> = self
                .get_json(&url, &[("sourceVersion", commit), ("api-version", API_VERSION)])
                .await?;
            if let Some(build) = select_build_by_commit(list.value, commit) {
                self.builds.insert(&key, Some(build.clone()));
                return Ok(Some(build));
            }
            if version.is_none() {
                self.builds.insert(&key, None);
                return Ok(None);
            }
        }

        // forced fallback over the release ref spellings
        let version = version.expect("checked above");
        for branch in ref_candidates(version) {
            debug!("querying builds for ref \"{branch}\"");
            let list: ListResponse<BuildRecord> = self
                .get_json(
                    &url,
                    &[("branchName", branch.as_str()), ("$top", "5"), ("api-version", API_VERSION)],
                )
                .await?;
            if let Some(build) = select_build_by_ref(&list.value, commit) {
                self.builds.insert(&key, Some(build.clone()));
                return Ok(Some(build));
            }
        }
        Ok(None)
    }

    /// Lists the artifacts published by a build.
    pub async fn list_artifacts(
        &self,
        organization: &str,
        project: &str,
        build_id: u64,
    ) -> Result<Vec<BuildArtifact>> {
        let url = format!("{}/{build_id}/artifacts", self.builds_url(organization, project));
        let list: ListResponse<BuildArtifact> =
            self.get_json(&url, &[("api-version", API_VERSION)]).await?;
        Ok(list.value)
    }

    /// Streams the named artifact zip into `out_dir`.
    ///
    /// Returns `Ok(None)` when the build does not publish the artifact; a
    /// missing artifact is not an error because not every platform produces
    /// every kind.
    pub async fn download_artifact(
        &self,
        organization: &str,
        project: &str,
        build_id: u64,
        name: &str,
        out_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<Option<PathBuf>> {
        let url = format!("{}/{build_id}/artifacts", self.builds_url(organization, project));
        let mut request = self.client.get(&url).query(&[
            ("artifactName", name),
            ("$format", "zip"),
            ("api-version", API_VERSION),
        ]);
        if let Some(token) = &self.config.azure_token {
            request = request.basic_auth("", Some(token));
        }
        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 404 {
            debug!("build {build_id} has no artifact \"{name}\"");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SymbolError::Status { status: status.as_u16(), url });
        }

        let dest = out_dir.join(format!("{name}.zip"));
        stream_to_file(response, &dest, self.config.max_artifact_size, cancel).await?;
        debug!("downloaded artifact \"{name}\" to \"{}\"", dest.display());
        Ok(Some(dest))
    }

    /// Downloads and merges every artifact the platform maps for `commit`.
    ///
    /// The downloaded-symbols index short-circuits the whole operation when
    /// a verified layout already exists. Artifact downloads run
    /// concurrently; merging waits for all of them.
    #[allow(clippy::too_many_arguments)]
    pub async fn download_symbols(
        &mut self,
        commit: &str,
        platform: &PlatformDescriptor,
        out_dir: &Path,
        framework_folder: &str,
        version: Option<&Version>,
        force_build_id: Option<u64>,
        cancel: &CancelToken,
    ) -> Result<DownloadResult> {
        let suffix = platform.suffix();
        if let Some(root) = self.index.get(commit, &suffix) {
            info!("reusing downloaded symbols for {commit} ({suffix}) at \"{}\"", root.display());
            return Ok(DownloadResult { root, merge: None, reused: true });
        }

        let organization = self.config.organization.clone();
        let project = self.config.project.clone();
        let build_id = match force_build_id {
            Some(id) => id,
            None => self
                .find_build_by_commit(&organization, &project, commit, version)
                .await?
                .map(|build| build.id)
                .ok_or_else(|| {
                    SymbolError::NotFound(format!("no build found for commit {commit}"))
                })?,
        };

        let names = platform.artifact_names();
        let scratch = TempDirGuard::create(out_dir.join(TEMP_DOWNLOAD_DIR))?;
        let scratch_dir = scratch.path();

        let this = &*self;
        let downloads = join_all(names.iter().map(|(kind, name)| {
            let organization = organization.as_str();
            let project = project.as_str();
            async move {
                let result = this
                    .download_artifact(organization, project, build_id, name, scratch_dir, cancel)
                    .await;
                (*kind, name.clone(), result)
            }
        }))
        .await;

        let mut archives = BTreeMap::new();
        let mut first_error = None;
        for (kind, name, result) in downloads {
            match result {
                Ok(Some(path)) => {
                    archives.insert(kind, path);
                }
                Ok(None) => {}
                Err(err) => {
                    if matches!(err, SymbolError::Cancelled) {
                        return Err(err);
                    }
                    warn!("failed to download artifact \"{name}\": {err}");
                    first_error.get_or_insert(err);
                }
            }
        }
        if archives.is_empty() {
            return Err(first_error.unwrap_or_else(|| {
                SymbolError::NotFound(format!("build {build_id} published no symbol artifacts"))
            }));
        }

        let root = out_dir.join(format!("symbols-{suffix}"));
        let result =
            merge::merge_symbol_archives(&archives, &root, &suffix, framework_folder, cancel)?;
        if result.success && result.extracted_count > 0 {
            self.index.insert(commit, &suffix, root.clone());
            self.index.save();
        }
        Ok(DownloadResult { root, merge: Some(result), reused: false })
    }
}
