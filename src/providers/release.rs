//! Release provider: resolves source-host releases and extracts their
//! symbol assets.
//!
//! Releases are found by tag (`v1.2.3` then `1.2.3`) or by scanning the
//! most recent releases for a matching target commit. Selected assets are
//! the Linux native-symbols tarball, the cross-platform managed-home zip
//! and the Windows native-symbols zip; extraction shares the path
//! traversal guard with the archive merger. Rate-limit answers
//! short-circuit the provider until the advertised reset.

use super::{commit_matches, http_client, stream_to_file, DownloadResult};
use crate::{
    cache::{self, PersistentCache},
    config::SymbolConfig,
    error::{Result, SymbolError},
    merge::MergeResult,
    platform::{Os, PlatformDescriptor},
    utils::{self, CancelToken, TempDirGuard},
};
use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Component, Path},
};
use walkdir::WalkDir;

/// Base URL of the release provider.
pub const GITHUB_API_BASE: &str = "https://api.github.com";
/// Releases scanned when looking a commit up; older commits are a miss.
pub const RELEASE_SCAN_PAGE_SIZE: u32 = 100;

/// Scratch directory for release asset downloads, removed on unwind.
const TEMP_DOWNLOAD_DIR: &str = ".temp_github_download";

/// A release asset as reported by the API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// A release and its assets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub id: u64,
    #[serde(rename = "tag_name")]
    pub tag: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub target_commitish: Option<String>,
    #[serde(rename = "html_url")]
    pub url: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// Roles the selected assets play during extraction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AssetRole {
    LinuxNativeTarball,
    ManagedHomeZip,
    WindowsNativeZip,
}

fn is_linux_symbols_tarball(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.ends_with(".tar.gz") && name.contains("linux") && name.contains("symbols")
}

fn is_managed_home_zip(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.ends_with(".zip") && (name.contains("managed") || name.contains("monitoring-home"))
}

fn is_windows_symbols_zip(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.ends_with(".zip") && name.contains("windows") && name.contains("symbols")
}

/// Picks the assets relevant for the target platform, in download order.
fn select_assets(release: &ReleaseRecord, os: Os) -> Vec<(AssetRole, &ReleaseAsset)> {
    let find = |pred: fn(&str) -> bool| release.assets.iter().find(|a| pred(&a.name));
    let mut selected = Vec::new();
    match os {
        Os::Linux => {
            if let Some(asset) = find(is_linux_symbols_tarball) {
                selected.push((AssetRole::LinuxNativeTarball, asset));
            }
            if let Some(asset) = find(is_managed_home_zip) {
                selected.push((AssetRole::ManagedHomeZip, asset));
            }
        }
        Os::Windows => {
            if let Some(asset) = find(is_managed_home_zip) {
                selected.push((AssetRole::ManagedHomeZip, asset));
            }
            if let Some(asset) = find(is_windows_symbols_zip) {
                selected.push((AssetRole::WindowsNativeZip, asset));
            }
        }
        Os::Macos => {}
    }
    selected
}

/// Resolver for the release provider. Owns its persistent release cache;
/// the HTTP client is owned or borrowed like the pipeline resolver's.
#[derive(Debug)]
pub struct GitHubReleasesResolver {
    client: reqwest::Client,
    config: SymbolConfig,
    releases: PersistentCache<ReleaseRecord>,
    rate_limited_until: Option<DateTime<Utc>>,
}

impl GitHubReleasesResolver {
    /// Creates a resolver owning its HTTP client.
    pub fn new(config: SymbolConfig) -> Result<Self> {
        let client = http_client(&config)?;
        Ok(Self::with_client(config, client))
    }

    /// Creates a resolver over an externally managed client handle.
    pub fn with_client(config: SymbolConfig, client: reqwest::Client) -> Self {
        let releases = PersistentCache::load(
            &config.cache_dir,
            cache::RELEASE_CACHE_FILENAME,
            cache::lookup_ttl(),
        );
        Self { client, config, releases, rate_limited_until: None }
    }

    /// Flushes the release cache.
    pub fn save_caches(&mut self) {
        self.releases.save();
    }

    fn version_key(&self, version: &Version) -> String {
        format!("{}/{}/v/{version}", self.config.owner, self.config.repo)
    }

    fn commit_key(&self, commit: &str) -> String {
        format!("{}/{}/c/{commit}", self.config.owner, self.config.repo)
    }

    /// Errors out while a previous rate-limit answer is still in force.
    fn check_rate_limit(&self) -> Result<()> {
        if let Some(until) = self.rate_limited_until {
            if until > Utc::now() {
                return Err(SymbolError::RateLimited { reset: Some(until) });
            }
        }
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &mut self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        self.check_rate_limit()?;
        let mut request = self
            .client
            .get(url)
            .query(query)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.config.github_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Err(SymbolError::NotFound(url.to_string()));
        }
        if status.as_u16() == 403 && rate_limit_exhausted(&response) {
            let reset = rate_limit_reset(&response);
            self.rate_limited_until = reset.or_else(|| Some(Utc::now() + chrono::Duration::minutes(1)));
            warn!("release provider rate limited until {:?}", self.rate_limited_until);
            return Err(SymbolError::RateLimited { reset });
        }
        if !status.is_success() {
            return Err(SymbolError::Status { status: status.as_u16(), url: url.to_string() });
        }
        Ok(response.json().await?)
    }

    /// Finds a release by version, trying the `v`-prefixed tag first.
    /// Positive and negative cache entries are honored.
    pub async fn find_release_by_version(
        &mut self,
        version: &Version,
    ) -> Result<Option<ReleaseRecord>> {
        let key = self.version_key(version);
        if let Some(hit) = self.releases.try_get(&key) {
            trace!("release cache hit for {key}");
            return Ok(hit.cloned());
        }

        for tag in [format!("v{version}"), version.to_string()] {
            let url = format!(
                "{GITHUB_API_BASE}/repos/{}/{}/releases/tags/{tag}",
                self.config.owner, self.config.repo
            );
            match self.get_json::<ReleaseRecord>(&url, &[]).await {
                Ok(release) => {
                    self.releases.insert(&key, Some(release.clone()));
                    return Ok(Some(release));
                }
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
        }
        self.releases.insert(&key, None);
        Ok(None)
    }

    /// Finds the release whose target commit matches, scanning a single
    /// page of the most recent releases. Both outcomes are cached.
    pub async fn find_release_by_commit(
        &mut self,
        commit: &str,
    ) -> Result<Option<ReleaseRecord>> {
        let key = self.commit_key(commit);
        if let Some(hit) = self.releases.try_get(&key) {
            trace!("release cache hit for {key}");
            return Ok(hit.cloned());
        }

        let url =
            format!("{GITHUB_API_BASE}/repos/{}/{}/releases", self.config.owner, self.config.repo);
        let per_page = RELEASE_SCAN_PAGE_SIZE.to_string();
        let releases: Vec<ReleaseRecord> =
            self.get_json(&url, &[("per_page", per_page.as_str())]).await?;

        let found = releases.into_iter().find(|release| {
            release
                .target_commitish
                .as_deref()
                .map(|target| commit_matches(target, commit))
                .unwrap_or(false)
        });
        self.releases.insert(&key, found.clone());
        Ok(found)
    }

    /// Downloads the platform's assets from `release` and extracts their
    /// symbol payloads into the layout root.
    pub async fn download_symbols(
        &mut self,
        release: &ReleaseRecord,
        platform: &PlatformDescriptor,
        out_dir: &Path,
        framework_folder: &str,
        cancel: &CancelToken,
    ) -> Result<DownloadResult> {
        let suffix = platform.suffix();
        let selected = select_assets(release, platform.os);
        if selected.is_empty() {
            return Err(SymbolError::NotFound(format!(
                "release {} has no symbol assets for {suffix}",
                release.tag
            )));
        }

        let root = out_dir.join(format!("symbols-{suffix}"));
        let native_dir = root.join(&suffix);
        let managed_dir = root.join(framework_folder);
        fs::create_dir_all(&native_dir).map_err(|err| SymbolError::io(err, &native_dir))?;
        fs::create_dir_all(&managed_dir).map_err(|err| SymbolError::io(err, &managed_dir))?;

        let mut result = MergeResult {
            success: true,
            root: root.clone(),
            native_dir: native_dir.clone(),
            managed_dir: managed_dir.clone(),
            ..Default::default()
        };

        let scratch = TempDirGuard::create(out_dir.join(TEMP_DOWNLOAD_DIR))?;
        for (role, asset) in selected {
            if asset.size > self.config.max_artifact_size {
                return Err(SymbolError::ArtifactTooLarge {
                    size: asset.size,
                    limit: self.config.max_artifact_size,
                });
            }
            let archive = scratch.path().join(&asset.name);
            self.download_asset(asset, &archive, cancel).await?;

            let extraction = match role {
                AssetRole::LinuxNativeTarball => extract_native_tarball(
                    &archive,
                    &scratch.path().join("untarred"),
                    &suffix,
                    &native_dir,
                    cancel,
                    &mut result,
                ),
                AssetRole::ManagedHomeZip => extract_zip_subtree(
                    &archive,
                    framework_folder,
                    &["pdb", "dll"],
                    &managed_dir,
                    cancel,
                    &mut result,
                ),
                AssetRole::WindowsNativeZip => extract_zip_subtree(
                    &archive,
                    &suffix,
                    &["pdb"],
                    &native_dir,
                    cancel,
                    &mut result,
                ),
            };
            if let Err(err) = extraction {
                if matches!(err, SymbolError::Cancelled) {
                    return Err(err);
                }
                warn!("failed to extract \"{}\": {err}", asset.name);
                result.success = false;
                result.error.get_or_insert_with(|| err.to_string());
            }
        }
        Ok(DownloadResult { root, merge: Some(result), reused: false })
    }

    async fn download_asset(
        &mut self,
        asset: &ReleaseAsset,
        dest: &Path,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.check_rate_limit()?;
        debug!("downloading release asset \"{}\"", asset.name);
        let mut request = self.client.get(&asset.download_url);
        if let Some(token) = &self.config.github_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SymbolError::Status {
                status: status.as_u16(),
                url: asset.download_url.clone(),
            });
        }
        stream_to_file(response, dest, self.config.max_artifact_size, cancel).await
    }
}

fn rate_limit_exhausted(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "0")
        .unwrap_or(false)
}

fn rate_limit_reset(response: &reqwest::Response) -> Option<DateTime<Utc>> {
    let seconds = response
        .headers()
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())?;
    Utc.timestamp_opt(seconds, 0).single()
}

/// Unpacks a gzip tarball into `dest` with the traversal guard, then
/// copies every `.debug` file under the platform subdirectory into the
/// native dir. The subdirectory is searched recursively when it is not a
/// direct child of the unpacked tree.
fn extract_native_tarball(
    tarball: &Path,
    dest: &Path,
    suffix: &str,
    native_dir: &Path,
    cancel: &CancelToken,
    result: &mut MergeResult,
) -> Result<()> {
    fs::create_dir_all(dest).map_err(|err| SymbolError::io(err, dest))?;
    let file = fs::File::open(tarball).map_err(|err| SymbolError::io(err, tarball))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let entries = archive.entries().map_err(|err| SymbolError::InvalidArchive {
        path: tarball.to_path_buf(),
        message: err.to_string(),
    })?;
    for entry in entries {
        cancel.check()?;
        let mut entry = entry.map_err(|err| SymbolError::InvalidArchive {
            path: tarball.to_path_buf(),
            message: err.to_string(),
        })?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let Some(rel) = utils::sanitize_archive_path(&name) else {
            trace!("ignoring unsafe tar entry \"{name}\"");
            continue;
        };
        let target = dest.join(rel);
        utils::create_parent_dir_all(&target)?;
        let mut out = fs::File::create(&target).map_err(|err| SymbolError::io(err, &target))?;
        io::copy(&mut entry, &mut out).map_err(|err| SymbolError::io(err, &target))?;
    }

    let subdir = {
        let direct = dest.join(suffix);
        if direct.is_dir() {
            Some(direct)
        } else {
            utils::find_dir_recursive_ci(dest, suffix)
        }
    };
    let Some(subdir) = subdir else {
        return Err(SymbolError::NotFound(format!(
            "tarball has no \"{suffix}\" symbol directory"
        )));
    };

    for entry in WalkDir::new(&subdir).into_iter().filter_map(|e| e.ok()) {
        cancel.check()?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_debug = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("debug"))
            .unwrap_or(false);
        if !is_debug {
            continue;
        }
        let target = native_dir.join(entry.file_name());
        fs::copy(path, &target).map_err(|err| SymbolError::io(err, &target))?;
        result.debug_files.push(target);
        result.extracted_count += 1;
    }
    Ok(())
}

/// Extracts entries with one of `extensions` from the subtree named
/// `required_dir` in a zip, flattened into `dest_dir`.
fn extract_zip_subtree(
    zip_path: &Path,
    required_dir: &str,
    extensions: &[&str],
    dest_dir: &Path,
    cancel: &CancelToken,
    result: &mut MergeResult,
) -> Result<()> {
    let file = fs::File::open(zip_path).map_err(|err| SymbolError::io(err, zip_path))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|err| SymbolError::InvalidArchive {
        path: zip_path.to_path_buf(),
        message: err.to_string(),
    })?;
    for index in 0..archive.len() {
        cancel.check()?;
        let mut entry = archive.by_index(index).map_err(|err| SymbolError::InvalidArchive {
            path: zip_path.to_path_buf(),
            message: err.to_string(),
        })?;
        if entry.is_dir() {
            continue;
        }
        let Some(rel) = utils::sanitize_archive_path(entry.name()) else {
            trace!("ignoring unsafe entry \"{}\"", entry.name());
            continue;
        };
        let in_subtree = {
            let mut components: Vec<_> = rel.components().collect();
            components.pop();
            components.iter().any(|c| {
                matches!(c, Component::Normal(n)
                    if n.to_str().map(|n| n.eq_ignore_ascii_case(required_dir)).unwrap_or(false))
            })
        };
        let ext_ok = rel
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
            .unwrap_or(false);
        if !in_subtree || !ext_ok {
            continue;
        }
        let Some(file_name) = rel.file_name() else { continue };
        let target = dest_dir.join(file_name);
        utils::create_parent_dir_all(&target)?;
        let mut out = fs::File::create(&target).map_err(|err| SymbolError::io(err, &target))?;
        io::copy(&mut entry, &mut out).map_err(|err| SymbolError::io(err, &target))?;
        match rel.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("pdb") => result.pdb_files.push(target),
            _ => result.other_binaries.push(target),
        }
        result.extracted_count += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn asset(name: &str) -> ReleaseAsset {
        ReleaseAsset {
            name: name.to_string(),
            download_url: format!("https://example.com/{name}"),
            size: 1024,
            content_type: None,
        }
    }

    fn release_with_assets(names: &[&str]) -> ReleaseRecord {
        ReleaseRecord {
            id: 1,
            tag: "v1.2.3".to_string(),
            name: Some("1.2.3".to_string()),
            target_commitish: Some("abc123def4567890".to_string()),
            url: "https://github.com/DataDog/dd-trace-dotnet/releases/tag/v1.2.3".to_string(),
            published_at: None,
            assets: names.iter().map(|n| asset(n)).collect(),
        }
    }

    #[test]
    fn selects_linux_assets() {
        let release = release_with_assets(&[
            "source.tar.gz",
            "linux-native-symbols.tar.gz",
            "managed-symbols.zip",
            "windows-native-symbols.zip",
        ]);
        let selected = select_assets(&release, Os::Linux);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].0, AssetRole::LinuxNativeTarball);
        assert_eq!(selected[0].1.name, "linux-native-symbols.tar.gz");
        assert_eq!(selected[1].0, AssetRole::ManagedHomeZip);
        assert_eq!(selected[1].1.name, "managed-symbols.zip");
    }

    #[test]
    fn selects_windows_assets() {
        let release = release_with_assets(&[
            "linux-native-symbols.tar.gz",
            "managed-symbols.zip",
            "windows-native-symbols.zip",
        ]);
        let selected = select_assets(&release, Os::Windows);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].0, AssetRole::ManagedHomeZip);
        assert_eq!(selected[1].0, AssetRole::WindowsNativeZip);
    }

    #[test]
    fn macos_selects_nothing() {
        let release = release_with_assets(&["linux-native-symbols.tar.gz", "managed-symbols.zip"]);
        assert!(select_assets(&release, Os::Macos).is_empty());
    }

    #[test]
    fn release_wire_format() {
        let json = r#"{
            "id": 99,
            "tag_name": "v3.31.0",
            "name": "3.31.0",
            "target_commitish": "ABC123DEF4567890",
            "html_url": "https://github.com/DataDog/dd-trace-dotnet/releases/tag/v3.31.0",
            "published_at": "2024-06-01T12:00:00Z",
            "assets": [
                {
                    "name": "linux-native-symbols.tar.gz",
                    "browser_download_url": "https://github.com/DataDog/dd-trace-dotnet/releases/download/v3.31.0/linux-native-symbols.tar.gz",
                    "size": 123456,
                    "content_type": "application/gzip",
                    "state": "uploaded"
                }
            ],
            "draft": false
        }"#;
        let release: ReleaseRecord = serde_json::from_str(json).unwrap();
        assert_eq!(release.tag, "v3.31.0");
        assert_eq!(release.target_commitish.as_deref(), Some("ABC123DEF4567890"));
        assert_eq!(release.assets.len(), 1);
        assert_eq!(release.assets[0].size, 123456);

        let roundtrip: ReleaseRecord =
            serde_json::from_str(&serde_json::to_string(&release).unwrap()).unwrap();
        assert_eq!(roundtrip, release);
    }

    #[test]
    fn tarball_extraction_copies_platform_debug_files() {
        let tmp = tempfile::tempdir().unwrap();
        let tarball = tmp.path().join("linux-native-symbols.tar.gz");
        {
            let gz = GzEncoder::new(fs::File::create(&tarball).unwrap(), Compression::fast());
            let mut builder = tar::Builder::new(gz);
            let mut add = |path: &str, content: &[u8]| {
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, path, content).unwrap();
            };
            add("symbols/linux-x64/libdatadog.so.debug", b"x64-debug");
            add("symbols/linux-arm64/libdatadog.so.debug", b"arm64-debug");
            add("symbols/linux-x64/readme.txt", b"not-a-symbol");
            builder.into_inner().unwrap().finish().unwrap();
        }

        let native_dir = tmp.path().join("native");
        fs::create_dir_all(&native_dir).unwrap();
        let mut result = MergeResult::default();
        extract_native_tarball(
            &tarball,
            &tmp.path().join("untarred"),
            "linux-x64",
            &native_dir,
            &CancelToken::new(),
            &mut result,
        )
        .unwrap();

        assert_eq!(result.extracted_count, 1);
        assert_eq!(
            fs::read(native_dir.join("libdatadog.so.debug")).unwrap(),
            b"x64-debug"
        );
    }

    #[test]
    fn tarball_without_platform_dir_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let tarball = tmp.path().join("symbols.tar.gz");
        {
            let gz = GzEncoder::new(fs::File::create(&tarball).unwrap(), Compression::fast());
            let mut builder = tar::Builder::new(gz);
            let mut header = tar::Header::new_gnu();
            header.set_size(1);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "only/other-things.debug", &b"y"[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let mut result = MergeResult::default();
        let err = extract_native_tarball(
            &tarball,
            &tmp.path().join("untarred"),
            "linux-musl-arm64",
            tmp.path(),
            &CancelToken::new(),
            &mut result,
        )
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn zip_subtree_extraction_filters_by_dir_and_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("managed-symbols.zip");
        {
            let mut writer = zip::ZipWriter::new(fs::File::create(&zip_path).unwrap());
            let options = zip::write::SimpleFileOptions::default();
            for (name, content) in [
                ("home/net6.0/Datadog.Trace.pdb", b"pdb".as_slice()),
                ("home/net6.0/Datadog.Trace.dll", b"dll"),
                ("home/netcoreapp3.1/Datadog.Trace.pdb", b"other"),
                ("home/net6.0/notes.txt", b"junk"),
                ("../escape.pdb", b"evil"),
            ] {
                writer.start_file(name, options).unwrap();
                writer.write_all(content).unwrap();
            }
            writer.finish().unwrap();
        }

        let dest = tmp.path().join("managed");
        fs::create_dir_all(&dest).unwrap();
        let mut result = MergeResult::default();
        extract_zip_subtree(
            &zip_path,
            "net6.0",
            &["pdb", "dll"],
            &dest,
            &CancelToken::new(),
            &mut result,
        )
        .unwrap();

        assert_eq!(result.extracted_count, 2);
        assert_eq!(result.pdb_files.len(), 1);
        assert_eq!(result.other_binaries.len(), 1);
        assert!(dest.join("Datadog.Trace.pdb").is_file());
        assert!(dest.join("Datadog.Trace.dll").is_file());
        assert!(!dest.join("notes.txt").exists());
        assert!(!tmp.path().join("escape.pdb").exists());
    }

    #[tokio::test]
    async fn rate_limit_short_circuits_lookups() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SymbolConfig::builder().cache_dir(tmp.path()).build();
        let mut resolver = GitHubReleasesResolver::new(config).unwrap();
        resolver.rate_limited_until = Some(Utc::now() + chrono::Duration::minutes(10));

        let err = resolver.find_release_by_commit("abc123def").await.unwrap_err();
        assert!(matches!(err, SymbolError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn cached_release_is_served_without_network() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SymbolConfig::builder().cache_dir(tmp.path()).build();
        let mut resolver = GitHubReleasesResolver::new(config).unwrap();
        let release = release_with_assets(&["managed-symbols.zip"]);
        let key = resolver.commit_key("abc123def");
        resolver.releases.insert(&key, Some(release.clone()));

        let found = resolver.find_release_by_commit("abc123def").await.unwrap();
        assert_eq!(found, Some(release));

        // negative entries short-circuit the same way
        let negative_key = resolver.version_key(&Version::new(9, 9, 9));
        resolver.releases.insert(&negative_key, None);
        let found = resolver.find_release_by_version(&Version::new(9, 9, 9)).await.unwrap();
        assert_eq!(found, None);
    }
}
