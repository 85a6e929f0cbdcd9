//! Source Link resolution: from a document path in a PDB to a browsable
//! URL with a line anchor.
//!
//! A Source Link map is an ordered set of `pattern -> url template`
//! entries embedded in the PDB. Resolution matches the query path against
//! the patterns, rewrites the raw content URL into the host's browsable
//! form and appends a line anchor in the host's dialect.

use crate::{
    error::{Result, SymbolError},
    pdb::PortablePdb,
    utils,
};
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
};
use url::Url;

/// Source hosts with a known browsable-URL dialect.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize)]
pub enum SourceProvider {
    GitHub,
    GitLab,
    AzureDevOps,
    Bitbucket,
    #[default]
    Generic,
}

impl fmt::Display for SourceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceProvider::GitHub => "GitHub",
            SourceProvider::GitLab => "GitLab",
            SourceProvider::AzureDevOps => "AzureDevOps",
            SourceProvider::Bitbucket => "Bitbucket",
            SourceProvider::Generic => "Generic",
        };
        f.write_str(name)
    }
}

/// A resolved (or unresolved) source location for a stack frame.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SourceLocation {
    pub source_file: String,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    /// Browsable URL with line anchor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Raw content URL as produced by the Source Link template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_url: Option<String>,
    pub provider: SourceProvider,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceLocation {
    pub(crate) fn unresolved(
        source_file: &str,
        line: u32,
        column: Option<u32>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            source_file: source_file.to_string(),
            line,
            column,
            url: None,
            raw_url: None,
            provider: SourceProvider::Generic,
            resolved: false,
            error: Some(error.into()),
        }
    }
}

/// Ordered `pattern -> url template` mappings from a PDB's Source Link
/// JSON.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SourceLinkMap {
    entries: Vec<(String, String)>,
}

impl SourceLinkMap {
    /// Parses the `documents` object of a Source Link JSON blob, keeping
    /// insertion order.
    pub fn parse(json: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(json)?;
        let documents = value
            .get("documents")
            .and_then(|d| d.as_object())
            .ok_or_else(|| SymbolError::msg("source link JSON has no documents object"))?;
        let entries = documents
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect();
        Ok(Self { entries })
    }

    /// Builds a map from explicit pairs, mainly for tests and callers that
    /// already decoded the JSON.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self { entries: pairs.into_iter().collect() }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Resolves a document path to the raw content URL.
    ///
    /// Patterns are tried in insertion order; each is matched exactly,
    /// then as a glob prefix, then by containment with the leading slash
    /// stripped. The template's terminal `*` is replaced by the matched
    /// tail.
    pub fn resolve(&self, document: &str) -> Option<String> {
        let query = document.replace('\\', "/");
        let query_lower = query.to_lowercase();
        for (pattern, template) in &self.entries {
            let pattern = pattern.replace('\\', "/");
            let pattern_lower = pattern.to_lowercase();

            if pattern_lower == query_lower {
                return Some(template.trim_end_matches('*').to_string());
            }
            if let Some(prefix) = pattern_lower.strip_suffix('*') {
                if query_lower.starts_with(prefix) {
                    let tail = &query[prefix.len()..];
                    return Some(replace_terminal_star(template, tail));
                }
                let needle = prefix.trim_start_matches('/');
                if !needle.is_empty() {
                    if let Some(position) = query_lower.find(needle) {
                        let tail = &query[position..];
                        return Some(replace_terminal_star(template, tail));
                    }
                }
            }
        }
        None
    }
}

fn replace_terminal_star(template: &str, tail: &str) -> String {
    match template.rfind('*') {
        Some(position) => format!("{}{}{}", &template[..position], tail, &template[position + 1..]),
        None => template.to_string(),
    }
}

/// Detects the source host from a raw URL's host name.
pub fn detect_provider(raw_url: &str) -> SourceProvider {
    let Ok(url) = Url::parse(raw_url) else {
        return SourceProvider::Generic;
    };
    let Some(host) = url.host_str().map(|h| h.to_ascii_lowercase()) else {
        return SourceProvider::Generic;
    };
    if host == "github.com" || host == "githubusercontent.com" || host.ends_with(".githubusercontent.com") || host.ends_with(".github.com") {
        SourceProvider::GitHub
    } else if host == "gitlab.com" || host.starts_with("gitlab.") {
        SourceProvider::GitLab
    } else if host == "dev.azure.com" || host.ends_with(".visualstudio.com") {
        SourceProvider::AzureDevOps
    } else if host == "bitbucket.org" {
        SourceProvider::Bitbucket
    } else {
        SourceProvider::Generic
    }
}

/// The `dotnet/dotnet` monorepo serves runtime sources under a nested
/// `src/runtime` prefix that raw Source Link paths do not carry.
fn rewrite_dotnet_nested_path(user: &str, repo: &str, path: &str) -> String {
    if !(user.eq_ignore_ascii_case("dotnet") && repo.eq_ignore_ascii_case("dotnet")) {
        return path.to_string();
    }
    if path.starts_with("src/libraries/") || path.starts_with("src/coreclr/") {
        format!("src/runtime/{path}")
    } else if path.starts_with("libraries/") || path.starts_with("coreclr/") {
        format!("src/runtime/src/{path}")
    } else {
        path.to_string()
    }
}

/// Rewrites a raw content URL into the host's browsable form, appending a
/// line anchor when `line > 0`.
pub fn browsable_url(raw_url: &str, line: u32) -> Option<String> {
    let provider = detect_provider(raw_url);
    let url = Url::parse(raw_url).ok()?;
    match provider {
        SourceProvider::GitHub => github_browsable(&url, raw_url, line),
        SourceProvider::GitLab => {
            let rewritten = raw_url.replace("/-/raw/", "/-/blob/");
            Some(with_anchor(&rewritten, line, "#L"))
        }
        SourceProvider::AzureDevOps => azure_browsable(&url, line),
        SourceProvider::Bitbucket => {
            let rewritten = raw_url.replace("/raw/", "/src/");
            Some(with_anchor(&rewritten, line, "#lines-"))
        }
        SourceProvider::Generic => Some(with_anchor(raw_url, line, "#L")),
    }
}

fn with_anchor(url: &str, line: u32, anchor_prefix: &str) -> String {
    if line == 0 || url.contains('#') {
        url.to_string()
    } else {
        format!("{url}{anchor_prefix}{line}")
    }
}

fn github_browsable(url: &Url, raw_url: &str, line: u32) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    let segments: Vec<&str> = url.path_segments()?.collect();
    if host.ends_with("githubusercontent.com") {
        // raw.githubusercontent.com/<user>/<repo>/<sha>/<path>
        let [user, repo, sha, rest @ ..] = segments.as_slice() else {
            return Some(with_anchor(raw_url, line, "#L"));
        };
        if rest.is_empty() {
            return Some(with_anchor(raw_url, line, "#L"));
        }
        let path = rewrite_dotnet_nested_path(user, repo, &rest.join("/"));
        let rewritten = format!("https://github.com/{user}/{repo}/blob/{sha}/{path}");
        return Some(with_anchor(&rewritten, line, "#L"));
    }
    // already a github.com URL: apply the nested-path rule, keep the rest
    let [user, repo, blob, sha, rest @ ..] = segments.as_slice() else {
        return Some(with_anchor(raw_url, line, "#L"));
    };
    if *blob == "blob" && !rest.is_empty() {
        let path = rewrite_dotnet_nested_path(user, repo, &rest.join("/"));
        let rewritten = format!("https://github.com/{user}/{repo}/blob/{sha}/{path}");
        return Some(with_anchor(&rewritten, line, "#L"));
    }
    Some(with_anchor(raw_url, line, "#L"))
}

fn azure_browsable(url: &Url, line: u32) -> Option<String> {
    // .../{org}/{project}/_apis/git/repositories/{repo}/items?path=<p>
    let segments: Vec<&str> = url.path_segments()?.collect();
    let apis = segments.iter().position(|s| *s == "_apis")?;
    if segments.get(apis + 1) != Some(&"git") || segments.get(apis + 2) != Some(&"repositories") {
        return None;
    }
    let repo = segments.get(apis + 3)?;
    let (organization, project) = match url.host_str()? {
        "dev.azure.com" => (segments.first()?.to_string(), segments.get(1)?.to_string()),
        host => {
            // {org}.visualstudio.com/{project}/...
            let organization = host.split('.').next()?.to_string();
            (organization, segments.first()?.to_string())
        }
    };
    let path = url
        .query_pairs()
        .find(|(key, _)| key == "path")
        .map(|(_, value)| value.into_owned())?;
    let mut rewritten = Url::parse("https://dev.azure.com").ok()?;
    rewritten
        .path_segments_mut()
        .ok()?
        .pop_if_empty()
        .push(&organization)
        .push(&project)
        .push("_git")
        .push(repo);
    rewritten.query_pairs_mut().append_pair("path", &path);
    if line > 0 {
        rewritten.query_pairs_mut().append_pair("line", &line.to_string());
    }
    Some(rewritten.to_string())
}

/// Per-module Source Link state, cached after the first extraction.
#[derive(Debug)]
enum ModuleSourceLink {
    Map(SourceLinkMap),
    Unavailable(String),
}

/// Resolves `(module, document, line)` queries to browsable URLs.
///
/// PDBs are found next to the module when the module is given as a file
/// path, otherwise by a recursive case-insensitive search of the
/// configured symbol paths. Each module's map is extracted once.
#[derive(Debug)]
pub struct SourceLinkResolver {
    symbol_paths: Vec<PathBuf>,
    modules: HashMap<String, ModuleSourceLink>,
    warned_missing: HashSet<String>,
}

/// Extensions stripped when mapping a module path to its identifier.
const MODULE_EXTENSIONS: &[&str] = &["dll", "exe", "pdb"];

impl SourceLinkResolver {
    pub fn new(symbol_paths: Vec<PathBuf>) -> Self {
        Self { symbol_paths, modules: HashMap::new(), warned_missing: HashSet::new() }
    }

    /// Maps a module path (or bare dotted assembly name) to the module
    /// identifier used for PDB discovery.
    fn module_id(module_path: &str) -> String {
        let normalized = module_path.replace('\\', "/");
        let looks_like_path = normalized.contains('/')
            || Path::new(&normalized)
                .extension()
                .and_then(|e| e.to_str())
                .map(|ext| MODULE_EXTENSIONS.iter().any(|m| ext.eq_ignore_ascii_case(m)))
                .unwrap_or(false);
        if !looks_like_path {
            return module_path.to_string();
        }
        let path = Path::new(&normalized);
        let has_known_extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| MODULE_EXTENSIONS.iter().any(|m| ext.eq_ignore_ascii_case(m)))
            .unwrap_or(false);
        let name = if has_known_extension { path.file_stem() } else { path.file_name() };
        name.and_then(|n| n.to_str()).unwrap_or(module_path).to_string()
    }

    /// Finds the module's PDB: sibling first for path-like modules, then
    /// the configured symbol paths, recursively and case-insensitively.
    fn find_pdb(&self, module_path: &str, module_id: &str) -> Option<PathBuf> {
        let normalized = module_path.replace('\\', "/");
        let as_path = Path::new(&normalized);
        if normalized.contains('/') {
            let sibling = as_path.with_extension("pdb");
            if sibling.is_file() {
                return Some(sibling);
            }
            if let Some(parent) = as_path.parent() {
                let candidate = parent.join(format!("{module_id}.pdb"));
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        let file_name = format!("{module_id}.pdb");
        for search_path in &self.symbol_paths {
            let direct = search_path.join(&file_name);
            if direct.is_file() {
                return Some(direct);
            }
            if let Some(found) = utils::find_file_recursive_ci(search_path, &file_name) {
                return Some(found);
            }
        }
        None
    }

    fn load_map(&mut self, module_path: &str) -> &ModuleSourceLink {
        let module_id = Self::module_id(module_path);
        if !self.modules.contains_key(&module_id) {
            let state = match self.find_pdb(module_path, &module_id) {
                None => {
                    if self.warned_missing.insert(module_id.clone()) {
                        warn!("no PDB found for module \"{module_id}\"");
                    }
                    ModuleSourceLink::Unavailable(format!("no PDB found for {module_id}"))
                }
                Some(pdb_path) => match extract_map(&pdb_path) {
                    Ok(Some(map)) => ModuleSourceLink::Map(map),
                    Ok(None) => ModuleSourceLink::Unavailable(format!(
                        "PDB \"{}\" has no Source Link information",
                        pdb_path.display()
                    )),
                    Err(err) => ModuleSourceLink::Unavailable(err.to_string()),
                },
            };
            self.modules.insert(module_id.clone(), state);
        }
        &self.modules[&module_id]
    }

    /// Resolves a stack-frame document to a browsable source URL.
    ///
    /// The returned location always carries the original `source_file` and
    /// `line`; `resolved` is false (with `error` set) when the module's
    /// PDB is missing, is not portable, carries no Source Link map, or no
    /// pattern matches.
    pub fn resolve(
        &mut self,
        module_path: &str,
        source_file: &str,
        line: u32,
        column: Option<u32>,
    ) -> SourceLocation {
        let map = match self.load_map(module_path) {
            ModuleSourceLink::Map(map) => map,
            ModuleSourceLink::Unavailable(error) => {
                let error = error.clone();
                return SourceLocation::unresolved(source_file, line, column, error);
            }
        };
        let Some(raw_url) = map.resolve(source_file) else {
            return SourceLocation::unresolved(
                source_file,
                line,
                column,
                format!("no Source Link pattern matches \"{source_file}\""),
            );
        };
        let provider = detect_provider(&raw_url);
        let url = browsable_url(&raw_url, line);
        SourceLocation {
            source_file: source_file.to_string(),
            line,
            column,
            url,
            raw_url: Some(raw_url),
            provider,
            resolved: true,
            error: None,
        }
    }
}

fn extract_map(pdb_path: &Path) -> Result<Option<SourceLinkMap>> {
    let pdb = PortablePdb::open(pdb_path)?;
    match pdb.source_link_json()? {
        Some(json) => Ok(Some(SourceLinkMap::parse(&json)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdb::testutil::TestPdb;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn dotnet_map() -> SourceLinkMap {
        SourceLinkMap::from_pairs([(
            "/src/*".to_string(),
            "https://raw.githubusercontent.com/dotnet/dotnet/abc123/*".to_string(),
        )])
    }

    #[test]
    fn github_dotnet_nested_path_rewrite() {
        let map = dotnet_map();
        let raw = map
            .resolve("/src/libraries/System.Private.CoreLib/src/System/Threading/Lock.cs")
            .unwrap();
        let url = browsable_url(&raw, 754).unwrap();
        assert_eq!(
            url,
            "https://github.com/dotnet/dotnet/blob/abc123/src/runtime/src/libraries/System.Private.CoreLib/src/System/Threading/Lock.cs#L754"
        );
    }

    #[test]
    fn line_zero_gets_no_anchor() {
        let map = dotnet_map();
        let raw = map
            .resolve("/src/libraries/System.Private.CoreLib/src/System/Threading/Lock.cs")
            .unwrap();
        let url = browsable_url(&raw, 0).unwrap();
        assert!(url.ends_with("/src/System/Threading/Lock.cs"));
        assert!(!url.contains("#L"));
    }

    #[test]
    fn matching_order_and_styles() {
        let map = SourceLinkMap::from_pairs([
            ("/exact/file.cs".to_string(), "https://example.com/exact/file.cs".to_string()),
            ("/repo/*".to_string(), "https://example.com/raw/*".to_string()),
        ]);

        // exact, case-insensitive
        assert_eq!(
            map.resolve("/EXACT/File.cs").as_deref(),
            Some("https://example.com/exact/file.cs")
        );
        // glob prefix
        assert_eq!(
            map.resolve("/repo/src/a.cs").as_deref(),
            Some("https://example.com/raw/src/a.cs")
        );
        // containment with leading slash stripped, backslashes normalized
        assert_eq!(
            map.resolve("C:\\agent\\work\\repo\\src\\b.cs").as_deref(),
            Some("https://example.com/raw/repo/src/b.cs")
        );
        assert_eq!(map.resolve("/elsewhere/c.cs"), None);
    }

    #[test]
    fn insertion_order_wins() {
        let map = SourceLinkMap::from_pairs([
            ("/src/*".to_string(), "https://first.example.com/*".to_string()),
            ("/src/special/*".to_string(), "https://second.example.com/*".to_string()),
        ]);
        assert_eq!(
            map.resolve("/src/special/x.cs").as_deref(),
            Some("https://first.example.com/special/x.cs")
        );
    }

    #[test]
    fn parses_documents_preserving_order() {
        let json = br#"{"documents":{"/b/*":"https://b.example.com/*","/a/*":"https://a.example.com/*"}}"#;
        let map = SourceLinkMap::parse(json).unwrap();
        assert_eq!(map.len(), 2);
        // /b/* is first because it was inserted first
        assert_eq!(map.resolve("/b/x.cs").as_deref(), Some("https://b.example.com/x.cs"));
    }

    #[test]
    fn provider_detection() {
        assert_eq!(
            detect_provider("https://raw.githubusercontent.com/u/r/sha/f.cs"),
            SourceProvider::GitHub
        );
        assert_eq!(detect_provider("https://github.com/u/r/blob/sha/f.cs"), SourceProvider::GitHub);
        assert_eq!(
            detect_provider("https://gitlab.example.com/u/r/-/raw/sha/f.cs"),
            SourceProvider::GitLab
        );
        assert_eq!(detect_provider("https://gitlab.com/u/r/-/raw/sha/f.cs"), SourceProvider::GitLab);
        assert_eq!(
            detect_provider("https://dev.azure.com/org/proj/_apis/git/repositories/r/items?path=/f.cs"),
            SourceProvider::AzureDevOps
        );
        assert_eq!(
            detect_provider("https://org.visualstudio.com/proj/_apis/git/repositories/r/items?path=/f.cs"),
            SourceProvider::AzureDevOps
        );
        assert_eq!(
            detect_provider("https://bitbucket.org/u/r/raw/sha/f.cs"),
            SourceProvider::Bitbucket
        );
        assert_eq!(detect_provider("https://sources.internal/f.cs"), SourceProvider::Generic);
    }

    #[test]
    fn gitlab_rewrite() {
        let url = browsable_url("https://gitlab.com/group/repo/-/raw/abc123/src/a.cs", 12).unwrap();
        assert_eq!(url, "https://gitlab.com/group/repo/-/blob/abc123/src/a.cs#L12");
    }

    #[test]
    fn bitbucket_rewrite() {
        let url = browsable_url("https://bitbucket.org/team/repo/raw/abc123/src/a.cs", 5).unwrap();
        assert_eq!(url, "https://bitbucket.org/team/repo/src/abc123/src/a.cs#lines-5");
    }

    #[test]
    fn azure_devops_rewrite() {
        let url = browsable_url(
            "https://dev.azure.com/org/proj/_apis/git/repositories/repo/items?path=%2Fsrc%2Fa.cs&versionType=commit",
            42,
        )
        .unwrap();
        assert_eq!(url, "https://dev.azure.com/org/proj/_git/repo?path=%2Fsrc%2Fa.cs&line=42");
    }

    #[test]
    fn generic_anchor_only_without_fragment() {
        assert_eq!(
            browsable_url("https://sources.internal/a.cs", 3).as_deref(),
            Some("https://sources.internal/a.cs#L3")
        );
        assert_eq!(
            browsable_url("https://sources.internal/a.cs#frag", 3).as_deref(),
            Some("https://sources.internal/a.cs#frag")
        );
    }

    #[test]
    fn github_existing_blob_url_keeps_anchor_rule() {
        let url =
            browsable_url("https://github.com/dotnet/dotnet/blob/abc/src/libraries/a.cs", 7)
                .unwrap();
        assert_eq!(
            url,
            "https://github.com/dotnet/dotnet/blob/abc/src/runtime/src/libraries/a.cs#L7"
        );
    }

    #[test]
    fn resolver_end_to_end_with_pdb() {
        let tmp = tempfile::tempdir().unwrap();
        let json = r#"{"documents":{"/src/*":"https://raw.githubusercontent.com/dotnet/dotnet/abc123/*"}}"#;
        let pdb = TestPdb::new(Uuid::from_u128(5), 0).source_link(json).build();
        std::fs::write(tmp.path().join("System.Threading.pdb"), pdb).unwrap();

        let mut resolver = SourceLinkResolver::new(vec![tmp.path().to_path_buf()]);
        let file = "/src/libraries/System.Private.CoreLib/src/System/Threading/Lock.cs";

        let location = resolver.resolve("System.Threading", file, 754, None);
        assert!(location.resolved);
        assert_eq!(location.provider, SourceProvider::GitHub);
        assert_eq!(
            location.url.as_deref(),
            Some("https://github.com/dotnet/dotnet/blob/abc123/src/runtime/src/libraries/System.Private.CoreLib/src/System/Threading/Lock.cs#L754")
        );

        // resolution is idempotent
        let again = resolver.resolve("System.Threading", file, 754, None);
        assert_eq!(again, location);
    }

    #[test]
    fn missing_pdb_is_unresolved_with_original_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let mut resolver = SourceLinkResolver::new(vec![tmp.path().to_path_buf()]);
        let location = resolver.resolve("Nowhere.Module", "/src/a.cs", 10, Some(4));
        assert!(!location.resolved);
        assert_eq!(location.source_file, "/src/a.cs");
        assert_eq!(location.line, 10);
        assert_eq!(location.column, Some(4));
        assert!(location.error.as_deref().unwrap().contains("Nowhere.Module"));
    }

    #[test]
    fn module_id_derivation() {
        assert_eq!(SourceLinkResolver::module_id("/app/bin/Datadog.Trace.dll"), "Datadog.Trace");
        assert_eq!(
            SourceLinkResolver::module_id("C:\\app\\Datadog.Trace.dll"),
            "Datadog.Trace"
        );
        // dotted assembly names are not paths
        assert_eq!(SourceLinkResolver::module_id("System.Threading"), "System.Threading");
        assert_eq!(SourceLinkResolver::module_id("Datadog.Trace.pdb"), "Datadog.Trace");
    }
}
