//! Utility functions

use crate::error::{Result, SymbolError};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use walkdir::WalkDir;

/// Reads the json file and deserializes it into the provided type.
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let file = fs::File::open(path).map_err(|err| SymbolError::io(err, path))?;
    let file = std::io::BufReader::new(file);
    Ok(serde_json::from_reader(file)?)
}

/// Writes serializes the provided value to json and writes it to the file,
/// using a sibling temp file and an atomic rename so that readers never
/// observe a half-written document.
pub fn write_json_file<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    create_parent_dir_all(path)?;
    let tmp = path.with_extension("json.tmp");
    {
        let file = fs::File::create(&tmp).map_err(|err| SymbolError::io(err, &tmp))?;
        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer(&mut writer, value)?;
        writer.flush().map_err(|err| SymbolError::io(err, &tmp))?;
    }
    fs::rename(&tmp, path).map_err(|err| SymbolError::io(err, path))?;
    Ok(())
}

/// Creates the parent directory of the given file path.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<()> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| SymbolError::io(err, parent))?;
    }
    Ok(())
}

/// Normalizes an archive entry name to forward slashes and splits it into
/// components, rejecting anything that could escape the extraction root.
///
/// Returns `None` for empty names, absolute paths, drive-prefixed paths and
/// names containing `..` components.
pub fn sanitize_archive_path(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    if normalized.is_empty() || normalized.starts_with('/') {
        return None;
    }
    let mut out = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            _ => {
                // `C:` style prefixes resolve outside the root on windows
                if part.ends_with(':') || part.contains(':') {
                    return None;
                }
                out.push(part);
            }
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Joins a (possibly hostile) archive entry name onto `root`, returning
/// `None` when the entry would land outside of it.
pub fn safe_join(root: &Path, name: &str) -> Option<PathBuf> {
    sanitize_archive_path(name).map(|rel| root.join(rel))
}

/// Returns `true` when `path`, after canonicalization, is a descendant of
/// `root`. Used to double-check extraction targets that already exist.
pub fn is_within(root: &Path, path: &Path) -> bool {
    let root = match dunce::canonicalize(root) {
        Ok(root) => root,
        Err(_) => return false,
    };
    match dunce::canonicalize(path) {
        Ok(path) => path.starts_with(&root),
        // a not-yet-created file cannot be canonicalized, check the parent
        Err(_) => match path.parent() {
            Some(parent) => {
                dunce::canonicalize(parent).map(|p| p.starts_with(&root)).unwrap_or(false)
            }
            None => false,
        },
    }
}

/// Recursively searches `dir` for a file whose name equals `file_name`,
/// compared case-insensitively. Follows symlinks, returns the first match in
/// walk order.
pub fn find_file_recursive_ci(dir: &Path, file_name: &str) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }
    WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .find(|e| e.file_name().to_string_lossy().eq_ignore_ascii_case(file_name))
        .map(|e| e.into_path())
}

/// Like [`find_file_recursive_ci`] but collects every match in walk order.
pub fn find_files_recursive_ci(dir: &Path, file_name: &str) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().eq_ignore_ascii_case(file_name))
        .map(|e| e.into_path())
        .collect()
}

/// Recursively searches `dir` for a directory whose name equals `dir_name`,
/// compared case-insensitively.
pub fn find_dir_recursive_ci(dir: &Path, dir_name: &str) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }
    WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_dir())
        .find(|e| e.file_name().to_string_lossy().eq_ignore_ascii_case(dir_name))
        .map(|e| e.into_path())
}

/// A cooperative cancellation signal shared between the orchestrator and all
/// suspendable operations. Checked between archive entries and download
/// chunks.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns `Err(SymbolError::Cancelled)` once [`Self::cancel`] has been
    /// called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SymbolError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Removes a temporary directory on drop unless it has been disarmed.
///
/// Used for `.temp_download` style scratch space so that a cancelled or
/// failed download does not leave partial archives behind.
#[derive(Debug)]
pub struct TempDirGuard {
    path: PathBuf,
    armed: bool,
}

impl TempDirGuard {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path).map_err(|err| SymbolError::io(err, &path))?;
        Ok(Self { path, armed: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keeps the directory on drop.
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        self.path.clone()
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = fs::remove_dir_all(&self.path) {
                if self.path.exists() {
                    warn!("failed to remove temp dir \"{}\": {err}", self.path.display());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sanitizes_entry_names() {
        assert_eq!(sanitize_archive_path("good/sym.pdb"), Some(PathBuf::from("good/sym.pdb")));
        assert_eq!(sanitize_archive_path("a\\b\\c.dll"), Some(PathBuf::from("a/b/c.dll")));
        assert_eq!(sanitize_archive_path("./a/./b"), Some(PathBuf::from("a/b")));
        assert_eq!(sanitize_archive_path("../evil.pdb"), None);
        assert_eq!(sanitize_archive_path("a/../../evil.pdb"), None);
        assert_eq!(sanitize_archive_path("/abs/path"), None);
        assert_eq!(sanitize_archive_path("\\abs\\path"), None);
        assert_eq!(sanitize_archive_path("C:\\windows\\evil.dll"), None);
        assert_eq!(sanitize_archive_path(""), None);
        assert_eq!(sanitize_archive_path("."), None);
    }

    #[test]
    fn safe_join_stays_under_root() {
        let root = Path::new("/out");
        assert_eq!(safe_join(root, "x/y.pdb"), Some(PathBuf::from("/out/x/y.pdb")));
        assert_eq!(safe_join(root, "../y.pdb"), None);
    }

    #[test]
    fn recursive_search_is_case_insensitive() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("MyModule.PDB"), b"x").unwrap();

        let found = find_file_recursive_ci(tmp.path(), "mymodule.pdb").unwrap();
        assert_eq!(found, nested.join("MyModule.PDB"));
        assert_eq!(find_file_recursive_ci(tmp.path(), "other.pdb"), None);
    }

    #[test]
    fn cancel_token_propagates() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(matches!(token.check(), Err(SymbolError::Cancelled)));
    }

    #[test]
    fn temp_dir_guard_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join(".temp_download");
        {
            let _guard = TempDirGuard::create(&scratch).unwrap();
            assert!(scratch.is_dir());
        }
        assert!(!scratch.exists());

        let kept = TempDirGuard::create(&scratch).unwrap().keep();
        assert!(kept.is_dir());
    }
}
