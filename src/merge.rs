//! Merging multi-archive symbol bundles into the on-disk layout.
//!
//! Each provider artifact is a zip holding a different slice of the build:
//! native `.debug`/`.pdb` files, the managed tracer home, or the
//! cross-architecture universal symbols. The merger streams all of them
//! into a single `symbols-<suffix>/` root with a native and a managed
//! subdirectory, guarding every entry against path traversal.

use crate::{
    error::{Result, SymbolError},
    platform::ArtifactKind,
    utils::{self, CancelToken},
};
use std::{
    collections::BTreeMap,
    fs,
    io::{self, Read},
    path::{Component, Path, PathBuf},
};
use zip::ZipArchive;

/// Extensions recognized as symbol or binary payloads.
const SYMBOL_EXTENSIONS: &[&str] = &["debug", "pdb", "so", "dll", "dylib"];

/// Outcome of merging one bundle set.
#[derive(Clone, Debug, Default)]
pub struct MergeResult {
    pub success: bool,
    /// The `symbols-<suffix>` layout root.
    pub root: PathBuf,
    /// Native debug files and native libraries.
    pub native_dir: PathBuf,
    /// Managed PDBs and their DLLs.
    pub managed_dir: PathBuf,
    pub debug_files: Vec<PathBuf>,
    pub pdb_files: Vec<PathBuf>,
    pub other_binaries: Vec<PathBuf>,
    pub extracted_count: usize,
    /// First archive-level failure; entry-level failures only warn.
    pub error: Option<String>,
}

impl MergeResult {
    fn record(&mut self, dest: &Path) {
        match dest.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("debug") => {
                self.debug_files.push(dest.to_path_buf())
            }
            Some(ext) if ext.eq_ignore_ascii_case("pdb") => {
                self.pdb_files.push(dest.to_path_buf())
            }
            _ => self.other_binaries.push(dest.to_path_buf()),
        }
    }
}

fn has_symbol_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| SYMBOL_EXTENSIONS.iter().any(|s| ext.eq_ignore_ascii_case(s)))
        .unwrap_or(false)
}

/// Index of the `*.dSYM` bundle component, if any. Files inside a dSYM
/// bundle (`DWARF/MyApp`) carry no extension but are symbol payloads.
fn dsym_bundle_start(path: &Path) -> Option<usize> {
    path.components().position(|c| match c {
        Component::Normal(name) => {
            name.to_str().map(|n| n.to_ascii_lowercase().ends_with(".dsym")).unwrap_or(false)
        }
        _ => false,
    })
}

fn is_metadata_entry(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::Normal(n) if n == "__MACOSX"))
}

/// Whether a sanitized entry path is a symbol payload worth extracting.
fn is_symbol_entry(path: &Path) -> bool {
    !is_metadata_entry(path) && (has_symbol_extension(path) || dsym_bundle_start(path).is_some())
}

fn component_matches(path: &Path, dir_name: &str) -> bool {
    let mut components: Vec<_> = path.components().collect();
    components.pop(); // the file itself
    components.iter().any(
        |c| matches!(c, Component::Normal(n) if n.to_str().map(|n| n.eq_ignore_ascii_case(dir_name)).unwrap_or(false)),
    )
}

fn depth(path: &Path) -> usize {
    path.components().count()
}

/// Merges the downloaded artifact archives into `output_root`.
///
/// Creates `output_root/<platform_suffix>/` (native) and
/// `output_root/<framework_folder>/` (managed) and classifies every
/// acceptable entry into one of them. Invalid archives mark the result as
/// failed but leave already-extracted files in place; disallowed or
/// traversal entries are silently ignored.
pub fn merge_symbol_archives(
    archives: &BTreeMap<ArtifactKind, PathBuf>,
    output_root: &Path,
    platform_suffix: &str,
    framework_folder: &str,
    cancel: &CancelToken,
) -> Result<MergeResult> {
    let native_dir = output_root.join(platform_suffix);
    let managed_dir = output_root.join(framework_folder);
    fs::create_dir_all(&native_dir).map_err(|err| SymbolError::io(err, &native_dir))?;
    fs::create_dir_all(&managed_dir).map_err(|err| SymbolError::io(err, &managed_dir))?;

    let mut result = MergeResult {
        success: true,
        root: output_root.to_path_buf(),
        native_dir: native_dir.clone(),
        managed_dir: managed_dir.clone(),
        ..Default::default()
    };

    for (kind, archive_path) in archives {
        debug!("merging {kind} from \"{}\"", archive_path.display());
        if let Err(err) = merge_one_archive(
            *kind,
            archive_path,
            &native_dir,
            &managed_dir,
            platform_suffix,
            framework_folder,
            cancel,
            &mut result,
        ) {
            if matches!(err, SymbolError::Cancelled) {
                return Err(err);
            }
            warn!("failed to merge \"{}\": {err}", archive_path.display());
            result.success = false;
            result.error.get_or_insert_with(|| err.to_string());
        }
    }
    Ok(result)
}

#[allow(clippy::too_many_arguments)]
fn merge_one_archive(
    kind: ArtifactKind,
    archive_path: &Path,
    native_dir: &Path,
    managed_dir: &Path,
    platform_suffix: &str,
    framework_folder: &str,
    cancel: &CancelToken,
    result: &mut MergeResult,
) -> Result<()> {
    let file = fs::File::open(archive_path).map_err(|err| SymbolError::io(err, archive_path))?;
    let mut archive = ZipArchive::new(file).map_err(|err| SymbolError::InvalidArchive {
        path: archive_path.to_path_buf(),
        message: err.to_string(),
    })?;

    for index in 0..archive.len() {
        cancel.check()?;
        let mut entry = archive.by_index(index).map_err(|err| SymbolError::InvalidArchive {
            path: archive_path.to_path_buf(),
            message: err.to_string(),
        })?;
        if entry.is_dir() || entry.name().is_empty() {
            continue;
        }
        let Some(rel) = utils::sanitize_archive_path(entry.name()) else {
            trace!("ignoring unsafe entry \"{}\"", entry.name());
            continue;
        };
        if !is_symbol_entry(&rel) {
            continue;
        }
        let Some(dest) = classify(kind, &rel, native_dir, managed_dir, platform_suffix, framework_folder)
        else {
            continue;
        };

        // an existing file of the same size counts as already extracted
        if let Ok(meta) = dest.metadata() {
            if meta.len() == entry.size() {
                result.record(&dest);
                result.extracted_count += 1;
                continue;
            }
        }

        match write_entry(&mut entry, &dest) {
            Ok(()) => {
                result.record(&dest);
                result.extracted_count += 1;
            }
            Err(err) => {
                warn!("failed to extract \"{}\": {err}", rel.display());
            }
        }
    }
    Ok(())
}

/// Destination for an acceptable entry, or `None` when this kind does not
/// place it.
fn classify(
    kind: ArtifactKind,
    rel: &Path,
    native_dir: &Path,
    managed_dir: &Path,
    platform_suffix: &str,
    framework_folder: &str,
) -> Option<PathBuf> {
    let file_name = rel.file_name()?;
    let ext = rel.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase());
    let ext = ext.as_deref();

    match kind {
        ArtifactKind::TracerSymbols | ArtifactKind::ProfilerSymbols => {
            // dSYM bundles keep their internal structure
            if let Some(start) = dsym_bundle_start(rel) {
                let bundle_rel: PathBuf = rel.components().skip(start).collect();
                return Some(native_dir.join(bundle_rel));
            }
            if matches!(ext, Some("debug") | Some("pdb"))
                && (depth(rel) == 1 || component_matches(rel, platform_suffix))
            {
                return Some(native_dir.join(file_name));
            }
            None
        }
        ArtifactKind::MonitoringHome => {
            if matches!(ext, Some("pdb") | Some("dll")) && component_matches(rel, framework_folder)
            {
                return Some(managed_dir.join(file_name));
            }
            if matches!(ext, Some("so") | Some("dylib") | Some("dll"))
                && component_matches(rel, platform_suffix)
            {
                return Some(native_dir.join(file_name));
            }
            None
        }
        ArtifactKind::UniversalSymbols => {
            if ext == Some("debug") && depth(rel) <= 2 {
                return Some(native_dir.join(file_name));
            }
            None
        }
    }
}

fn write_entry(entry: &mut impl Read, dest: &Path) -> Result<()> {
    utils::create_parent_dir_all(dest)?;
    let mut out = fs::File::create(dest).map_err(|err| SymbolError::io(err, dest))?;
    io::copy(entry, &mut out).map_err(|err| SymbolError::io(err, dest))?;
    Ok(())
}

/// Safely extracts every symbol payload from a single zip into `dest_dir`,
/// preserving relative paths.
///
/// This is the generic single-archive path: entries with a symbol
/// extension and dSYM bundle members are extracted, macOS resource-fork
/// metadata is dropped, and traversal attempts are silently ignored.
pub fn extract_symbol_zip(
    zip_path: &Path,
    dest_dir: &Path,
    cancel: &CancelToken,
) -> Result<Vec<PathBuf>> {
    let file = fs::File::open(zip_path).map_err(|err| SymbolError::io(err, zip_path))?;
    let mut archive = ZipArchive::new(file).map_err(|err| SymbolError::InvalidArchive {
        path: zip_path.to_path_buf(),
        message: err.to_string(),
    })?;

    let mut extracted = Vec::new();
    for index in 0..archive.len() {
        cancel.check()?;
        let mut entry = archive.by_index(index).map_err(|err| SymbolError::InvalidArchive {
            path: zip_path.to_path_buf(),
            message: err.to_string(),
        })?;
        if entry.is_dir() || entry.name().is_empty() {
            continue;
        }
        let Some(rel) = utils::sanitize_archive_path(entry.name()) else {
            trace!("ignoring unsafe entry \"{}\"", entry.name());
            continue;
        };
        if !is_symbol_entry(&rel) {
            continue;
        }
        let dest = dest_dir.join(&rel);
        match write_entry(&mut entry, &dest) {
            Ok(()) => extracted.push(dest),
            Err(err) => warn!("failed to extract \"{}\": {err}", rel.display()),
        }
    }
    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use zip::{write::SimpleFileOptions, ZipWriter};

    fn build_zip(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join(name);
        let mut writer = ZipWriter::new(fs::File::create(&path).unwrap());
        for (entry_name, content) in entries {
            writer.start_file(*entry_name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn walk(root: &Path) -> Vec<String> {
        let mut files: Vec<String> = walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                e.path()
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        files.sort();
        files
    }

    #[test]
    fn traversal_and_junk_entries_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let zip = build_zip(
            tmp.path(),
            "bundle.zip",
            &[
                ("../evil.pdb", b"evil".as_slice()),
                ("notes.txt", b"notes"),
                ("__MACOSX/._meta", b"junk"),
                ("good/sym.pdb", b"good"),
                ("bundle.dSYM/Contents/Resources/DWARF/MyApp", b"dwarf"),
            ],
        );
        let dest = tmp.path().join("out");
        let extracted = extract_symbol_zip(&zip, &dest, &CancelToken::new()).unwrap();

        assert_eq!(
            walk(&dest),
            vec![
                "bundle.dSYM/Contents/Resources/DWARF/MyApp".to_string(),
                "good/sym.pdb".to_string(),
            ]
        );
        assert_eq!(extracted.len(), 2);
        // nothing escaped the output root
        assert!(!tmp.path().join("evil.pdb").exists());
        assert!(walk(tmp.path()).iter().all(|p| !p.contains("evil")));
    }

    #[test]
    fn merges_kinds_into_native_and_managed_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let tracer = build_zip(
            tmp.path(),
            "tracer.zip",
            &[
                ("Datadog.Tracer.Native.so.debug", b"root-debug".as_slice()),
                ("linux-x64/libdatadog.so.debug", b"nested-debug"),
                ("other-dir/skipme.debug", b"skipped"),
                ("readme.md", b"skipped"),
            ],
        );
        let home = build_zip(
            tmp.path(),
            "home.zip",
            &[
                ("monitoring-home/net6.0/Datadog.Trace.pdb", b"managed-pdb".as_slice()),
                ("monitoring-home/net6.0/Datadog.Trace.dll", b"managed-dll"),
                ("monitoring-home/linux-x64/Datadog.Tracer.Native.so", b"native-so"),
                ("monitoring-home/netcoreapp3.1/Datadog.Trace.pdb", b"other-tfm"),
            ],
        );
        let universal = build_zip(
            tmp.path(),
            "universal.zip",
            &[
                ("libdatadog_profiling.debug", b"uni-root".as_slice()),
                ("linux-x64/liboverride.debug", b"uni-one-deep"),
                ("a/b/too-deep.debug", b"skipped"),
            ],
        );

        let archives = BTreeMap::from([
            (ArtifactKind::TracerSymbols, tracer),
            (ArtifactKind::MonitoringHome, home),
            (ArtifactKind::UniversalSymbols, universal),
        ]);
        let root = tmp.path().join("symbols-linux-x64");
        let result = merge_symbol_archives(
            &archives,
            &root,
            "linux-x64",
            "net6.0",
            &CancelToken::new(),
        )
        .unwrap();

        assert!(result.success);
        assert_eq!(result.error, None);
        assert_eq!(
            walk(&root),
            vec![
                "linux-x64/Datadog.Tracer.Native.so".to_string(),
                "linux-x64/Datadog.Tracer.Native.so.debug".to_string(),
                "linux-x64/libdatadog.so.debug".to_string(),
                "linux-x64/libdatadog_profiling.debug".to_string(),
                "linux-x64/liboverride.debug".to_string(),
                "net6.0/Datadog.Trace.dll".to_string(),
                "net6.0/Datadog.Trace.pdb".to_string(),
            ]
        );
        assert_eq!(result.extracted_count, 7);
        assert_eq!(result.debug_files.len(), 4);
        assert_eq!(result.pdb_files.len(), 1);
        assert_eq!(result.other_binaries.len(), 2);
    }

    #[test]
    fn existing_same_size_files_are_recorded_not_rewritten() {
        let tmp = tempfile::tempdir().unwrap();
        let tracer = build_zip(
            tmp.path(),
            "tracer.zip",
            &[("sym.pdb", b"12345".as_slice())],
        );
        let root = tmp.path().join("symbols-win-x64");
        let archives = BTreeMap::from([(ArtifactKind::TracerSymbols, tracer)]);

        let first = merge_symbol_archives(&archives, &root, "win-x64", "net6.0", &CancelToken::new())
            .unwrap();
        assert_eq!(first.extracted_count, 1);
        let modified = fs::metadata(root.join("win-x64/sym.pdb")).unwrap().modified().unwrap();

        let second =
            merge_symbol_archives(&archives, &root, "win-x64", "net6.0", &CancelToken::new())
                .unwrap();
        assert_eq!(second.extracted_count, 1);
        assert_eq!(second.pdb_files.len(), 1);
        assert_eq!(
            fs::metadata(root.join("win-x64/sym.pdb")).unwrap().modified().unwrap(),
            modified
        );
    }

    #[test]
    fn invalid_archive_marks_failure_but_continues() {
        let tmp = tempfile::tempdir().unwrap();
        let broken = tmp.path().join("broken.zip");
        fs::write(&broken, b"this is not a zip").unwrap();
        let good = build_zip(tmp.path(), "good.zip", &[("sym.debug", b"x".as_slice())]);

        let archives = BTreeMap::from([
            (ArtifactKind::ProfilerSymbols, broken),
            (ArtifactKind::TracerSymbols, good),
        ]);
        let root = tmp.path().join("symbols-linux-arm64");
        let result =
            merge_symbol_archives(&archives, &root, "linux-arm64", "net6.0", &CancelToken::new())
                .unwrap();

        assert!(!result.success);
        assert!(result.error.is_some());
        // the good archive still extracted
        assert_eq!(result.extracted_count, 1);
        assert!(root.join("linux-arm64/sym.debug").is_file());
    }

    #[test]
    fn cancellation_stops_extraction() {
        let tmp = tempfile::tempdir().unwrap();
        let zip = build_zip(tmp.path(), "t.zip", &[("a.pdb", b"x".as_slice())]);
        let archives = BTreeMap::from([(ArtifactKind::TracerSymbols, zip)]);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = merge_symbol_archives(
            &archives,
            &tmp.path().join("symbols-win-x64"),
            "win-x64",
            "net6.0",
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, SymbolError::Cancelled));
    }
}
