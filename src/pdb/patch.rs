//! In-place patching of portable PDB ids.
//!
//! Downloaded symbols usually come from the CI build of the same commit,
//! not the exact binaries in the dump, so their PDB ids do not match what
//! the runtime demands. Rewriting the 16-byte GUID at the head of the
//! `#Pdb` stream makes the debugger accept them; the build stamp is left
//! untouched.

use super::{pe, PdbId, PortablePdb};
use crate::error::{Result, SymbolError};
use std::{
    collections::HashMap,
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use uuid::Uuid;
use walkdir::WalkDir;

/// Reads the PDB id of the portable PDB at `path`.
pub fn read_pdb_id(path: &Path) -> Result<PdbId> {
    PortablePdb::open(path)?.id()
}

/// Rewrites the GUID portion of the PDB id in place and verifies the
/// rewrite by re-reading the file. Returns the previous id.
///
/// When the file already carries `guid` nothing is written, leaving the
/// file byte-identical.
pub fn patch_pdb_id(path: &Path, guid: Uuid) -> Result<PdbId> {
    let pdb = PortablePdb::open(path)?;
    let previous = pdb.id()?;
    if previous.guid == guid {
        trace!("\"{}\" already has pdb id {guid}", path.display());
        return Ok(previous);
    }
    let (offset, size) = pdb
        .stream_span("#Pdb")
        .ok_or_else(|| SymbolError::PdbFormat("missing #Pdb stream".to_string()))?;
    if size < 20 {
        return Err(SymbolError::PdbFormat(format!("#Pdb stream too small ({size} bytes)")));
    }
    drop(pdb);

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| SymbolError::io(err, path))?;
    file.seek(SeekFrom::Start(offset as u64)).map_err(|err| SymbolError::io(err, path))?;
    file.write_all(&guid.to_bytes_le()).map_err(|err| SymbolError::io(err, path))?;
    file.flush().map_err(|err| SymbolError::io(err, path))?;
    drop(file);

    let observed = PortablePdb::open(path)?.id()?;
    if observed.guid != guid {
        return Err(SymbolError::PatchMismatch { expected: guid, observed: observed.guid });
    }
    debug!("patched \"{}\": {} -> {}", path.display(), previous.guid, guid);
    Ok(previous)
}

/// Where the expected GUID for a PDB comes from.
pub enum GuidSource<'a> {
    /// Read the CodeView record of the sibling `<module>.dll`.
    SiblingBinaries,
    /// Look the module name up in a prepared map (keys compared
    /// case-insensitively).
    Map(&'a HashMap<String, Uuid>),
}

/// Outcome of a directory scan.
#[derive(Debug, Default)]
pub struct PatchSummary {
    /// PDBs whose GUID was rewritten.
    pub patched: Vec<PathBuf>,
    /// PDBs that already carried the expected GUID.
    pub unchanged: Vec<PathBuf>,
    /// PDBs with no expected GUID available (no sibling binary / no map
    /// entry).
    pub skipped: Vec<PathBuf>,
    /// Per-file failures; the scan continues past them.
    pub failures: Vec<(PathBuf, String)>,
}

/// Patches every `.pdb` under `dir` against the expected GUID from
/// `source`. Format errors on individual files are collected, not fatal.
pub fn patch_directory(dir: &Path, source: GuidSource<'_>) -> Result<PatchSummary> {
    let map_lowercased = match &source {
        GuidSource::Map(map) => {
            Some(map.iter().map(|(k, v)| (k.to_lowercase(), *v)).collect::<HashMap<_, _>>())
        }
        GuidSource::SiblingBinaries => None,
    };

    let mut summary = PatchSummary::default();
    for entry in WalkDir::new(dir).follow_links(true).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file()
            || !path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("pdb"))
                .unwrap_or(false)
        {
            continue;
        }
        let module = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => stem.to_string(),
            None => continue,
        };

        let expected = match &map_lowercased {
            Some(map) => map.get(&module.to_lowercase()).copied(),
            None => match sibling_binary_guid(path) {
                Ok(guid) => guid,
                Err(err) => {
                    warn!("cannot read binary for \"{}\": {err}", path.display());
                    summary.failures.push((path.to_path_buf(), err.to_string()));
                    continue;
                }
            },
        };
        let Some(expected) = expected else {
            summary.skipped.push(path.to_path_buf());
            continue;
        };

        match patch_pdb_id(path, expected) {
            Ok(previous) if previous.guid == expected => {
                summary.unchanged.push(path.to_path_buf())
            }
            Ok(_) => summary.patched.push(path.to_path_buf()),
            Err(err) => {
                warn!("failed to patch \"{}\": {err}", path.display());
                summary.failures.push((path.to_path_buf(), err.to_string()));
            }
        }
    }
    Ok(summary)
}

fn sibling_binary_guid(pdb: &Path) -> Result<Option<Uuid>> {
    let dll = pdb.with_extension("dll");
    if !dll.is_file() {
        return Ok(None);
    }
    Ok(pe::read_codeview(&dll)?.map(|info| info.guid))
}
