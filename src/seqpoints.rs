//! Mapping `(module, method token, IL offset)` to a source position.
//!
//! The debugger reports managed frames as a method token plus an IL
//! offset. This resolver loads the module's portable PDB once, keeps all
//! sequence points in memory and answers lookups with the nearest point
//! at or below the requested offset.

use crate::{
    error::Result,
    pdb::{PdbId, PortablePdb, SequencePoint},
    sourcelink::{SourceLocation, SourceProvider},
    utils,
};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};
use uuid::Uuid;

/// Sequence points of one module, keyed by method-definition row, sorted
/// by IL offset, hidden points dropped.
#[derive(Debug, Default)]
struct ModulePoints {
    methods: BTreeMap<u32, Vec<SequencePoint>>,
}

impl ModulePoints {
    fn load(pdb: &PortablePdb) -> Result<Self> {
        let mut methods = pdb.sequence_points()?;
        for points in methods.values_mut() {
            points.retain(|p| !p.hidden);
            points.sort_by_key(|p| p.il_offset);
        }
        methods.retain(|_, points| !points.is_empty());
        Ok(Self { methods })
    }

    /// The sequence point with the greatest IL offset at or below `il_offset`.
    fn nearest_below(&self, method_row: u32, il_offset: u32) -> Option<&SequencePoint> {
        let points = self.methods.get(&method_row)?;
        points.iter().take_while(|p| p.il_offset <= il_offset).last()
    }
}

/// Resolver over one or more symbol search paths.
///
/// Modules are cached per `(module, expected id)` so a later query with a
/// different expected GUID re-runs discovery instead of answering from the
/// wrong PDB.
#[derive(Debug)]
pub struct SequencePointResolver {
    symbol_paths: Vec<PathBuf>,
    modules: HashMap<String, Option<ModulePoints>>,
}

impl SequencePointResolver {
    pub fn new(symbol_paths: Vec<PathBuf>) -> Self {
        Self { symbol_paths, modules: HashMap::new() }
    }

    /// Module identifier: file stem for path-like modules, the name itself
    /// for bare dotted assembly names like `System.Threading`.
    fn module_id(module_path: &str) -> String {
        let normalized = module_path.replace('\\', "/");
        let path = Path::new(&normalized);
        let has_binary_extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                ["dll", "exe", "pdb"].iter().any(|m| ext.eq_ignore_ascii_case(m))
            })
            .unwrap_or(false);
        if !normalized.contains('/') && !has_binary_extension {
            return module_path.to_string();
        }
        let name = if has_binary_extension { path.file_stem() } else { path.file_name() };
        name.and_then(|s| s.to_str()).unwrap_or(module_path).to_string()
    }

    fn cache_key(module_id: &str, guid: Option<Uuid>, stamp: Option<u32>) -> String {
        match (guid, stamp) {
            (Some(guid), Some(stamp)) => format!("{module_id}|{guid}|{stamp}"),
            (Some(guid), None) => format!("{module_id}|{guid}"),
            _ => module_id.to_string(),
        }
    }

    /// Whether the PDB at `path` carries the expected id.
    fn id_matches(path: &Path, guid: Option<Uuid>, stamp: Option<u32>) -> bool {
        let Some(expected) = guid else { return true };
        match PortablePdb::open(path).and_then(|pdb| pdb.id()) {
            Ok(PdbId { guid, stamp: actual_stamp }) => {
                guid == expected && stamp.map(|s| s == actual_stamp).unwrap_or(true)
            }
            Err(err) => {
                trace!("skipping candidate \"{}\": {err}", path.display());
                false
            }
        }
    }

    /// Finds a PDB for the module, preferring one whose id matches the
    /// expectation. Candidates are the module's sibling PDB and each
    /// symbol path, searched recursively and case-insensitively.
    fn find_pdb(
        &self,
        module_path: &str,
        module_id: &str,
        guid: Option<Uuid>,
        stamp: Option<u32>,
    ) -> Option<PathBuf> {
        let file_name = format!("{module_id}.pdb");
        let normalized = module_path.replace('\\', "/");
        let mut candidates = Vec::new();
        if normalized.contains('/') {
            candidates.push(Path::new(&normalized).with_extension("pdb"));
        }
        for search_path in &self.symbol_paths {
            candidates.push(search_path.join(&file_name));
            candidates.extend(utils::find_files_recursive_ci(search_path, &file_name));
        }
        candidates.into_iter().filter(|p| p.is_file()).find(|p| Self::id_matches(p, guid, stamp))
    }

    /// Resolves a frame to its source position.
    ///
    /// Negative IL offsets (no native-to-IL mapping) and unknown methods
    /// return `None`. The answer uses the nearest sequence point at or
    /// below the offset.
    pub fn get_source_location(
        &mut self,
        module_path: &str,
        expected_guid: Option<Uuid>,
        expected_stamp: Option<u32>,
        method_token: u32,
        il_offset: i64,
    ) -> Option<SourceLocation> {
        if il_offset < 0 {
            return None;
        }
        let il_offset = u32::try_from(il_offset).ok()?;
        // tokens carry the table in the high byte, rows key the cache
        let method_row = method_token & 0x00FF_FFFF;

        let module_id = Self::module_id(module_path);
        let key = Self::cache_key(&module_id, expected_guid, expected_stamp);
        if !self.modules.contains_key(&key) {
            let loaded = self
                .find_pdb(module_path, &module_id, expected_guid, expected_stamp)
                .and_then(|path| match PortablePdb::open(&path).and_then(|pdb| ModulePoints::load(&pdb)) {
                    Ok(points) => Some(points),
                    Err(err) => {
                        warn!("failed to load sequence points from \"{}\": {err}", path.display());
                        None
                    }
                });
            self.modules.insert(key.clone(), loaded);
        }

        let points = self.modules.get(&key)?.as_ref()?;
        let point = points.nearest_below(method_row, il_offset)?;
        Some(SourceLocation {
            source_file: point.document.clone(),
            line: point.start_line,
            column: Some(point.start_column),
            url: None,
            raw_url: None,
            provider: SourceProvider::Generic,
            resolved: true,
            error: None,
        })
    }
}
