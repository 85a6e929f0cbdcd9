//! Portable PDB parsing.
//!
//! Portable PDBs are ECMA-335 metadata blobs (signature `BSJB`) carrying
//! the debug tables: documents, method debug information (sequence points)
//! and custom debug information (Source Link). This module reads the PDB
//! id from the `#Pdb` stream, extracts the Source Link JSON blob, decodes
//! sequence points and rewrites the PDB id in place so downloaded symbols
//! load against binaries from a close-but-not-identical build.
//!
//! Windows MSF PDBs (native C/C++ debug info) are detected by signature
//! and rejected with a typed error.

use crate::error::{Result, SymbolError};
use std::{collections::BTreeMap, fmt, fs, path::Path};
use uuid::Uuid;

mod blob;
pub mod patch;
pub mod pe;

#[cfg(test)]
pub(crate) mod testutil;

use blob::Reader;

/// Magic at the start of every ECMA-335 metadata root.
pub const METADATA_SIGNATURE: u32 = 0x424A_5342; // "BSJB"

/// Signature of Windows MSF ("big") PDBs.
const MSF_SIGNATURE: &[u8] = b"Microsoft C/C++ MSF 7.00";

/// Kind GUID of the Source Link custom-debug-information record.
pub const SOURCE_LINK_KIND: Uuid = Uuid::from_u128(0xcc11_0556_a091_4d38_9fec_25ab_9a35_1a6a_u128);

const TABLE_DOCUMENT: usize = 0x30;
const TABLE_METHOD_DEBUG_INFORMATION: usize = 0x31;
const TABLE_LOCAL_SCOPE: usize = 0x32;
const TABLE_LOCAL_VARIABLE: usize = 0x33;
const TABLE_LOCAL_CONSTANT: usize = 0x34;
const TABLE_IMPORT_SCOPE: usize = 0x35;
const TABLE_STATE_MACHINE_METHOD: usize = 0x36;
const TABLE_CUSTOM_DEBUG_INFORMATION: usize = 0x37;

const TABLE_METHOD_DEF: usize = 0x06;

/// Tables referenced by the `HasCustomDebugInformation` coded index, in tag
/// order.
const HAS_CUSTOM_DEBUG_INFORMATION_TABLES: &[usize] = &[
    0x06, 0x04, 0x01, 0x02, 0x08, 0x09, 0x0A, 0x00, 0x0E, 0x17, 0x14, 0x11, 0x1A, 0x1B, 0x20,
    0x23, 0x26, 0x27, 0x28, 0x2A, 0x2C, 0x2B, 0x30, 0x32, 0x33, 0x34, 0x35,
];

/// The 20-byte identifier at the head of the `#Pdb` stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PdbId {
    pub guid: Uuid,
    /// Build stamp / age revision.
    pub stamp: u32,
}

impl fmt::Display for PdbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:08x}", self.guid, self.stamp)
    }
}

/// A single sequence point decoded from a method's debug information.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SequencePoint {
    pub il_offset: u32,
    pub document: String,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
    /// Hidden points carry no line information and are excluded from
    /// lookups.
    pub hidden: bool,
}

#[derive(Clone, Debug)]
struct StreamHeader {
    name: String,
    offset: usize,
    size: usize,
}

/// A parsed portable PDB held in memory.
pub struct PortablePdb {
    data: Vec<u8>,
    streams: Vec<StreamHeader>,
}

impl PortablePdb {
    /// Reads and parses the file at `path`, distinguishing MSF PDBs and
    /// other non-portable content with typed errors.
    pub fn open(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|err| SymbolError::io(err, path))?;
        if data.starts_with(MSF_SIGNATURE) {
            return Err(SymbolError::MsfPdb(path.to_path_buf()));
        }
        if data.len() < 4 || u32::from_le_bytes([data[0], data[1], data[2], data[3]]) != METADATA_SIGNATURE
        {
            return Err(SymbolError::NotPortablePdb(path.to_path_buf()));
        }
        Self::parse(data)
    }

    /// Parses an in-memory metadata image.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let streams = Self::read_stream_headers(&data)?;
        Ok(Self { data, streams })
    }

    /// Walks the metadata root: signature, versions, reserved, padded
    /// version string, flags, stream count, then one header per stream.
    fn read_stream_headers(data: &[u8]) -> Result<Vec<StreamHeader>> {
        let mut r = Reader::new(data);
        if r.read_u32()? != METADATA_SIGNATURE {
            return Err(SymbolError::PdbFormat("missing BSJB signature".to_string()));
        }
        r.skip(2)?; // major version
        r.skip(2)?; // minor version
        r.skip(4)?; // reserved
        let version_len = r.read_u32()? as usize;
        if version_len > 256 {
            return Err(SymbolError::PdbFormat(format!(
                "implausible metadata version length {version_len}"
            )));
        }
        // the stored length is already rounded up to a 4-byte boundary
        r.skip(version_len)?;
        r.skip(2)?; // flags
        let stream_count = r.read_u16()? as usize;

        let mut streams = Vec::with_capacity(stream_count);
        for _ in 0..stream_count {
            let offset = r.read_u32()? as usize;
            let size = r.read_u32()? as usize;
            let name = r.read_aligned_name()?;
            if offset.checked_add(size).map_or(true, |end| end > data.len()) {
                return Err(SymbolError::PdbFormat(format!(
                    "stream \"{name}\" extends past the end of the image"
                )));
            }
            streams.push(StreamHeader { name, offset, size });
        }
        Ok(streams)
    }

    fn stream(&self, name: &str) -> Option<&[u8]> {
        self.stream_span(name).map(|(offset, size)| &self.data[offset..offset + size])
    }

    /// Absolute `(offset, size)` of the first stream with the given name.
    pub(crate) fn stream_span(&self, name: &str) -> Option<(usize, usize)> {
        self.streams.iter().find(|s| s.name == name).map(|s| (s.offset, s.size))
    }

    fn required_stream(&self, name: &str) -> Result<&[u8]> {
        self.stream(name)
            .ok_or_else(|| SymbolError::PdbFormat(format!("missing {name} stream")))
    }

    /// Reads the PDB id: a 16-byte little-endian GUID followed by the
    /// 4-byte build stamp.
    pub fn id(&self) -> Result<PdbId> {
        let mut r = Reader::new(self.required_stream("#Pdb")?);
        let guid_bytes: [u8; 16] = r.read_bytes(16)?.try_into().expect("16 bytes");
        let stamp = r.read_u32()?;
        Ok(PdbId { guid: Uuid::from_bytes_le(guid_bytes), stamp })
    }

    /// Returns the raw Source Link JSON blob, when the PDB carries one.
    pub fn source_link_json(&self) -> Result<Option<Vec<u8>>> {
        let tables = self.table_info()?;
        let count = tables.rows[TABLE_CUSTOM_DEBUG_INFORMATION] as usize;
        if count == 0 {
            return Ok(None);
        }
        let data = self.required_stream("#~")?;
        let offset = tables.offsets[TABLE_CUSTOM_DEBUG_INFORMATION];
        let row_size = tables.sizes[TABLE_CUSTOM_DEBUG_INFORMATION];
        for row in 0..count {
            let mut r = Reader::new(&data[offset + row * row_size..]);
            r.skip(tables.has_custom_debug_information_width)?;
            let kind = r.read_index(tables.guid_width)?;
            let value = r.read_index(tables.blob_width)?;
            if kind != 0 && self.guid(kind)? == SOURCE_LINK_KIND {
                return Ok(Some(self.blob(value)?.to_vec()));
            }
        }
        Ok(None)
    }

    /// Decodes every method's sequence points, keyed by the method
    /// definition row number. Hidden points are kept and flagged so
    /// callers can exclude them.
    pub fn sequence_points(&self) -> Result<BTreeMap<u32, Vec<SequencePoint>>> {
        let tables = self.table_info()?;
        let count = tables.rows[TABLE_METHOD_DEBUG_INFORMATION] as usize;
        let mut methods = BTreeMap::new();
        if count == 0 {
            return Ok(methods);
        }
        let data = self.required_stream("#~")?;
        let offset = tables.offsets[TABLE_METHOD_DEBUG_INFORMATION];
        let row_size = tables.sizes[TABLE_METHOD_DEBUG_INFORMATION];
        let doc_width = tables.table_index_width(TABLE_DOCUMENT);

        for row in 0..count {
            let mut r = Reader::new(&data[offset + row * row_size..]);
            let document = r.read_index(doc_width)?;
            let blob_index = r.read_index(tables.blob_width)?;
            if blob_index == 0 {
                continue;
            }
            let blob = self.blob(blob_index)?;
            let points = self.decode_sequence_points(&tables, document, blob)?;
            if !points.is_empty() {
                methods.insert(row as u32 + 1, points);
            }
        }
        Ok(methods)
    }

    fn decode_sequence_points(
        &self,
        tables: &TableInfo,
        document_row: u32,
        blob: &[u8],
    ) -> Result<Vec<SequencePoint>> {
        let mut r = Reader::new(blob);
        let _local_signature = r.read_compressed_u32()?;
        let mut document = if document_row == 0 { r.read_compressed_u32()? } else { document_row };
        let mut document_name = self.document_name(tables, document)?;

        let mut points = Vec::new();
        let mut il_offset = 0u32;
        let mut start_line = 0i64;
        let mut start_column = 0i64;
        let mut first_record = true;
        let mut first_non_hidden = true;

        while !r.is_empty() {
            let delta_il = r.read_compressed_u32()?;
            if !first_record && delta_il == 0 {
                // document-change record
                document = r.read_compressed_u32()?;
                document_name = self.document_name(tables, document)?;
                continue;
            }
            il_offset = if first_record { delta_il } else { il_offset.wrapping_add(delta_il) };
            first_record = false;

            let delta_lines = r.read_compressed_u32()? as i64;
            let delta_columns = if delta_lines == 0 {
                r.read_compressed_u32()? as i64
            } else {
                r.read_compressed_i32()? as i64
            };

            if delta_lines == 0 && delta_columns == 0 {
                points.push(SequencePoint {
                    il_offset,
                    document: document_name.clone(),
                    start_line: 0,
                    start_column: 0,
                    end_line: 0,
                    end_column: 0,
                    hidden: true,
                });
                continue;
            }

            if first_non_hidden {
                start_line = r.read_compressed_u32()? as i64;
                start_column = r.read_compressed_u32()? as i64;
                first_non_hidden = false;
            } else {
                start_line += r.read_compressed_i32()? as i64;
                start_column += r.read_compressed_i32()? as i64;
            }

            points.push(SequencePoint {
                il_offset,
                document: document_name.clone(),
                start_line: start_line as u32,
                start_column: start_column as u32,
                end_line: (start_line + delta_lines) as u32,
                end_column: (start_column + delta_columns) as u32,
                hidden: false,
            });
        }
        Ok(points)
    }

    /// Resolves a document row to its path. Document names are stored as a
    /// separator byte plus blob-heap indexes of the path parts.
    fn document_name(&self, tables: &TableInfo, row: u32) -> Result<String> {
        if row == 0 || row > tables.rows[TABLE_DOCUMENT] {
            return Err(SymbolError::PdbFormat(format!("document row {row} out of range")));
        }
        let data = self.required_stream("#~")?;
        let offset = tables.offsets[TABLE_DOCUMENT]
            + (row as usize - 1) * tables.sizes[TABLE_DOCUMENT];
        let mut r = Reader::new(&data[offset..]);
        let name_blob = r.read_index(tables.blob_width)?;

        let blob = self.blob(name_blob)?;
        let mut r = Reader::new(blob);
        let separator = r.read_u8()?;
        if separator > 0x7F {
            return Err(SymbolError::PdbFormat("non-ascii document separator".to_string()));
        }
        let mut name = String::new();
        let mut first = true;
        while !r.is_empty() {
            if !first && separator != 0 {
                name.push(separator as char);
            }
            first = false;
            let part = r.read_compressed_u32()?;
            if part != 0 {
                let bytes = self.blob(part)?;
                name.push_str(&String::from_utf8_lossy(bytes));
            }
        }
        Ok(name)
    }

    /// Reads a length-prefixed blob from the `#Blob` heap.
    fn blob(&self, index: u32) -> Result<&[u8]> {
        let heap = self.required_stream("#Blob")?;
        if index as usize >= heap.len() {
            return Err(SymbolError::PdbFormat(format!("blob index {index} out of range")));
        }
        let mut r = Reader::new(&heap[index as usize..]);
        let len = r.read_compressed_u32()? as usize;
        let start = index as usize + r.pos();
        heap.get(start..start + len)
            .ok_or_else(|| SymbolError::PdbFormat(format!("blob {index} extends past the heap")))
    }

    /// Reads a 1-based GUID-heap index.
    fn guid(&self, index: u32) -> Result<Uuid> {
        let heap = self.required_stream("#GUID")?;
        let start = (index as usize - 1) * 16;
        let bytes: [u8; 16] = heap
            .get(start..start + 16)
            .ok_or_else(|| SymbolError::PdbFormat(format!("guid index {index} out of range")))?
            .try_into()
            .expect("16 bytes");
        Ok(Uuid::from_bytes_le(bytes))
    }

    /// Parses the `#~` header plus the `#Pdb` referenced-table row counts
    /// into per-table offsets and row sizes.
    fn table_info(&self) -> Result<TableInfo> {
        // row counts of the type-system tables live in the #Pdb stream
        let mut external_rows = [0u32; 64];
        let mut r = Reader::new(self.required_stream("#Pdb")?);
        r.skip(20)?; // pdb id
        r.skip(4)?; // entry point token
        let referenced = r.read_u64()?;
        for (table, rows) in external_rows.iter_mut().enumerate() {
            if referenced & (1 << table) != 0 {
                *rows = r.read_u32()?;
            }
        }

        let mut r = Reader::new(self.required_stream("#~")?);
        r.skip(4)?; // reserved
        r.skip(2)?; // major/minor version
        let heap_sizes = r.read_u8()?;
        r.skip(1)?; // reserved
        let valid = r.read_u64()?;
        r.skip(8)?; // sorted

        let mut rows = [0u32; 64];
        for (table, count) in rows.iter_mut().enumerate() {
            if valid & (1 << table) != 0 {
                *count = r.read_u32()?;
            }
        }

        let mut info = TableInfo {
            rows,
            external_rows,
            string_width: if heap_sizes & 0x01 != 0 { 4 } else { 2 },
            guid_width: if heap_sizes & 0x02 != 0 { 4 } else { 2 },
            blob_width: if heap_sizes & 0x04 != 0 { 4 } else { 2 },
            has_custom_debug_information_width: 2,
            offsets: [0; 64],
            sizes: [0; 64],
        };
        info.has_custom_debug_information_width = {
            let max = HAS_CUSTOM_DEBUG_INFORMATION_TABLES
                .iter()
                .map(|&t| info.total_rows(t))
                .max()
                .unwrap_or(0);
            // 5 tag bits leave 11 bits of row number in a 2-byte index
            if max >= 1 << 11 {
                4
            } else {
                2
            }
        };

        let mut offset = r.pos();
        for table in 0..64 {
            if valid & (1 << table) == 0 {
                continue;
            }
            let row_size = info.row_size(table)?;
            info.offsets[table] = offset;
            info.sizes[table] = row_size;
            offset += row_size * info.rows[table] as usize;
        }
        Ok(info)
    }
}

struct TableInfo {
    /// Row counts of tables present in this image.
    rows: [u32; 64],
    /// Row counts of the type-system tables, from the `#Pdb` stream.
    external_rows: [u32; 64],
    string_width: usize,
    guid_width: usize,
    blob_width: usize,
    has_custom_debug_information_width: usize,
    /// Byte offset of each table's data within the `#~` stream.
    offsets: [usize; 64],
    /// Row byte size per table.
    sizes: [usize; 64],
}

impl TableInfo {
    fn total_rows(&self, table: usize) -> u32 {
        self.rows[table].saturating_add(self.external_rows[table])
    }

    fn table_index_width(&self, table: usize) -> usize {
        if self.total_rows(table) >= 0x10000 {
            4
        } else {
            2
        }
    }

    fn row_size(&self, table: usize) -> Result<usize> {
        let size = match table {
            TABLE_DOCUMENT => self.blob_width * 2 + self.guid_width * 2,
            TABLE_METHOD_DEBUG_INFORMATION => {
                self.table_index_width(TABLE_DOCUMENT) + self.blob_width
            }
            TABLE_LOCAL_SCOPE => {
                self.table_index_width(TABLE_METHOD_DEF)
                    + self.table_index_width(TABLE_IMPORT_SCOPE)
                    + self.table_index_width(TABLE_LOCAL_VARIABLE)
                    + self.table_index_width(TABLE_LOCAL_CONSTANT)
                    + 8
            }
            TABLE_LOCAL_VARIABLE => 4 + self.string_width,
            TABLE_LOCAL_CONSTANT => self.string_width + self.blob_width,
            TABLE_IMPORT_SCOPE => self.table_index_width(TABLE_IMPORT_SCOPE) + self.blob_width,
            TABLE_STATE_MACHINE_METHOD => self.table_index_width(TABLE_METHOD_DEF) * 2,
            TABLE_CUSTOM_DEBUG_INFORMATION => {
                self.has_custom_debug_information_width + self.guid_width + self.blob_width
            }
            other => {
                return Err(SymbolError::PdbFormat(format!(
                    "unexpected metadata table {other:#04x} in portable PDB"
                )))
            }
        };
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::{testutil::TestPdb, *};
    use pretty_assertions::assert_eq;

    #[test]
    fn reads_pdb_id() {
        let guid = Uuid::from_u128(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef);
        let pdb = TestPdb::new(guid, 0x1122_3344).build();
        let parsed = PortablePdb::parse(pdb).unwrap();
        let id = parsed.id().unwrap();
        assert_eq!(id.guid, guid);
        assert_eq!(id.stamp, 0x1122_3344);
    }

    #[test]
    fn rejects_msf_and_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let msf = tmp.path().join("native.pdb");
        std::fs::write(&msf, b"Microsoft C/C++ MSF 7.00\r\n\x1aDS\0\0\0").unwrap();
        assert!(matches!(PortablePdb::open(&msf), Err(SymbolError::MsfPdb(_))));

        let text = tmp.path().join("readme.pdb");
        std::fs::write(&text, b"not a pdb at all").unwrap();
        assert!(matches!(PortablePdb::open(&text), Err(SymbolError::NotPortablePdb(_))));
    }

    #[test]
    fn extracts_source_link() {
        let json = r#"{"documents":{"/src/*":"https://raw.example.com/r/abc/*"}}"#;
        let pdb = TestPdb::new(Uuid::from_u128(1), 0).source_link(json).build();
        let parsed = PortablePdb::parse(pdb).unwrap();
        let blob = parsed.source_link_json().unwrap().unwrap();
        assert_eq!(std::str::from_utf8(&blob).unwrap(), json);
    }

    #[test]
    fn missing_source_link_is_none() {
        let pdb = TestPdb::new(Uuid::from_u128(1), 0).build();
        let parsed = PortablePdb::parse(pdb).unwrap();
        assert_eq!(parsed.source_link_json().unwrap(), None);
    }

    #[test]
    fn decodes_sequence_points() {
        let pdb = TestPdb::new(Uuid::from_u128(7), 1)
            .document("/src/Lib/Widget.cs")
            .method(
                1,
                vec![
                    (0, 10, 9, 10, 20, false),
                    (6, 12, 13, 12, 30, false),
                    (17, 0, 0, 0, 0, true),
                    (25, 14, 9, 15, 10, false),
                ],
            )
            .build();
        let parsed = PortablePdb::parse(pdb).unwrap();
        let methods = parsed.sequence_points().unwrap();
        let points = &methods[&1];
        assert_eq!(points.len(), 4);

        assert_eq!(points[0].il_offset, 0);
        assert_eq!(points[0].start_line, 10);
        assert_eq!(points[0].start_column, 9);
        assert_eq!(points[0].end_line, 10);
        assert_eq!(points[0].end_column, 20);
        assert_eq!(points[0].document, "/src/Lib/Widget.cs");
        assert!(!points[0].hidden);

        assert_eq!(points[1].il_offset, 6);
        assert_eq!(points[1].start_line, 12);

        assert!(points[2].hidden);
        assert_eq!(points[2].il_offset, 17);

        assert_eq!(points[3].il_offset, 25);
        assert_eq!(points[3].start_line, 14);
        assert_eq!(points[3].end_line, 15);
        assert_eq!(points[3].end_column, 10);
    }

    #[test]
    fn multiple_methods_are_keyed_by_row() {
        let pdb = TestPdb::new(Uuid::from_u128(7), 1)
            .document("/src/A.cs")
            .method(1, vec![(0, 3, 1, 3, 5, false)])
            .method(1, vec![(0, 8, 1, 8, 9, false), (4, 9, 1, 9, 2, false)])
            .build();
        let parsed = PortablePdb::parse(pdb).unwrap();
        let methods = parsed.sequence_points().unwrap();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[&1].len(), 1);
        assert_eq!(methods[&2].len(), 2);
        assert_eq!(methods[&2][1].il_offset, 4);
    }
}
