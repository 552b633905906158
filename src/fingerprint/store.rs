// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Fingerprint Store (FS) — loads video records from a tabular (CSV-shaped)
//! source and offers read-only, constant-time access by load-order index.
//!
//! Grounded in `original_source/src/identifier/db.py::_load_database`: rows
//! are `(id, title, duration_s, segment_length_s, encoding_tag, seg_0, seg_1,
//! …)`, one row per encoding, and the original's unconditional pickle cache is
//! generalized here into the teacher's versioned binary-cache shape
//! (`storage/chunk_pool.rs`'s manual `byteorder` header).

use std::collections::HashSet;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{info, warn};

use crate::error::{IdError, Result};

const CACHE_MAGIC: &[u8; 8] = b"FPDB0001";

/// Metadata for one loaded record (one row == one video/encoding pair).
#[derive(Debug, Clone, PartialEq)]
pub struct VideoMeta {
    pub id: String,
    pub title: String,
    pub duration_secs: i64,
    pub segment_length_secs: f64,
    pub encoding_tag: String,
}

/// Loads and owns every fingerprint byte sequence plus its metadata.
/// Immutable after `load`; `video_idx` is the row's load-order position.
#[derive(Debug, Default)]
pub struct FingerprintStore {
    videos: Vec<VideoMeta>,
    fingerprints: Vec<Vec<u32>>,
    ids: HashSet<String>,
}

impl FingerprintStore {
    /// Parse the CSV-shaped tabular source at `path`.
    ///
    /// Handles both the standard 5-column-prefix layout and the variant form
    /// that omits `encoding_tag` — detected by sniffing whether column index
    /// 4 parses as an integer segment size rather than a tag string.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(IdError::Io)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);

        let mut videos = Vec::new();
        let mut fingerprints = Vec::new();
        let mut ids = HashSet::new();

        for (row_num, result) in reader.records().enumerate() {
            let record = match result {
                Ok(r) => r,
                Err(e) => {
                    warn!(row = row_num, error = %e, "Skipping malformed CSV row");
                    continue;
                }
            };
            match parse_row(&record) {
                Ok((meta, segments)) => {
                    ids.insert(meta.id.clone());
                    videos.push(meta);
                    fingerprints.push(segments);
                }
                Err(e) => {
                    warn!(row = row_num, error = %e, "Skipping malformed row");
                }
            }
        }

        if videos.is_empty() {
            return Err(IdError::Load(format!(
                "no usable rows loaded from {}",
                path.display()
            )));
        }

        info!(videos = videos.len(), path = %path.display(), "Fingerprint database loaded");
        Ok(Self { videos, fingerprints, ids })
    }

    /// Load from a binary cache if it exists and matches the source file's
    /// modification time and length; otherwise parse the CSV and (re)write
    /// the cache. A version or freshness mismatch triggers a silent rebuild.
    pub fn load_or_build(csv_path: &Path, cache_path: &Path) -> Result<Self> {
        if let Some(store) = Self::try_load_cache(csv_path, cache_path) {
            info!(path = %cache_path.display(), "Fingerprint database loaded from cache");
            return Ok(store);
        }

        let store = Self::load(csv_path)?;
        if let Err(e) = store.write_cache(csv_path, cache_path) {
            warn!(error = %e, "Failed to write fingerprint cache (continuing uncached)");
        }
        Ok(store)
    }

    fn try_load_cache(csv_path: &Path, cache_path: &Path) -> Option<Self> {
        let source_meta = std::fs::metadata(csv_path).ok()?;
        let source_mtime = source_meta
            .modified()
            .ok()?
            .duration_since(std::time::UNIX_EPOCH)
            .ok()?
            .as_secs() as i64;
        let source_len = source_meta.len();

        let mut f = BufReader::new(std::fs::File::open(cache_path).ok()?);
        let mut magic = [0u8; 8];
        f.read_exact(&mut magic).ok()?;
        if &magic != CACHE_MAGIC {
            return None;
        }
        let cached_mtime = f.read_i64::<LittleEndian>().ok()?;
        let cached_len = f.read_u64::<LittleEndian>().ok()?;
        if cached_mtime != source_mtime || cached_len != source_len {
            return None;
        }

        let count = f.read_u64::<LittleEndian>().ok()? as usize;
        let mut videos = Vec::with_capacity(count);
        let mut fingerprints = Vec::with_capacity(count);
        let mut ids = HashSet::new();

        for _ in 0..count {
            let id = read_string(&mut f)?;
            let title = read_string(&mut f)?;
            let duration_secs = f.read_i64::<LittleEndian>().ok()?;
            let segment_length_secs = f.read_f64::<LittleEndian>().ok()?;
            let encoding_tag = read_string(&mut f)?;
            let n_segments = f.read_u32::<LittleEndian>().ok()? as usize;
            let mut segments = Vec::with_capacity(n_segments);
            for _ in 0..n_segments {
                segments.push(f.read_u32::<LittleEndian>().ok()?);
            }
            ids.insert(id.clone());
            videos.push(VideoMeta { id, title, duration_secs, segment_length_secs, encoding_tag });
            fingerprints.push(segments);
        }

        Some(Self { videos, fingerprints, ids })
    }

    fn write_cache(&self, csv_path: &Path, cache_path: &Path) -> Result<()> {
        let source_meta = std::fs::metadata(csv_path)?;
        let source_mtime = source_meta
            .modified()
            .map_err(IdError::Io)?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let source_len = source_meta.len();

        let mut f = BufWriter::new(std::fs::File::create(cache_path)?);
        f.write_all(CACHE_MAGIC)?;
        f.write_i64::<LittleEndian>(source_mtime)?;
        f.write_u64::<LittleEndian>(source_len)?;
        f.write_u64::<LittleEndian>(self.videos.len() as u64)?;

        for (meta, segments) in self.videos.iter().zip(self.fingerprints.iter()) {
            write_string(&mut f, &meta.id)?;
            write_string(&mut f, &meta.title)?;
            f.write_i64::<LittleEndian>(meta.duration_secs)?;
            f.write_f64::<LittleEndian>(meta.segment_length_secs)?;
            write_string(&mut f, &meta.encoding_tag)?;
            f.write_u32::<LittleEndian>(segments.len() as u32)?;
            for s in segments {
                f.write_u32::<LittleEndian>(*s)?;
            }
        }
        f.flush()?;
        Ok(())
    }

    /// Constant-time metadata lookup.
    pub fn video(&self, video_idx: usize) -> Option<&VideoMeta> {
        self.videos.get(video_idx)
    }

    /// Constant-time borrow of the segment sequence for one video/encoding.
    pub fn fingerprint(&self, video_idx: usize) -> Option<&[u32]> {
        self.fingerprints.get(video_idx).map(|v| v.as_slice())
    }

    /// All loaded fingerprints, in load order.
    pub fn fingerprints(&self) -> &[Vec<u32>] {
        &self.fingerprints
    }

    /// Number of loaded records (one per video/encoding row).
    pub fn len(&self) -> usize {
        self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }

    /// Distinct video ids, used by tests and `inspect-db` to check coverage.
    pub fn ids(&self) -> &HashSet<String> {
        &self.ids
    }
}

fn parse_row(record: &csv::StringRecord) -> std::result::Result<(VideoMeta, Vec<u32>), String> {
    if record.len() < 5 {
        return Err(format!("row has only {} columns, need >= 5", record.len()));
    }
    let id = record[0].to_string();
    let title = record[1].to_string();
    let duration_secs: i64 = record[2]
        .parse()
        .map_err(|_| format!("non-integer duration_s '{}'", &record[2]))?;
    let segment_length_secs: f64 = record[3]
        .parse()
        .map_err(|_| format!("non-numeric segment_length_s '{}'", &record[3]))?;

    // Sniff column 4: if it parses as a non-negative integer, this row uses
    // the variant layout that omits `encoding_tag`.
    let (encoding_tag, seg_start) = match record[4].parse::<u32>() {
        Ok(_) => ("0".to_string(), 4),
        Err(_) => (record[4].to_string(), 5),
    };

    let mut segments = Vec::with_capacity(record.len().saturating_sub(seg_start));
    for field in record.iter().skip(seg_start) {
        let v: u32 = field
            .parse()
            .map_err(|_| format!("non-integer segment value '{field}'"))?;
        segments.push(v);
    }

    Ok((
        VideoMeta { id, title, duration_secs, segment_length_secs, encoding_tag },
        segments,
    ))
}

fn read_string<R: Read>(r: &mut R) -> Option<String> {
    let len = r.read_u32::<LittleEndian>().ok()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).ok()?;
    String::from_utf8(buf).ok()
}

fn write_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
    w.write_u32::<LittleEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_csv(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn loads_standard_rows_in_order() {
        let f = write_csv(&[
            "v1,Title One,1200,4.0,h264,1000,2000,3000",
            "v2,Title Two,600,4.0,h264,500,600",
        ]);
        let store = FingerprintStore::load(f.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.video(0).unwrap().id, "v1");
        assert_eq!(store.fingerprint(0).unwrap(), &[1000, 2000, 3000]);
        assert_eq!(store.video(1).unwrap().title, "Title Two");
        assert!(store.ids().contains("v1"));
        assert!(store.ids().contains("v2"));
    }

    #[test]
    fn multiple_rows_same_id_become_separate_video_idx() {
        let f = write_csv(&[
            "v1,Title,1200,4.0,enc_a,1,2,3",
            "v1,Title,1200,4.0,enc_b,9,9,9",
        ]);
        let store = FingerprintStore::load(f.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.ids().len(), 1);
        assert_eq!(store.fingerprint(0).unwrap(), &[1, 2, 3]);
        assert_eq!(store.fingerprint(1).unwrap(), &[9, 9, 9]);
    }

    #[test]
    fn variant_layout_without_encoding_tag_is_sniffed() {
        // Column 4 parses as an integer segment size, not a tag.
        let f = write_csv(&["v1,Title,1200,4.0,1000,2000,3000"]);
        let store = FingerprintStore::load(f.path()).unwrap();
        assert_eq!(store.fingerprint(0).unwrap(), &[1000, 2000, 3000]);
    }

    #[test]
    fn malformed_row_is_skipped_not_fatal() {
        let f = write_csv(&[
            "v1,Title,1200,4.0,h264,1000,2000",
            "v2,Title2,notanumber,4.0,h264,1000",
            "v3,Title3,600,4.0,h264,500",
        ]);
        let store = FingerprintStore::load(f.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.video(0).unwrap().id, "v1");
        assert_eq!(store.video(1).unwrap().id, "v3");
    }

    #[test]
    fn empty_source_is_fatal() {
        let f = write_csv(&[]);
        assert!(FingerprintStore::load(f.path()).is_err());
    }

    #[test]
    fn cache_round_trips() {
        let f = write_csv(&["v1,Title,1200,4.0,h264,1000,2000,3000"]);
        let cache = tempfile::NamedTempFile::new().unwrap();
        let store1 = FingerprintStore::load_or_build(f.path(), cache.path()).unwrap();
        let store2 = FingerprintStore::load_or_build(f.path(), cache.path()).unwrap();
        assert_eq!(store1.len(), store2.len());
        assert_eq!(store1.fingerprint(0), store2.fingerprint(0));
        assert_eq!(store1.video(0), store2.video(0));
    }
}
