//! Content-addressed store of every accepted payload.
//!
//! Layout under the data directory:
//!
//! ```text
//! index.json            records, aliases and the insertion counter
//! images/<sha256>.<ext> payload bytes
//! thumbs/<sha256>.png   derived thumbnails
//! ```
//!
//! `index.json` is replaced atomically (staging file, fsync, rename), so a
//! reader never observes a half-written record.

use crate::error::IndexError;
use crate::types::{BlockRef, ExtractionMethod, ImageFormat, Origin, sha256_hex};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

pub const INDEX_FILE: &str = "index.json";
pub const IMAGES_DIR: &str = "images";
pub const THUMBS_DIR: &str = "thumbs";
const INDEX_VERSION: u32 = 1;
const UNKNOWN_EXTENSION: &str = "bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Validity {
    KeptInvalidForResearch,
    Repaired,
    OriginalValid,
}

impl Validity {
    pub fn name(&self) -> &'static str {
        match self {
            Validity::OriginalValid => "original-valid",
            Validity::Repaired => "repaired",
            Validity::KeptInvalidForResearch => "kept-invalid-for-research",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub method: ExtractionMethod,
    pub txid: String,
    pub block: BlockRef,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub hash: String,
    pub format: Option<ImageFormat>,
    pub size: usize,
    pub validity: Validity,
    pub provenance: Vec<Provenance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<PathBuf>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub seq: u64,
}

impl ImageRecord {
    pub fn methods(&self) -> impl Iterator<Item = ExtractionMethod> + '_ {
        self.provenance.iter().map(|p| p.method)
    }

    pub fn heights(&self) -> impl Iterator<Item = u64> + '_ {
        self.provenance.iter().filter_map(|p| p.block.height())
    }

    pub fn format_name(&self) -> &'static str {
        self.format.map_or("unknown", |f| f.name())
    }
}

/// One accepted payload on its way into the index.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub data: Vec<u8>,
    pub format: Option<ImageFormat>,
    pub validity: Validity,
    pub provenance: Vec<Provenance>,
    pub content_type: Option<String>,
    pub seen: DateTime<Utc>,
    /// Hash of the bytes as extracted, when repair changed them.
    pub original_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Upserted {
    pub record: ImageRecord,
    pub created: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    pub format: Option<ImageFormat>,
    pub method: Option<ExtractionMethod>,
    pub blocks: Option<RangeInclusive<u64>>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn format(mut self, format: ImageFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn method(mut self, method: ExtractionMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn blocks(mut self, range: RangeInclusive<u64>) -> Self {
        self.blocks = Some(range);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &ImageRecord) -> bool {
        if self.format.is_some() && record.format != self.format {
            return false;
        }
        if let Some(method) = self.method {
            if !record.methods().any(|m| m == method) {
                return false;
            }
        }
        if let Some(range) = &self.blocks {
            if !record.heights().any(|h| range.contains(&h)) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    next_seq: u64,
    records: BTreeMap<String, ImageRecord>,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

impl IndexFile {
    fn merge_provenance(record: &mut ImageRecord, incoming: Provenance) -> bool {
        if let Some(existing) = record
            .provenance
            .iter_mut()
            .find(|p| p.method == incoming.method && p.txid == incoming.txid)
        {
            if !existing.block.is_confirmed() && incoming.block.is_confirmed() {
                existing.block = incoming.block;
                return true;
            }
            return false;
        }
        record.provenance.push(incoming);
        true
    }

    fn apply(&mut self, image: NewImage, hash: String, path: PathBuf) -> Upserted {
        if let Some(original) = &image.original_hash {
            if *original != hash {
                self.aliases.insert(original.clone(), hash.clone());
            }
        }

        if let Some(record) = self.records.get_mut(&hash) {
            for p in image.provenance {
                Self::merge_provenance(record, p);
            }
            if image.validity > record.validity {
                record.validity = image.validity;
            }
            if record.content_type.is_none() {
                record.content_type = image.content_type;
            }
            if image.seen > record.last_seen {
                record.last_seen = image.seen;
            }
            return Upserted {
                record: record.clone(),
                created: false,
            };
        }

        let mut record = ImageRecord {
            hash: hash.clone(),
            format: image.format,
            size: image.data.len(),
            validity: image.validity,
            provenance: Vec::new(),
            content_type: image.content_type,
            path,
            thumbnail: None,
            first_seen: image.seen,
            last_seen: image.seen,
            seq: self.next_seq,
        };
        for p in image.provenance {
            Self::merge_provenance(&mut record, p);
        }
        self.next_seq += 1;
        self.records.insert(hash, record.clone());
        Upserted {
            record,
            created: true,
        }
    }
}

pub struct ImageIndex {
    root: PathBuf,
    state: Mutex<IndexFile>,
}

impl ImageIndex {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let root = root.into();
        for dir in [root.clone(), root.join(IMAGES_DIR), root.join(THUMBS_DIR)] {
            fs::create_dir_all(&dir).map_err(|e| IndexError::io(&dir, e))?;
        }

        let path = root.join(INDEX_FILE);
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| IndexError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => IndexFile {
                version: INDEX_VERSION,
                ..IndexFile::default()
            },
            Err(e) => return Err(IndexError::io(&path, e)),
        };

        info!(root = %root.display(), records = state.records.len(), "opened image index");
        Ok(Self {
            root,
            state: Mutex::new(state),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn thumbs_dir(&self) -> PathBuf {
        self.root.join(THUMBS_DIR)
    }

    pub fn upsert(&self, image: NewImage) -> Result<Upserted, IndexError> {
        let mut out = self.upsert_all(vec![image])?;
        out.pop()
            .ok_or_else(|| IndexError::UnknownImage("empty upsert".to_string()))
    }

    /// Commits a batch with a single publish of the index file. Payload files
    /// are written first, so a published record always has its bytes on disk.
    pub fn upsert_all(&self, images: Vec<NewImage>) -> Result<Vec<Upserted>, IndexError> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let mut prepared = Vec::with_capacity(images.len());
        for image in images {
            let hash = sha256_hex(&image.data);
            let ext = image.format.map_or(UNKNOWN_EXTENSION, |f| f.extension());
            let relative = Path::new(IMAGES_DIR).join(format!("{hash}.{ext}"));
            self.write_payload(&relative, &image.data)?;
            prepared.push((image, hash, relative));
        }

        let mut state = self.state.lock();
        let mut next = state.clone();
        let results: Vec<Upserted> = prepared
            .into_iter()
            .map(|(image, hash, path)| next.apply(image, hash, path))
            .collect();
        self.publish(&next)?;
        *state = next;

        debug!(count = results.len(), "index batch committed");
        Ok(results)
    }

    /// Adds provenance to an image already in the index, following aliases.
    pub fn attach(
        &self,
        hash: &str,
        provenance: Vec<Provenance>,
        seen: DateTime<Utc>,
    ) -> Result<ImageRecord, IndexError> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let target = next.aliases.get(hash).cloned().unwrap_or_else(|| hash.to_string());
        let record = next
            .records
            .get_mut(&target)
            .ok_or_else(|| IndexError::UnknownImage(hash.to_string()))?;

        let mut changed = false;
        for p in provenance {
            changed |= IndexFile::merge_provenance(record, p);
        }
        if seen > record.last_seen {
            record.last_seen = seen;
            changed = true;
        }
        let snapshot = record.clone();
        if changed {
            self.publish(&next)?;
            *state = next;
        }
        Ok(snapshot)
    }

    pub fn set_thumbnail(&self, hash: &str, thumbnail: PathBuf) -> Result<(), IndexError> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let record = next
            .records
            .get_mut(hash)
            .ok_or_else(|| IndexError::UnknownImage(hash.to_string()))?;
        record.thumbnail = Some(thumbnail);
        self.publish(&next)?;
        *state = next;
        Ok(())
    }

    pub fn contains(&self, hash: &str) -> bool {
        let state = self.state.lock();
        state.records.contains_key(hash) || state.aliases.contains_key(hash)
    }

    /// Hash of the record that holds these bytes, directly or as the repaired
    /// form of them.
    pub fn resolve(&self, hash: &str) -> Option<String> {
        let state = self.state.lock();
        if state.records.contains_key(hash) {
            return Some(hash.to_string());
        }
        state.aliases.get(hash).cloned()
    }

    pub fn get(&self, hash: &str) -> Option<ImageRecord> {
        self.state.lock().records.get(hash).cloned()
    }

    pub fn query(&self, query: &Query) -> Vec<ImageRecord> {
        let state = self.state.lock();
        let mut hits: Vec<ImageRecord> = state
            .records
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        drop(state);

        hits.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then(a.seq.cmp(&b.seq)));
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        hits
    }

    pub fn by_txid(&self, txid: &str) -> Vec<ImageRecord> {
        let state = self.state.lock();
        let mut hits: Vec<ImageRecord> = state
            .records
            .values()
            .filter(|r| r.provenance.iter().any(|p| p.txid == txid))
            .cloned()
            .collect();
        hits.sort_by_key(|r| r.seq);
        hits
    }

    pub fn records(&self) -> Vec<ImageRecord> {
        self.query(&Query::default())
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload_path(&self, record: &ImageRecord) -> PathBuf {
        self.root.join(&record.path)
    }

    pub fn read_payload(&self, record: &ImageRecord) -> Result<Vec<u8>, IndexError> {
        let path = self.payload_path(record);
        fs::read(&path).map_err(|e| IndexError::io(path, e))
    }

    fn write_payload(&self, relative: &Path, data: &[u8]) -> Result<(), IndexError> {
        let target = self.root.join(relative);
        if target.exists() {
            return Ok(());
        }
        write_atomic(&self.root.join(IMAGES_DIR), &target, data)
    }

    fn publish(&self, state: &IndexFile) -> Result<(), IndexError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.root, &self.root.join(INDEX_FILE), &bytes)
    }
}

/// Stages `bytes` next to `target`, syncs them, and renames into place.
pub(crate) fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), IndexError> {
    let mut staging = NamedTempFile::new_in(dir).map_err(|e| IndexError::io(dir, e))?;
    staging
        .write_all(bytes)
        .and_then(|_| staging.as_file().sync_all())
        .map_err(|e| IndexError::io(staging.path(), e))?;
    staging
        .persist(target)
        .map_err(|e| IndexError::io(target, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provenance(method: ExtractionMethod, txid: &str, block: BlockRef) -> Provenance {
        Provenance {
            method,
            txid: txid.to_string(),
            block,
            origin: Origin::Output { vout: 0, offset: 0 },
        }
    }

    fn image(data: &[u8], validity: Validity, p: Provenance) -> NewImage {
        NewImage {
            data: data.to_vec(),
            format: Some(ImageFormat::Png),
            validity,
            provenance: vec![p],
            content_type: None,
            seen: Utc::now(),
            original_hash: None,
        }
    }

    #[test]
    fn test_unconfirmed_provenance_upgrades_to_height() {
        let dir = tempfile::tempdir().unwrap();
        let index = ImageIndex::open(dir.path()).unwrap();
        let tx = "ab".repeat(32);

        let seen = provenance(ExtractionMethod::OpReturn, &tx, BlockRef::Unconfirmed);
        let mined = provenance(ExtractionMethod::OpReturn, &tx, BlockRef::Height(900_000));
        index.upsert(image(b"payload", Validity::OriginalValid, seen)).unwrap();
        let up = index
            .upsert(image(b"payload", Validity::OriginalValid, mined))
            .unwrap();

        assert!(!up.created);
        assert_eq!(up.record.provenance.len(), 1);
        assert_eq!(up.record.provenance[0].block, BlockRef::Height(900_000));
    }

    #[test]
    fn test_validity_only_upgrades() {
        let dir = tempfile::tempdir().unwrap();
        let index = ImageIndex::open(dir.path()).unwrap();
        let p = provenance(ExtractionMethod::CorruptedOutput, "t1", BlockRef::Height(1));

        index.upsert(image(b"x", Validity::Repaired, p.clone())).unwrap();
        let up = index
            .upsert(image(b"x", Validity::KeptInvalidForResearch, p.clone()))
            .unwrap();
        assert_eq!(up.record.validity, Validity::Repaired);
        let up = index.upsert(image(b"x", Validity::OriginalValid, p)).unwrap();
        assert_eq!(up.record.validity, Validity::OriginalValid);
    }

    #[test]
    fn test_alias_resolves_to_repaired_record() {
        let dir = tempfile::tempdir().unwrap();
        let index = ImageIndex::open(dir.path()).unwrap();
        let mut repaired = image(
            b"fixed",
            Validity::Repaired,
            provenance(ExtractionMethod::Inscription, "t", BlockRef::Height(5)),
        );
        let broken_hash = sha256_hex(b"broken");
        repaired.original_hash = Some(broken_hash.clone());
        index.upsert(repaired).unwrap();

        assert!(index.contains(&broken_hash));
        assert_eq!(index.resolve(&broken_hash), Some(sha256_hex(b"fixed")));

        let record = index
            .attach(
                &broken_hash,
                vec![provenance(ExtractionMethod::Inscription, "u", BlockRef::Height(6))],
                Utc::now(),
            )
            .unwrap();
        assert_eq!(record.provenance.len(), 2);
    }

    #[test]
    fn test_no_staging_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let index = ImageIndex::open(dir.path()).unwrap();
        let p = provenance(ExtractionMethod::OpReturn, "t", BlockRef::Height(1));
        index.upsert(image(b"abc", Validity::OriginalValid, p)).unwrap();

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![IMAGES_DIR, INDEX_FILE, THUMBS_DIR]);
    }
}
