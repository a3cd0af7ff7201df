//! On-disk layout and integrity checking.
//!
//! Layout inside the store directory:
//! ```text
//! store.meta.json            - metadata and schema versions
//! snapshots/
//!   000001.state.cbor.zst    - CBOR+zstd compressed full state
//! journal/
//!   000001.journal.cbor.zst  - CBOR+zstd compressed mutation segments
//! integrity/
//!   manifest.json            - hash chain manifest
//! ```

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use worldgrid_kernel::PersistenceState;

use crate::journal::{self, Mutation};

const STATE_SCHEMA_VERSION: u32 = 1;
const JOURNAL_SCHEMA_VERSION: u32 = 1;

/// Errors from file-backed persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("{0} is not listed in the integrity manifest")]
    Unlisted(String),
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("journal replay failed: {0}")]
    Replay(#[from] worldgrid_kernel::PersistenceError),
}

/// Metadata stored in store.meta.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub state_schema_version: u32,
    pub journal_schema_version: u32,
    pub snapshot_count: u32,
    pub journal_segment_count: u32,
    /// Journal segments up to this index are folded into the latest snapshot.
    pub snapshot_covers_segment: u32,
}

/// A single entry in the integrity manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    pub sha256: String,
    pub prev_hash: Option<String>,
}

/// Hash chain over every segment ever written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub entries: Vec<ManifestEntry>,
}

/// Directory of snapshots and journal segments for one realm's map storage.
#[derive(Debug)]
pub struct StateStore {
    root: PathBuf,
    meta: StoreMeta,
    manifest: IntegrityManifest,
}

impl StateStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("snapshots"))?;
        std::fs::create_dir_all(root.join("journal"))?;
        std::fs::create_dir_all(root.join("integrity"))?;

        let meta_path = root.join("store.meta.json");
        let manifest_path = root.join("integrity").join("manifest.json");

        let (meta, manifest) = if meta_path.exists() {
            let meta: StoreMeta = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;
            if meta.state_schema_version != STATE_SCHEMA_VERSION {
                return Err(StoreError::SchemaMismatch {
                    file_version: meta.state_schema_version,
                    expected_version: STATE_SCHEMA_VERSION,
                });
            }
            if meta.journal_schema_version != JOURNAL_SCHEMA_VERSION {
                return Err(StoreError::SchemaMismatch {
                    file_version: meta.journal_schema_version,
                    expected_version: JOURNAL_SCHEMA_VERSION,
                });
            }
            let manifest: IntegrityManifest = if manifest_path.exists() {
                serde_json::from_reader(std::fs::File::open(&manifest_path)?)?
            } else {
                IntegrityManifest::default()
            };
            (meta, manifest)
        } else {
            let meta = StoreMeta {
                state_schema_version: STATE_SCHEMA_VERSION,
                journal_schema_version: JOURNAL_SCHEMA_VERSION,
                snapshot_count: 0,
                journal_segment_count: 0,
                snapshot_covers_segment: 0,
            };
            let manifest = IntegrityManifest::default();
            serde_json::to_writer_pretty(std::fs::File::create(&meta_path)?, &meta)?;
            serde_json::to_writer_pretty(std::fs::File::create(&manifest_path)?, &manifest)?;
            (meta, manifest)
        };

        tracing::debug!(
            root = %root.display(),
            snapshots = meta.snapshot_count,
            segments = meta.journal_segment_count,
            "opened state store"
        );
        Ok(Self { root, meta, manifest })
    }

    /// Rebuild the state from the latest snapshot and the journal after it.
    /// An empty store yields the default state.
    pub fn load_latest(&self) -> Result<PersistenceState, StoreError> {
        let mut state = if self.meta.snapshot_count == 0 {
            PersistenceState::default()
        } else {
            self.load_snapshot(self.meta.snapshot_count)?
        };
        for index in self.meta.snapshot_covers_segment + 1..=self.meta.journal_segment_count {
            let mutations = self.load_segment(index)?;
            journal::replay(&mut state, &mutations)?;
        }
        Ok(state)
    }

    /// Append mutations as a new journal segment.
    pub fn append_journal(&mut self, mutations: &[Mutation]) -> Result<(), StoreError> {
        if mutations.is_empty() {
            return Ok(());
        }
        self.meta.journal_segment_count += 1;
        let filename = format!("{:06}.journal.cbor.zst", self.meta.journal_segment_count);
        self.write_segment("journal", filename, mutations)
    }

    /// Write the full state; later loads skip every journal segment so far.
    pub fn take_snapshot(&mut self, state: &PersistenceState) -> Result<(), StoreError> {
        self.meta.snapshot_count += 1;
        self.meta.snapshot_covers_segment = self.meta.journal_segment_count;
        let filename = format!("{:06}.state.cbor.zst", self.meta.snapshot_count);
        self.write_segment("snapshots", filename, state)
    }

    /// Verify every hash in the manifest and the chain linking them.
    pub fn verify_integrity(&self) -> Result<(), StoreError> {
        let mut prev_hash: Option<String> = None;
        for entry in &self.manifest.entries {
            if entry.prev_hash != prev_hash {
                return Err(StoreError::IntegrityMismatch {
                    expected: prev_hash.unwrap_or_else(|| "None".into()),
                    actual: entry.prev_hash.clone().unwrap_or_else(|| "None".into()),
                });
            }
            let data = std::fs::read(self.segment_path(&entry.filename))?;
            let actual = sha256_hex(&data);
            if actual != entry.sha256 {
                return Err(StoreError::IntegrityMismatch {
                    expected: entry.sha256.clone(),
                    actual,
                });
            }
            prev_hash = Some(entry.sha256.clone());
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    /// Journal segments written since the latest snapshot.
    pub fn segments_since_snapshot(&self) -> u32 {
        self.meta.journal_segment_count - self.meta.snapshot_covers_segment
    }

    fn write_segment<T: Serialize + ?Sized>(
        &mut self,
        dir: &str,
        filename: String,
        value: &T,
    ) -> Result<(), StoreError> {
        let compressed = zstd_compress(&cbor_serialize(value)?)?;
        let hash = sha256_hex(&compressed);
        let prev_hash = self.manifest.entries.last().map(|e| e.sha256.clone());

        std::fs::write(self.root.join(dir).join(&filename), &compressed)?;
        tracing::trace!(%filename, bytes = compressed.len(), "segment written");

        self.manifest.entries.push(ManifestEntry {
            filename,
            sha256: hash,
            prev_hash,
        });
        self.save_manifest()?;
        self.save_meta()
    }

    fn load_snapshot(&self, index: u32) -> Result<PersistenceState, StoreError> {
        let filename = format!("{:06}.state.cbor.zst", index);
        let compressed = std::fs::read(self.root.join("snapshots").join(&filename))?;
        self.verify_file_hash(&filename, &compressed)?;
        cbor_deserialize(&zstd_decompress(&compressed)?)
    }

    fn load_segment(&self, index: u32) -> Result<Vec<Mutation>, StoreError> {
        let filename = format!("{:06}.journal.cbor.zst", index);
        let compressed = std::fs::read(self.root.join("journal").join(&filename))?;
        self.verify_file_hash(&filename, &compressed)?;
        cbor_deserialize(&zstd_decompress(&compressed)?)
    }

    fn segment_path(&self, filename: &str) -> PathBuf {
        if filename.contains(".state.") {
            self.root.join("snapshots").join(filename)
        } else {
            self.root.join("journal").join(filename)
        }
    }

    fn verify_file_hash(&self, filename: &str, data: &[u8]) -> Result<(), StoreError> {
        let entry = self
            .manifest
            .entries
            .iter()
            .find(|e| e.filename == filename)
            .ok_or_else(|| StoreError::Unlisted(filename.to_string()))?;
        let actual = sha256_hex(data);
        if entry.sha256 != actual {
            return Err(StoreError::IntegrityMismatch {
                expected: entry.sha256.clone(),
                actual,
            });
        }
        Ok(())
    }

    fn save_meta(&self) -> Result<(), StoreError> {
        let path = self.root.join("store.meta.json");
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.meta)?;
        Ok(())
    }

    fn save_manifest(&self) -> Result<(), StoreError> {
        let path = self.root.join("integrity").join("manifest.json");
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.manifest)?;
        Ok(())
    }
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(data).map_err(|e| StoreError::CborDecode(e.to_string()))
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), 3)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
