//! Durable archive files.
//!
//! An archive is a sequence of raw blocks followed by an embedded index:
//!
//! ```text
//! MAGIC (8 bytes "CARIDX01")
//! block*: [cid_len u16 LE][cid bytes][data_len u32 LE][data]
//! index:  bincode Vec<StoredRecord { cid, offset, len }>
//! footer: [index_offset u64 LE][index_len u64 LE][blake3(index) 32 bytes]
//! ```
//!
//! The first block written is the archive root. Archives live in an
//! [`ArchiveDir`] as `<content_hash>.car`, so a CIDv0 and CIDv1 root resolve
//! to the same file.

use crate::error::{Result, StoreError};
use crate::index::IndexRecord;
use cid::Cid;
use common::{cid_from_bytes, cid_of_block, content_hash};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const MAGIC: &[u8; 8] = b"CARIDX01";
const FOOTER_LEN: u64 = 8 + 8 + 32;
const ARCHIVE_EXT: &str = "car";

/// On-disk form of an index record.
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    cid: Vec<u8>,
    offset: u64,
    len: u32,
}

/// What a finished archive contains.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub root: Cid,
    pub total_blocks: u64,
    pub total_size: u64,
}

/// Appends blocks to a new archive file.
pub struct ArchiveWriter {
    out: BufWriter<File>,
    position: u64,
    records: Vec<StoredRecord>,
    root: Option<Cid>,
    total_size: u64,
}

impl ArchiveWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(MAGIC)?;
        Ok(Self {
            out,
            position: MAGIC.len() as u64,
            records: Vec::new(),
            root: None,
            total_size: 0,
        })
    }

    /// Append a raw block and return its CID.
    pub fn append_block(&mut self, data: &[u8]) -> Result<Cid> {
        let cid = cid_of_block(data)?;
        let cid_bytes = cid.to_bytes();
        let data_len = u32::try_from(data.len()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "block larger than 4 GiB")
        })?;

        self.out.write_all(&(cid_bytes.len() as u16).to_le_bytes())?;
        self.out.write_all(&cid_bytes)?;
        self.out.write_all(&data_len.to_le_bytes())?;
        let data_offset = self.position + 2 + cid_bytes.len() as u64 + 4;
        self.out.write_all(data)?;

        self.position = data_offset + data.len() as u64;
        self.total_size += data.len() as u64;
        self.records.push(StoredRecord {
            cid: cid_bytes,
            offset: data_offset,
            len: data_len,
        });
        self.root.get_or_insert(cid);
        Ok(cid)
    }

    /// Write the embedded index and footer.
    pub fn finish(mut self) -> Result<ArchiveSummary> {
        let root = self
            .root
            .ok_or_else(|| StoreError::EmptyArchive("<unwritten>".to_string()))?;
        let index = bincode::serialize(&self.records)?;
        let checksum = blake3::hash(&index);

        self.out.write_all(&index)?;
        self.out.write_all(&self.position.to_le_bytes())?;
        self.out.write_all(&(index.len() as u64).to_le_bytes())?;
        self.out.write_all(checksum.as_bytes())?;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;

        Ok(ArchiveSummary {
            root,
            total_blocks: self.records.len() as u64,
            total_size: self.total_size,
        })
    }
}

/// Read access to one archive file. Owns the open handle.
pub struct ArchiveReader {
    name: String,
    file: Mutex<File>,
    records: Vec<IndexRecord>,
}

impl ArchiveReader {
    /// Open an archive and parse its embedded index. `name` is used in errors.
    pub fn open(path: &Path, name: &str) -> Result<Self> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ArchiveNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let corrupt = |reason: &str| StoreError::IndexCorrupt {
            archive: name.to_string(),
            reason: reason.to_string(),
        };

        let file_len = file.metadata()?.len();
        if file_len < MAGIC.len() as u64 + FOOTER_LEN {
            return Err(corrupt("file too small"));
        }

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(corrupt("bad magic"));
        }

        let mut footer = [0u8; FOOTER_LEN as usize];
        file.seek(SeekFrom::Start(file_len - FOOTER_LEN))?;
        file.read_exact(&mut footer)?;
        let index_offset = u64::from_le_bytes(footer[0..8].try_into().unwrap_or_default());
        let index_len = u64::from_le_bytes(footer[8..16].try_into().unwrap_or_default());
        let stored_checksum = &footer[16..48];

        let index_end = index_offset
            .checked_add(index_len)
            .ok_or_else(|| corrupt("index bounds overflow"))?;
        if index_offset < MAGIC.len() as u64 || index_end != file_len - FOOTER_LEN {
            return Err(corrupt("index bounds outside file"));
        }

        let mut index = vec![0u8; index_len as usize];
        file.seek(SeekFrom::Start(index_offset))?;
        file.read_exact(&mut index)?;
        if blake3::hash(&index).as_bytes() != stored_checksum {
            return Err(corrupt("index checksum mismatch"));
        }

        let stored: Vec<StoredRecord> =
            bincode::deserialize(&index).map_err(|e| corrupt(&e.to_string()))?;
        let mut records = Vec::with_capacity(stored.len());
        for rec in stored {
            let block_end = rec
                .offset
                .checked_add(rec.len as u64)
                .ok_or_else(|| corrupt("block bounds overflow"))?;
            if block_end > index_offset {
                return Err(corrupt("block extends into index"));
            }
            let cid = cid_from_bytes(&rec.cid).map_err(|e| corrupt(&e.to_string()))?;
            records.push(IndexRecord {
                cid,
                offset: rec.offset,
                len: rec.len,
            });
        }

        debug!(archive = %name, blocks = records.len(), "Opened archive");
        Ok(Self {
            name: name.to_string(),
            file: Mutex::new(file),
            records,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flat index in write order. The first record is the root.
    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    pub fn root(&self) -> Option<&Cid> {
        self.records.first().map(|r| &r.cid)
    }

    /// Read the bytes of one indexed block.
    pub fn read_block(&self, record: &IndexRecord) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; record.len as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(record.offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Directory of archive files keyed by root content hash.
#[derive(Clone, Debug)]
pub struct ArchiveDir {
    path: PathBuf,
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl ArchiveDir {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_for(&self, hash: &str) -> PathBuf {
        self.path.join(format!("{hash}.{ARCHIVE_EXT}"))
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.path_for(hash).is_file()
    }

    /// Write a complete archive and move it into place under its root hash.
    pub fn write_archive<I, B>(&self, blocks: I) -> Result<ArchiveSummary>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let tmp = self.path.join(format!(
            ".incoming-{}-{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let result = (|| {
            let mut writer = ArchiveWriter::create(&tmp)?;
            for block in blocks {
                writer.append_block(block.as_ref())?;
            }
            writer.finish()
        })();

        let summary = match result {
            Ok(s) => s,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };
        let hash = content_hash(&summary.root);
        fs::rename(&tmp, self.path_for(&hash))?;
        info!(
            archive = %hash,
            blocks = summary.total_blocks,
            size = summary.total_size,
            "Stored archive"
        );
        Ok(summary)
    }

    pub fn open_reader(&self, hash: &str) -> Result<ArchiveReader> {
        ArchiveReader::open(&self.path_for(hash), hash)
    }

    /// Delete an archive file. Missing files are not an error.
    pub fn remove(&self, hash: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(hash)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Content hashes of every stored archive, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut hashes = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARCHIVE_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                hashes.push(stem.to_string());
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    /// Stored archives grouped by asset bucket. Members are sorted content
    /// hashes; the same bucketing the scheduler's asset summary uses.
    pub fn asset_buckets(&self, bucket_count: u32) -> Result<BTreeMap<u32, Vec<String>>> {
        let mut buckets: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for hash in self.list()? {
            let Ok(bytes) = common::hash_bytes(&hash) else {
                debug!(file = %hash, "Skipping archive with non-hex name");
                continue;
            };
            buckets
                .entry(common::bucket_of(&bytes, bucket_count))
                .or_default()
                .push(hash);
        }
        // list() is sorted, so every member list already is
        Ok(buckets)
    }

    /// Hex top hash over the asset buckets held in this directory, in the
    /// form the scheduler keeps per node. `None` when no archive is held.
    pub fn asset_top_hash(&self, bucket_count: u32) -> Result<Option<String>> {
        let buckets = self.asset_buckets(bucket_count)?;
        if buckets.is_empty() {
            return Ok(None);
        }
        let mut bucket_hashes = Vec::with_capacity(buckets.len());
        for members in buckets.values() {
            let mut bytes = Vec::with_capacity(members.len());
            for hash in members {
                bytes.push(common::hash_bytes(hash)?);
            }
            bucket_hashes.push(common::asset_bucket_hash(bytes.iter().map(Vec::as_slice)));
        }
        Ok(Some(hex::encode(common::asset_top_hash(bucket_hashes.iter()))))
    }
}
