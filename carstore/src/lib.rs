//! Indexed carfile archives.
//!
//! - [`archive`]: durable archive files with an embedded block index
//! - [`index`]: the bucketed block index built from that embedded index
//! - [`cache`]: bounded LRU of open archives, built on first access
//! - [`sampling`]: seed-deterministic block and asset selection shared by a
//!   challenged node and its referee

pub mod archive;
pub mod cache;
pub mod error;
pub mod index;
pub mod sampling;

pub use archive::{ArchiveDir, ArchiveReader, ArchiveSummary, ArchiveWriter};
pub use cache::{CachedArchive, DEFAULT_CACHE_CAPACITY, IndexedArchiveCache, RandomCheck};
pub use error::{Result, StoreError};
pub use index::{BucketedIndex, IndexRecord};
pub use sampling::{sample_block, sample_blocks, select_asset};
