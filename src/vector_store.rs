use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

use redb::{
    Database,
    DatabaseError,
    ReadOnlyDatabase,
    ReadableDatabase,
    ReadableTable,
    StorageError,
    TableDefinition,
    TableError,
};
use tracing::debug;

use crate::{
    error::{Error, Result},
    vector::FeatureVector,
};

const VECTORS: TableDefinition<&str, &[u8]> = TableDefinition::new("vectors");

/// Size of each length prefix in an encoded entry.
const LEN_SIZE: usize = 4;

/// How to treat an existing snapshot when opening a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Discard any existing snapshot and start empty.
    Fresh,
    /// Read the existing snapshot; a missing file yields an empty store.
    #[default]
    Resume,
}

/// A cached embedding for one file. The file name, its identifier, is
/// the key it is stored under in [`VectorStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub vector: FeatureVector,
    /// Tag of the encoder that produced `vector`.
    pub space_version: String,
}

/// File name to embedding cache, held in memory and snapshotted to redb.
///
/// Binary format per entry value:
/// - 4 bytes: space version length V (u32 LE)
/// - V bytes: space version, UTF-8
/// - 4 bytes: dimension D (u32 LE)
/// - D * 4 bytes: f32 values in native byte order
pub struct VectorStore {
    path: PathBuf,
    /// Opened for writing on the first flush.
    db: Option<Database>,
    entries: HashMap<String, CacheEntry>,
    dirty: usize,
}

impl VectorStore {
    /// Open the snapshot at `path`.
    ///
    /// In [`LoadMode::Resume`] a snapshot that exists but cannot be read
    /// fails with [`Error::StoreCorrupt`]; the caller decides whether to
    /// abort or retry with [`LoadMode::Fresh`].
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use clipseek::{LoadMode, VectorStore};
    ///
    /// let store =
    ///     VectorStore::load(&tmp.path().join("features.redb"), LoadMode::Resume)
    ///         .unwrap();
    /// assert!(store.is_empty());
    /// ```
    pub fn load(path: &Path, mode: LoadMode) -> Result<Self> {
        match mode {
            LoadMode::Fresh => {
                match std::fs::remove_file(path) {
                    Ok(()) => debug!(path = %path.display(), "discarded snapshot"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(Self::empty(path, None))
            }
            LoadMode::Resume if !path.exists() => {
                debug!(path = %path.display(), "no snapshot found, starting empty");
                Ok(Self::empty(path, None))
            }
            LoadMode::Resume => Self::open_existing(path),
        }
    }

    /// The database file is only created or opened for writing on the
    /// first flush.
    fn empty(path: &Path, db: Option<Database>) -> Self {
        Self {
            path: path.to_path_buf(),
            db,
            entries: HashMap::new(),
            dirty: 0,
        }
    }

    fn open_existing(path: &Path) -> Result<Self> {
        let (entries, db) = match ReadOnlyDatabase::open(path) {
            Ok(db) => (read_entries(path, &db)?, None),
            // Not shut down cleanly: only a writable open can repair it.
            Err(DatabaseError::RepairAborted) => {
                debug!(path = %path.display(), "repairing snapshot");
                let db = Database::open(path).map_err(|e| open_error(path, e))?;
                (read_entries(path, &db)?, Some(db))
            }
            Err(e) => return Err(open_error(path, e)),
        };
        debug!(path = %path.display(), entries = entries.len(), "loaded snapshot");

        let mut store = Self::empty(path, db);
        store.entries = entries;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of upserts since the last successful flush.
    pub fn dirty(&self) -> usize {
        self.dirty
    }

    pub fn get(&self, identifier: &str) -> Option<&CacheEntry> {
        self.entries.get(identifier)
    }

    /// Like [`get`](Self::get), but only returns an entry produced by
    /// `space_version`.
    pub fn get_current(
        &self,
        identifier: &str,
        space_version: &str,
    ) -> Option<&CacheEntry> {
        self.get(identifier)
            .filter(|entry| entry.space_version == space_version)
    }

    pub fn upsert(
        &mut self,
        identifier: &str,
        vector: FeatureVector,
        space_version: &str,
    ) {
        self.entries.insert(
            identifier.to_string(),
            CacheEntry {
                vector,
                space_version: space_version.to_string(),
            },
        );
        self.dirty += 1;
    }

    /// Flush when the dirty counter sits on a multiple of `threshold`.
    ///
    /// After a failed flush the counter keeps growing, so the next attempt
    /// happens at the following multiple. Returns whether a flush ran.
    pub fn maybe_flush(&mut self, threshold: usize) -> Result<bool> {
        if threshold == 0 || self.dirty == 0 || self.dirty % threshold != 0 {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    /// Write every entry to the snapshot in a single transaction.
    pub fn flush(&mut self) -> Result<()> {
        self.write_all().map_err(|source| Error::Flush {
            path: self.path.clone(),
            source: Box::new(source),
        })?;
        debug!(
            path = %self.path.display(),
            entries = self.entries.len(),
            "flushed vector store"
        );
        self.dirty = 0;
        Ok(())
    }

    fn write_all(&mut self) -> Result<()> {
        let db = match self.db.take() {
            Some(db) => db,
            None => Database::create(&self.path)?,
        };
        let txn = self.db.insert(db).begin_write()?;
        {
            let mut table = txn.open_table(VECTORS)?;
            for (identifier, entry) in &self.entries {
                let mut guard = table
                    .insert_reserve(identifier.as_str(), encoded_len(entry))?;
                encode_into(entry, guard.as_mut());
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Iterate over all entries in arbitrary order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &CacheEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries per space version.
    pub fn version_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.space_version.clone()).or_insert(0) += 1;
        }
        counts
    }
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

/// Sort open failures into corruption and everything else.
///
/// Only a file that is not a redb database, is truncated, or uses an
/// unknown format version counts as corrupt. Permission and other I/O
/// errors pass through untouched.
fn open_error(path: &Path, e: DatabaseError) -> Error {
    let corrupt = |reason: String| Error::StoreCorrupt {
        path: path.to_path_buf(),
        reason,
    };
    match e {
        DatabaseError::Storage(StorageError::Corrupted(reason)) => corrupt(reason),
        DatabaseError::Storage(StorageError::Io(io))
            if matches!(
                io.kind(),
                std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof
            ) =>
        {
            corrupt(format!("not a feature cache: {io}"))
        }
        DatabaseError::UpgradeRequired(version) => {
            corrupt(format!("unsupported file format version {version}"))
        }
        other => other.into(),
    }
}

fn read_entries(
    path: &Path,
    db: &impl ReadableDatabase,
) -> Result<HashMap<String, CacheEntry>> {
    let corrupt = |reason: String| Error::StoreCorrupt {
        path: path.to_path_buf(),
        reason,
    };

    let txn = db.begin_read()?;
    let table = match txn.open_table(VECTORS) {
        Ok(table) => table,
        // Created but never flushed.
        Err(TableError::TableDoesNotExist(_)) => return Ok(HashMap::new()),
        Err(e @ TableError::Storage(_)) => return Err(e.into()),
        Err(e) => return Err(corrupt(e.to_string())),
    };

    let mut entries = HashMap::new();
    for row in table.iter()? {
        let (key, value) = row?;
        let identifier = key.value().to_string();
        let entry = decode(value.value()).ok_or_else(|| {
            corrupt(format!("malformed entry for '{identifier}'"))
        })?;
        entries.insert(identifier, entry);
    }
    Ok(entries)
}

fn encoded_len(entry: &CacheEntry) -> usize {
    LEN_SIZE
        + entry.space_version.len()
        + LEN_SIZE
        + std::mem::size_of_val(entry.vector.as_slice())
}

fn encode_into(entry: &CacheEntry, dest: &mut [u8]) {
    let version = entry.space_version.as_bytes();
    let values = entry.vector.as_slice();
    let dim_at = LEN_SIZE + version.len();
    let data_at = dim_at + LEN_SIZE;

    dest[..LEN_SIZE].copy_from_slice(&(version.len() as u32).to_le_bytes());
    dest[LEN_SIZE..dim_at].copy_from_slice(version);
    dest[dim_at..data_at].copy_from_slice(&(values.len() as u32).to_le_bytes());
    dest[data_at..].copy_from_slice(bytemuck::cast_slice(values));
}

fn decode(bytes: &[u8]) -> Option<CacheEntry> {
    let (version_len, rest) = split_len(bytes)?;
    if rest.len() < version_len {
        return None;
    }
    let (version, rest) = rest.split_at(version_len);
    let space_version = std::str::from_utf8(version).ok()?.to_string();

    let (dimension, data) = split_len(rest)?;
    if data.len() != dimension * 4 {
        return None;
    }
    let values: Vec<f32> = data
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned::<f32>)
        .collect();

    Some(CacheEntry {
        vector: FeatureVector::from_unit(values)?,
        space_version,
    })
}

fn split_len(bytes: &[u8]) -> Option<(usize, &[u8])> {
    if bytes.len() < LEN_SIZE {
        return None;
    }
    let (len, rest) = bytes.split_at(LEN_SIZE);
    let len = u32::from_le_bytes(len.try_into().ok()?) as usize;
    Some((len, rest))
}
