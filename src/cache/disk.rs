use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::config::DiskCacheConfig;
use crate::core::Hash32;
use crate::error::DiskCacheError;
use crate::value::Value;

const EXT_DATA: &str = "bin";
const EXT_META: &str = "meta.cbor";
const EXT_PENDING: &str = "tmp";

/// Handle to a disk cache entry, valid for the lifetime of one [`DiskCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

/// Sidecar written next to every finished entry. The index is rebuilt from
/// these when the cache is opened.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    crc: u32,
    size: u64,
    stamp: u64,
}

#[derive(Debug)]
struct Record {
    key: String,
    crc: u32,
    size: u64,
    stamp: u64,
    pending: bool,
}

#[derive(Default)]
struct Index {
    by_key: HashMap<String, EntryId>,
    records: HashMap<EntryId, Record>,
    next_id: u64,
    clock: u64,
    total_size: u64,
}

impl Index {
    fn allocate(&mut self) -> EntryId {
        self.next_id += 1;
        EntryId(self.next_id)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn forget(&mut self, id: EntryId) -> Option<Record> {
        let record = self.records.remove(&id)?;
        if !record.pending {
            if self.by_key.get(&record.key) == Some(&id) {
                self.by_key.remove(&record.key);
            }
            self.total_size = self.total_size.saturating_sub(record.size);
        }
        Some(record)
    }
}

/// Content-addressed, CRC-checked persistent cache.
///
/// Each entry is a data file `<hash>.bin` plus a `<hash>.meta.cbor` sidecar,
/// where `<hash>` is the BLAKE3 hash of the entry's key. Inserts are written
/// to a pending file and renamed into place by
/// [`finish_insert`](DiskCache::finish_insert), so an entry is visible to
/// readers only once it is complete.
pub struct DiskCache {
    directory: Utf8PathBuf,
    size_limit: u64,
    index: Mutex<Index>,
}

impl DiskCache {
    /// Opens (creating if needed) the cache directory and rebuilds the index
    /// from the sidecars found there.
    pub fn open(config: &DiskCacheConfig) -> Result<Self, DiskCacheError> {
        fs::create_dir_all(&config.directory)?;

        let cache = Self {
            directory: config.directory.clone(),
            size_limit: config.size_limit,
            index: Mutex::new(Index::default()),
        };
        cache.scan()?;
        cache.evict(None);

        Ok(cache)
    }

    fn scan(&self) -> Result<(), DiskCacheError> {
        let mut found = Vec::new();

        for entry in self.directory.read_dir_utf8()? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = entry.file_name().strip_suffix(&format!(".{EXT_META}")) else {
                // leftovers of an interrupted insert
                if path.extension() == Some(EXT_PENDING) {
                    let _ = fs::remove_file(path);
                }
                continue;
            };

            let meta = match read_meta(path) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!("skipping unreadable cache sidecar {path}: {e}");
                    continue;
                }
            };

            let data = self.directory.join(format!("{stem}.{EXT_DATA}"));
            match fs::metadata(&data) {
                Ok(stat) if stat.len() == meta.size => found.push(meta),
                _ => {
                    tracing::warn!("dropping cache entry {stem} with missing or truncated data");
                    let _ = fs::remove_file(path);
                    let _ = fs::remove_file(&data);
                }
            }
        }

        found.sort_by_key(|meta| meta.stamp);

        let mut index = self.index.lock().unwrap();
        for meta in found {
            let id = index.allocate();
            index.clock = index.clock.max(meta.stamp);
            index.total_size += meta.size;
            index.by_key.insert(meta.key.clone(), id);
            index.records.insert(
                id,
                Record {
                    key: meta.key,
                    crc: meta.crc,
                    size: meta.size,
                    stamp: meta.stamp,
                    pending: false,
                },
            );
        }

        tracing::debug!(
            "opened disk cache {} with {} entries ({} bytes)",
            self.directory,
            index.records.len(),
            index.total_size
        );
        Ok(())
    }

    pub fn directory(&self) -> &Utf8Path {
        &self.directory
    }

    /// Looks up a finished entry, returning its handle and stored CRC.
    pub fn entry_exists(&self, key: &str) -> Option<(EntryId, u32)> {
        let index = self.index.lock().unwrap();
        let id = *index.by_key.get(key)?;
        let record = index.records.get(&id)?;
        Some((id, record.crc))
    }

    /// Starts writing a new entry for `key`. The entry stays invisible until
    /// [`finish_insert`](DiskCache::finish_insert) is called for it.
    pub fn initiate_insert(&self, key: &str) -> EntryId {
        let mut index = self.index.lock().unwrap();
        let id = index.allocate();
        index.records.insert(
            id,
            Record {
                key: key.to_string(),
                crc: 0,
                size: 0,
                stamp: 0,
                pending: true,
            },
        );
        id
    }

    /// Where the data of `id` lives. For a pending insert this is the file
    /// the caller should write.
    pub fn get_path_for_id(&self, id: EntryId) -> Result<Utf8PathBuf, DiskCacheError> {
        let index = self.index.lock().unwrap();
        let record = index
            .records
            .get(&id)
            .ok_or_else(|| DiskCacheError::UnknownEntry(format!("{id:?}")))?;

        Ok(if record.pending {
            self.pending_path(&record.key, id)
        } else {
            self.data_path(&record.key)
        })
    }

    /// Publishes a pending entry whose data has been written.
    pub fn finish_insert(&self, id: EntryId, crc: u32) -> Result<(), DiskCacheError> {
        // held until the new record is published: a reader must never pair
        // the new data file with the old record's CRC
        let mut index = self.index.lock().unwrap();
        let key = match index.records.get(&id) {
            Some(record) if record.pending => record.key.clone(),
            _ => return Err(DiskCacheError::UnknownEntry(format!("{id:?}"))),
        };

        let pending = self.pending_path(&key, id);
        let size = fs::metadata(&pending)?.len();

        // the previous entry's files are replaced in place
        if let Some(old) = index.by_key.get(&key).copied() {
            index.forget(old);
        }
        fs::rename(&pending, self.data_path(&key))?;

        let stamp = index.tick();
        write_meta(
            &self.meta_path(&key),
            &EntryMeta {
                key: key.clone(),
                crc,
                size,
                stamp,
            },
        )?;

        if let Some(record) = index.records.get_mut(&id) {
            record.crc = crc;
            record.size = size;
            record.stamp = stamp;
            record.pending = false;
        }
        index.by_key.insert(key, id);
        index.total_size += size;
        drop(index);

        self.evict(Some(id));
        Ok(())
    }

    /// Drops a pending insert and whatever was written for it.
    pub fn abort_insert(&self, id: EntryId) {
        let mut index = self.index.lock().unwrap();
        if let Some(record) = index.records.get(&id)
            && record.pending
        {
            let path = self.pending_path(&record.key, id);
            index.records.remove(&id);
            let _ = fs::remove_file(path);
        }
    }

    /// Marks an entry as recently used for eviction purposes.
    pub fn record_usage(&self, id: EntryId) {
        let mut index = self.index.lock().unwrap();
        let stamp = index.tick();
        if let Some(record) = index.records.get_mut(&id) {
            record.stamp = stamp;
        }
    }

    /// Deletes a finished entry.
    pub fn remove(&self, id: EntryId) -> Result<(), DiskCacheError> {
        let record = self
            .index
            .lock()
            .unwrap()
            .forget(id)
            .ok_or_else(|| DiskCacheError::UnknownEntry(format!("{id:?}")))?;

        if record.pending {
            remove_if_exists(&self.pending_path(&record.key, id))?;
        } else {
            remove_if_exists(&self.data_path(&record.key))?;
            remove_if_exists(&self.meta_path(&record.key))?;
        }
        Ok(())
    }

    /// Bytes held by finished entries.
    pub fn total_size(&self) -> u64 {
        self.index.lock().unwrap().total_size
    }

    /// Number of finished entries.
    pub fn len(&self) -> usize {
        self.index.lock().unwrap().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, keep: Option<EntryId>) {
        let mut victims = Vec::new();
        {
            let index = self.index.lock().unwrap();
            let mut total = index.total_size;
            if total <= self.size_limit {
                return;
            }

            let mut candidates: Vec<_> = index
                .records
                .iter()
                .filter(|(id, record)| !record.pending && Some(**id) != keep)
                .map(|(id, record)| (record.stamp, *id, record.size))
                .collect();
            candidates.sort();

            for (_, id, size) in candidates {
                if total <= self.size_limit {
                    break;
                }
                total = total.saturating_sub(size);
                victims.push(id);
            }
        }

        for id in victims {
            tracing::debug!("evicting disk cache entry {id:?}");
            if let Err(e) = self.remove(id) {
                tracing::warn!("couldn't evict disk cache entry {id:?}: {e}");
            }
        }
    }

    fn stem(key: &str) -> String {
        Hash32::hash(key.as_bytes()).to_hex()
    }

    fn data_path(&self, key: &str) -> Utf8PathBuf {
        self.directory
            .join(format!("{}.{EXT_DATA}", Self::stem(key)))
    }

    fn meta_path(&self, key: &str) -> Utf8PathBuf {
        self.directory
            .join(format!("{}.{EXT_META}", Self::stem(key)))
    }

    fn pending_path(&self, key: &str, id: EntryId) -> Utf8PathBuf {
        self.directory
            .join(format!("{}.{}.{EXT_PENDING}", Self::stem(key), id.0))
    }
}

fn read_meta(path: &Utf8Path) -> Result<EntryMeta, DiskCacheError> {
    let file = BufReader::new(File::open(path)?);
    ciborium::from_reader(file).map_err(|e| crate::error::CodecError::Decode(e.to_string()).into())
}

fn write_meta(path: &Utf8Path, meta: &EntryMeta) -> Result<(), DiskCacheError> {
    let file = BufWriter::new(File::create(path)?);
    ciborium::into_writer(meta, file)
        .map_err(|e| crate::error::CodecError::Encode(e.to_string()).into())
}

fn remove_if_exists(path: &Utf8Path) -> Result<(), DiskCacheError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Reads the value stored under `key`.
///
/// A CRC mismatch or an undecodable payload is a miss: the entry is removed
/// and `None` returned.
pub fn read_value(disk: &DiskCache, key: &str) -> Option<Value> {
    let (id, crc) = disk.entry_exists(key)?;
    let path = disk.get_path_for_id(id).ok()?;

    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("couldn't read disk cache entry {path}: {e}");
            let _ = disk.remove(id);
            return None;
        }
    };

    if codec::crc32(&bytes) != crc {
        tracing::warn!("CRC mismatch in disk cache entry {path}, treating as a miss");
        let _ = disk.remove(id);
        return None;
    }

    match codec::decode::<Value>(&bytes) {
        Ok(value) => {
            disk.record_usage(id);
            tracing::trace!("disk cache hit {path}");
            Some(value)
        }
        Err(e) => {
            tracing::warn!("undecodable disk cache entry {path}: {e}");
            let _ = disk.remove(id);
            None
        }
    }
}

/// Stores `value` under `key`. Failures are logged and otherwise ignored.
pub fn write_value(disk: &DiskCache, key: &str, value: &Value) {
    if let Err(e) = try_write_value(disk, key, value) {
        tracing::warn!("couldn't write disk cache entry: {e}");
    }
}

fn try_write_value(disk: &DiskCache, key: &str, value: &Value) -> Result<(), DiskCacheError> {
    let bytes = codec::encode(value)?;
    let id = disk.initiate_insert(key);

    let result = disk
        .get_path_for_id(id)
        .and_then(|path| Ok(fs::write(path, &bytes)?))
        .and_then(|_| disk.finish_insert(id, codec::crc32(&bytes)));

    if result.is_err() {
        disk.abort_insert(id);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, size_limit: u64) -> DiskCache {
        let directory = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        DiskCache::open(&DiskCacheConfig {
            directory,
            size_limit,
        })
        .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir, 1 << 20);
        let value = Value::Array(vec![Value::Integer(3), Value::String("x".into())]);

        assert!(read_value(&disk, "ctx/a").is_none());
        write_value(&disk, "ctx/a", &value);

        assert_eq!(read_value(&disk, "ctx/a"), Some(value));
        assert_eq!(disk.len(), 1);
        assert!(disk.total_size() > 0);
    }

    #[test]
    fn test_pending_entries_are_invisible() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir, 1 << 20);

        let id = disk.initiate_insert("k");
        let bytes = codec::encode(&Value::Integer(1)).unwrap();
        fs::write(disk.get_path_for_id(id).unwrap(), &bytes).unwrap();
        assert!(disk.entry_exists("k").is_none());

        disk.finish_insert(id, codec::crc32(&bytes)).unwrap();
        assert_eq!(disk.entry_exists("k"), Some((id, codec::crc32(&bytes))));
    }

    #[test]
    fn test_wrong_crc_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir, 1 << 20);

        let bytes = codec::encode(&Value::Integer(7)).unwrap();
        let id = disk.initiate_insert("k");
        fs::write(disk.get_path_for_id(id).unwrap(), &bytes).unwrap();
        disk.finish_insert(id, codec::crc32(&bytes) ^ 1).unwrap();

        assert!(read_value(&disk, "k").is_none());
        assert!(disk.entry_exists("k").is_none());
    }

    #[test]
    fn test_corrupted_data_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir, 1 << 20);
        write_value(&disk, "k", &Value::String("hello".into()));

        let (id, _) = disk.entry_exists("k").unwrap();
        fs::write(disk.get_path_for_id(id).unwrap(), b"garbage").unwrap();

        assert!(read_value(&disk, "k").is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let disk = open(&dir, 1 << 20);
            write_value(&disk, "a", &Value::Integer(1));
            write_value(&disk, "b", &Value::Integer(2));
        }

        let disk = open(&dir, 1 << 20);
        assert_eq!(disk.len(), 2);
        assert_eq!(read_value(&disk, "b"), Some(Value::Integer(2)));
    }

    #[test]
    fn test_overwrite_replaces_entry() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir, 1 << 20);
        write_value(&disk, "a", &Value::Integer(1));
        write_value(&disk, "a", &Value::Integer(2));

        assert_eq!(disk.len(), 1);
        assert_eq!(read_value(&disk, "a"), Some(Value::Integer(2)));
    }

    #[test]
    fn test_stale_handle_does_not_remove_replacement() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir, 1 << 20);
        write_value(&disk, "a", &Value::Integer(1));
        let (stale, _) = disk.entry_exists("a").unwrap();

        write_value(&disk, "a", &Value::Integer(2));

        assert!(disk.remove(stale).is_err());
        assert_eq!(read_value(&disk, "a"), Some(Value::Integer(2)));
    }

    #[test]
    fn test_overwrite_while_reading_keeps_last_write() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir, 1 << 20);
        write_value(&disk, "a", &Value::Integer(0));

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 1..=200 {
                    write_value(&disk, "a", &Value::Integer(i));
                }
            });
            scope.spawn(|| {
                for _ in 0..200 {
                    let _ = read_value(&disk, "a");
                }
            });
        });

        assert_eq!(read_value(&disk, "a"), Some(Value::Integer(200)));
        assert_eq!(disk.len(), 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let dir = TempDir::new().unwrap();
        let blob = Value::Blob(vec![0; 100]);
        let disk = open(&dir, 250);

        write_value(&disk, "a", &blob);
        write_value(&disk, "b", &blob);
        assert!(read_value(&disk, "a").is_some());
        write_value(&disk, "c", &blob);

        assert!(disk.entry_exists("a").is_some());
        assert!(disk.entry_exists("b").is_none());
        assert!(disk.entry_exists("c").is_some());
        assert!(disk.total_size() <= 250);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let disk = open(&dir, 1 << 20);
        write_value(&disk, "a", &Value::Nil);

        let (id, _) = disk.entry_exists("a").unwrap();
        let path = disk.get_path_for_id(id).unwrap();
        disk.remove(id).unwrap();

        assert!(!path.exists());
        assert!(disk.is_empty());
        assert!(disk.remove(id).is_err());
    }
}
