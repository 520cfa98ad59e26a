//! File-backed cache store.
//!
//! One directory per entry name, one file per entry. The file name is a
//! hash of the full characteristic set followed by one short hash
//! fragment per pair, so partial-match queries can pre-filter on the
//! file name alone and only read candidate files. Fragments are short
//! enough to collide, so every candidate is verified against its stored
//! characteristics after reading.
//!
//! Writes go through a temp file in the same directory and are published
//! by rename, so readers never observe a half-written entry. The store
//! has no expiry bookkeeping: `ttl` is ignored and garbage collection is
//! unsupported.

use std::io;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use tagcache_core::{
    encode_namespace, CacheError, CacheItem, CacheResult, CacheStore, CacheStorePool,
    Characteristics, PayloadCodec,
};

const CHARACTERISTIC_DELIMITER: char = '.';
const FULL_HASH_LENGTH: usize = 16;
const CHARACTERISTIC_HASH_LENGTH: usize = 4;
const CACHE_FILE_SUFFIX: &str = ".cache";

#[derive(Serialize)]
struct CacheFileRecordRef<'a, T> {
    characteristics: &'a Characteristics,
    data: &'a T,
}

#[derive(Deserialize)]
struct CacheFileRecord<T> {
    characteristics: Characteristics,
    data: T,
}

/// Cache store keeping one file per entry under a base directory.
pub struct FileCacheStore<T> {
    dir_path: PathBuf,
    codec: PayloadCodec,
    _payload: PhantomData<fn() -> T>,
}

impl<T> FileCacheStore<T> {
    pub fn new(dir_path: impl Into<PathBuf>) -> Self {
        Self::with_codec(dir_path, PayloadCodec::default())
    }

    pub fn with_codec(dir_path: impl Into<PathBuf>, codec: PayloadCodec) -> Self {
        Self {
            dir_path: dir_path.into(),
            codec,
            _payload: PhantomData,
        }
    }

    pub fn dir_path(&self) -> &Path {
        &self.dir_path
    }

    fn name_dir_name(&self, name: &str) -> String {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        {
            return short_hash(name.as_bytes(), FULL_HASH_LENGTH);
        }
        name.to_string()
    }

    fn file_name(&self, characteristics: &Characteristics) -> CacheResult<String> {
        let mut file_name = short_hash(&self.codec.encode(characteristics)?, FULL_HASH_LENGTH);
        for pair in characteristics.split() {
            file_name.push(CHARACTERISTIC_DELIMITER);
            file_name.push_str(&short_hash(
                &self.codec.encode(&pair)?,
                CHARACTERISTIC_HASH_LENGTH,
            ));
        }
        file_name.push_str(CACHE_FILE_SUFFIX);
        Ok(file_name)
    }

    fn needle_fragments(&self, needles: &Characteristics) -> CacheResult<Vec<String>> {
        needles
            .split()
            .iter()
            .map(|pair| {
                Ok(short_hash(
                    &self.codec.encode(pair)?,
                    CHARACTERISTIC_HASH_LENGTH,
                ))
            })
            .collect()
    }

    fn collect_matching(
        &self,
        dir: &Path,
        fragments: &[String],
        paths: &mut Vec<PathBuf>,
    ) -> CacheResult<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_failed("could not list cache directory", err)),
        };

        for entry in entries {
            let entry = entry.map_err(|err| io_failed("could not list cache directory", err))?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name_matches(file_name, fragments) {
                paths.push(entry.path());
            }
        }
        Ok(())
    }

    fn find_file_paths(
        &self,
        name: Option<&str>,
        characteristic_needles: Option<&Characteristics>,
    ) -> CacheResult<Vec<PathBuf>> {
        let fragments = match characteristic_needles {
            Some(needles) => self.needle_fragments(needles)?,
            None => Vec::new(),
        };

        let mut paths = Vec::new();
        match name {
            Some(name) => {
                let name_dir = self.dir_path.join(self.name_dir_name(name));
                self.collect_matching(&name_dir, &fragments, &mut paths)?;
            }
            None => {
                let entries = match std::fs::read_dir(&self.dir_path) {
                    Ok(entries) => entries,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(paths),
                    Err(err) => return Err(io_failed("could not list cache directory", err)),
                };
                for entry in entries {
                    let entry =
                        entry.map_err(|err| io_failed("could not list cache directory", err))?;
                    let is_dir = entry
                        .file_type()
                        .map_err(|err| io_failed("could not list cache directory", err))?
                        .is_dir();
                    if is_dir {
                        self.collect_matching(&entry.path(), &fragments, &mut paths)?;
                    }
                }
            }
        }
        Ok(paths)
    }
}

impl<T> FileCacheStore<T>
where
    T: DeserializeOwned,
{
    /// Reads one cache file. A missing or empty file (a torn write that
    /// never got published) counts as absent.
    fn read_file(&self, name: &str, path: &Path) -> CacheResult<Option<CacheItem<T>>> {
        let contents = match std::fs::read(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_failed("could not read cache file", err)),
        };

        if contents.is_empty() {
            return Ok(None);
        }

        let record: CacheFileRecord<T> = self.codec.decode(&contents).map_err(|err| match err {
            CacheError::CorruptedStore { reason } => CacheError::CorruptedStore {
                reason: format!("cache file {}: {reason}", path.display()),
            },
            other => other,
        })?;

        Ok(Some(CacheItem::new(
            name,
            record.characteristics,
            record.data,
        )))
    }
}

impl<T> CacheStore<T> for FileCacheStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn store(
        &self,
        name: &str,
        characteristics: &Characteristics,
        data: &T,
        _ttl: Option<TimeDelta>,
        _now: Option<DateTime<Utc>>,
    ) -> CacheResult<()> {
        let name_dir = self.dir_path.join(self.name_dir_name(name));
        std::fs::create_dir_all(&name_dir)
            .map_err(|err| io_failed("could not create cache directory", err))?;

        let file_path = name_dir.join(self.file_name(characteristics)?);
        let bytes = self
            .codec
            .encode(&CacheFileRecordRef {
                characteristics,
                data,
            })?;

        let mut temp_file = NamedTempFile::new_in(&name_dir)
            .map_err(|err| io_failed("could not create cache file", err))?;
        temp_file
            .write_all(&bytes)
            .map_err(|err| io_failed("could not write cache file", err))?;
        temp_file
            .persist(&file_path)
            .map_err(|err| io_failed("could not publish cache file", err.error))?;

        debug!(name, path = %file_path.display(), "stored cache file");
        Ok(())
    }

    fn get(
        &self,
        name: &str,
        characteristics: &Characteristics,
        _now: Option<DateTime<Utc>>,
    ) -> CacheResult<Option<CacheItem<T>>> {
        let name_dir = self.dir_path.join(self.name_dir_name(name));
        let file_path = name_dir.join(self.file_name(characteristics)?);
        self.read_file(name, &file_path)
    }

    fn remove(&self, name: &str, characteristics: &Characteristics) -> CacheResult<()> {
        let name_dir = self.dir_path.join(self.name_dir_name(name));
        unlink(&name_dir.join(self.file_name(characteristics)?))
    }

    fn find_all(
        &self,
        name: &str,
        characteristic_needles: Option<&Characteristics>,
        _now: Option<DateTime<Utc>>,
    ) -> CacheResult<Vec<CacheItem<T>>> {
        let mut items = Vec::new();
        for path in self.find_file_paths(Some(name), characteristic_needles)? {
            let Some(item) = self.read_file(name, &path)? else {
                continue;
            };

            // the file-name fragments are lossy, verify the real set
            let verified = characteristic_needles
                .map_or(true, |needles| item.contains_characteristics(needles));
            if verified {
                items.push(item);
            }
        }
        Ok(items)
    }

    fn remove_all(
        &self,
        name_needle: Option<&str>,
        characteristic_needles: Option<&Characteristics>,
    ) -> CacheResult<()> {
        for path in self.find_file_paths(name_needle, characteristic_needles)? {
            unlink(&path)?;
        }
        Ok(())
    }

    fn garbage_collect(
        &self,
        _max_lifetime: Option<TimeDelta>,
        _now: Option<DateTime<Utc>>,
    ) -> CacheResult<()> {
        Err(CacheError::Unsupported {
            store: "FileCacheStore",
            operation: "garbage_collect",
        })
    }

    fn clear(&self) -> CacheResult<()> {
        let entries = match std::fs::read_dir(&self.dir_path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_failed("could not list cache directory", err)),
        };

        for entry in entries {
            let entry = entry.map_err(|err| io_failed("could not list cache directory", err))?;
            let is_dir = entry
                .file_type()
                .map_err(|err| io_failed("could not list cache directory", err))?
                .is_dir();
            if !is_dir {
                continue;
            }
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_failed("could not clear cache directory", err)),
            }
        }
        Ok(())
    }
}

/// Pool keeping one sub-directory per namespace.
pub struct FileCacheStorePool<T> {
    dir_path: PathBuf,
    codec: PayloadCodec,
    _payload: PhantomData<fn() -> T>,
}

impl<T> FileCacheStorePool<T> {
    pub fn new(dir_path: impl Into<PathBuf>) -> Self {
        Self::with_codec(dir_path, PayloadCodec::default())
    }

    pub fn with_codec(dir_path: impl Into<PathBuf>, codec: PayloadCodec) -> Self {
        Self {
            dir_path: dir_path.into(),
            codec,
            _payload: PhantomData,
        }
    }
}

impl<T> CacheStorePool<T> for FileCacheStorePool<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn lookup_cache_store(&self, namespace: &str) -> CacheResult<Arc<dyn CacheStore<T>>> {
        let store_dir = self.dir_path.join(encode_namespace(namespace));
        std::fs::create_dir_all(&store_dir)
            .map_err(|err| io_failed("could not create cache directory", err))?;
        Ok(Arc::new(FileCacheStore::with_codec(store_dir, self.codec)))
    }

    fn clear(&self) -> CacheResult<()> {
        match std::fs::remove_dir_all(&self.dir_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_failed("could not clear cache pool directory", err)),
        }
    }
}

fn short_hash(bytes: &[u8], length: usize) -> String {
    hex::encode(Sha256::digest(bytes))[..length].to_string()
}

/// `true` if every needle fragment occurs in the file name's fragment
/// list, in order. Both sides are derived from key-sorted pairs, so an
/// ordered scan is sufficient.
fn file_name_matches(file_name: &str, fragments: &[String]) -> bool {
    let Some(stem) = file_name.strip_suffix(CACHE_FILE_SUFFIX) else {
        return false;
    };

    let mut segments = stem.split(CHARACTERISTIC_DELIMITER).skip(1);
    fragments
        .iter()
        .all(|fragment| segments.any(|segment| segment == fragment.as_str()))
}

fn unlink(path: &Path) -> CacheResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_failed("could not remove cache file", err)),
    }
}

fn io_failed(context: &str, err: io::Error) -> CacheError {
    CacheError::OperationFailed {
        reason: format!("{context}: {err}"),
    }
}
