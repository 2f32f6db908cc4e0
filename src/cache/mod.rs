//! Memory and disk caching of resolved values.

mod disk;
mod memory;

pub use crate::cache::disk::{DiskCache, EntryId, read_value, write_value};
pub use crate::cache::memory::{AsyncEntry, CacheEntry, EntryStatus, MemoryCache};

use crate::codec;
use crate::core::Hash32;
use crate::error::CodecError;
use crate::request::Request;

/// The two keys under which the value of a request is cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    /// `context_id + "/" + base64(serialized request)`. Stable across
    /// processes for content-identical requests.
    pub disk: String,
    /// Hash of the disk key, used by the memory cache.
    pub memory: Hash32,
}

impl CacheKey {
    /// Keys `request`, which must already be in objectified form: any
    /// argument resolved elsewhere is referenced by value or object id.
    pub fn new(context_id: &str, request: &Request) -> Result<Self, CodecError> {
        let disk = format!("{context_id}/{}", codec::value_to_base64_string(request)?);
        let memory = Hash32::hash(disk.as_bytes());
        Ok(Self { disk, memory })
    }
}
