//! Durable chunk store backed by sled
//!
//! Keys are [`PersistenceKey`]s in big-endian form, so one octree level is a
//! contiguous key range. Values are compressed (see [`super::compression`]).
//! A [`MembershipFilter`] answers most misses without a tree lookup.

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use brickstream_net::{Message, MessageKind, RequestHandler};

use crate::core::config::StoreConfig;
use crate::core::types::Result;
use crate::octree::{OctreeAddress, PersistenceKey};
use super::compression::{self, CompressionFormat};
use super::filter::MembershipFilter;
use super::{ChunkFetch, ChunkStore, PlayerState};

const CHUNK_TREE: &str = "chunks";

/// Acknowledgement bytes of a `SetValue` response
pub const WRITE_OK: u8 = 1;
pub const WRITE_FAILED: u8 = 0;

pub struct ServerStore {
    db: sled::Db,
    tree: sled::Tree,
    filter: RwLock<MembershipFilter>,
    write_format: CompressionFormat,
    filter_bits_per_key: u32,
}

impl ServerStore {
    /// Open (or create) the database at `config.path`
    pub fn open(config: &StoreConfig) -> Result<Self> {
        Self::open_at(&config.path, config)
    }

    /// Open (or create) the database at `path`, other settings from `config`
    pub fn open_at(path: &Path, config: &StoreConfig) -> Result<Self> {
        let db = sled::Config::default()
            .path(path)
            .cache_capacity(config.cache_capacity_bytes)
            .flush_every_ms(Some(config.flush_every_ms))
            .open()?;
        let tree = db.open_tree(CHUNK_TREE)?;
        let filter = build_filter(&tree, config.filter_bits_per_key)?;

        log::info!(
            "Opened chunk store {} ({} keys, writing {:?})",
            path.display(),
            filter.len(),
            config.write_format
        );

        Ok(Self {
            db,
            tree,
            filter: RwLock::new(filter),
            write_format: config.write_format,
            filter_bits_per_key: config.filter_bits_per_key,
        })
    }

    /// Read and decompress the value under a raw key
    pub fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let maybe_present = self
            .filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .may_contain(key);
        if !maybe_present {
            return Ok(None);
        }

        match self.tree.get(key)? {
            Some(value) => Ok(Some(compression::decompress(&value)?)),
            None => Ok(None),
        }
    }

    /// Compress and store a value under a raw key
    pub fn put_raw(&self, key: &[u8], bytes: &[u8]) -> Result<()> {
        self.put_with_format(key, bytes, self.write_format)
    }

    /// Store a value in an explicit format (for migration tooling)
    pub fn put_with_format(&self, key: &[u8], bytes: &[u8], format: CompressionFormat) -> Result<()> {
        let value = compression::compress(format, bytes)?;
        let previous = self.tree.insert(key, value)?;
        if previous.is_none() {
            self.note_new_key(key)?;
        }
        Ok(())
    }

    /// Store bytes exactly as given, without the compression header
    #[cfg(test)]
    pub(crate) fn put_stored(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        if self.tree.insert(key, value)?.is_none() {
            self.note_new_key(key)?;
        }
        Ok(())
    }

    fn note_new_key(&self, key: &[u8]) -> Result<()> {
        let mut filter = self.filter.write().unwrap_or_else(PoisonError::into_inner);
        filter.insert(key);
        if filter.is_saturated() {
            *filter = build_filter(&self.tree, self.filter_bits_per_key)?;
            log::debug!("Rebuilt membership filter for {} keys", filter.len());
        }
        Ok(())
    }

    /// Every stored chunk of one level, in address order
    pub fn chunks_at_level(&self, level: u8) -> Result<Vec<(OctreeAddress, Vec<u8>)>> {
        let mut out = Vec::new();
        for entry in self.tree.range(PersistenceKey::level_range(level)) {
            let (key, value) = entry?;
            let Some(address) = PersistenceKey::from_be_bytes(&key).and_then(|k| k.address()) else {
                log::warn!("Skipping unparseable key {:?}", key.as_ref());
                continue;
            };
            out.push((address, compression::decompress(&value)?));
        }
        Ok(out)
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Force buffered writes to disk
    pub fn flush(&self) -> Result<usize> {
        Ok(self.db.flush()?)
    }
}

fn build_filter(tree: &sled::Tree, bits_per_key: u32) -> Result<MembershipFilter> {
    let mut filter = MembershipFilter::new(tree.len() * 2, bits_per_key);
    for key in tree.iter().keys() {
        filter.insert(&key?);
    }
    Ok(filter)
}

impl ChunkStore for ServerStore {
    fn get_chunk(&self, address: OctreeAddress) -> Result<ChunkFetch> {
        Ok(match self.get_raw(&PersistenceKey::chunk(address).to_be_bytes())? {
            Some(bytes) => ChunkFetch::Found(bytes),
            None => ChunkFetch::Absent,
        })
    }

    fn write_chunk(&self, address: OctreeAddress, payload: &[u8]) -> Result<()> {
        self.put_raw(&PersistenceKey::chunk(address).to_be_bytes(), payload)
    }

    fn get_player_state(&self) -> Result<Option<PlayerState>> {
        match self.get_raw(&PersistenceKey::player_state().to_be_bytes())? {
            Some(json) => Ok(Some(serde_json::from_slice(&json)?)),
            None => Ok(None),
        }
    }

    fn write_player_state(&self, state: &PlayerState) -> Result<()> {
        let json = serde_json::to_vec(state)?;
        self.put_raw(&PersistenceKey::player_state().to_be_bytes(), &json)
    }
}

/// Answers transport requests from a [`ServerStore`]
pub struct StoreService {
    store: Arc<ServerStore>,
}

impl StoreService {
    pub fn new(store: Arc<ServerStore>) -> Self {
        Self { store }
    }
}

impl RequestHandler for StoreService {
    fn handle_request(&mut self, request: Message) -> Message {
        if PersistenceKey::from_be_bytes(&request.key).is_none() {
            log::warn!("Rejecting {:?} with {} byte key", request.kind, request.key.len());
            return match request.kind {
                MessageKind::SetValue => request.reply(Some(vec![WRITE_FAILED])),
                _ => request.fail("malformed key"),
            };
        }

        match request.kind {
            // A failed read must not look like a missing key
            MessageKind::GetValue => match self.store.get_raw(&request.key) {
                Ok(value) => request.reply(value),
                Err(e) => {
                    log::error!("Read of key {:?} failed: {}", request.key, e);
                    request.fail(&e.to_string())
                }
            },
            MessageKind::SetValue => {
                let Some(data) = request.data.as_deref() else {
                    log::warn!("SetValue uid={} without data", request.uid);
                    return request.reply(Some(vec![WRITE_FAILED]));
                };
                let ack = match self.store.put_raw(&request.key, data) {
                    Ok(()) => WRITE_OK,
                    Err(e) => {
                        log::error!("Write of key {:?} failed: {}", request.key, e);
                        WRITE_FAILED
                    }
                };
                request.reply(Some(vec![ack]))
            }
            MessageKind::Failure => {
                log::warn!("Ignoring Failure frame sent as a request (uid={})", request.uid);
                request.fail("not a request")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{PlacedInstance, decode_payload, encode_payload};
    use crate::core::types::{Quat, Vec3};

    fn open(dir: &tempfile::TempDir) -> ServerStore {
        ServerStore::open_at(&dir.path().join("db"), &StoreConfig::default()).unwrap()
    }

    fn addr(x: u32, y: u32, z: u32, level: u8) -> OctreeAddress {
        OctreeAddress::new(x, y, z, level).unwrap()
    }

    #[test]
    fn test_missing_chunk_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert_eq!(store.get_chunk(addr(1, 2, 3, 4)).unwrap(), ChunkFetch::Absent);
        assert!(store.is_empty());
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let payload = encode_payload(&[PlacedInstance::new(1, 2, Vec3::ONE, Quat::IDENTITY, true)]);

        store.write_chunk(addr(1, 2, 3, 4), &payload).unwrap();
        assert_eq!(store.get_chunk(addr(1, 2, 3, 4)).unwrap(), ChunkFetch::Found(payload));
        assert_eq!(store.get_chunk(addr(1, 2, 2, 4)).unwrap(), ChunkFetch::Absent);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let payload = encode_payload(&[PlacedInstance::new(7, 0, Vec3::ZERO, Quat::IDENTITY, false)]);
        {
            let store = open(&dir);
            store.write_chunk(addr(0, 0, 0, 2), &payload).unwrap();
            store.flush().unwrap();
        }

        let store = open(&dir);
        let ChunkFetch::Found(bytes) = store.get_chunk(addr(0, 0, 0, 2)).unwrap() else {
            panic!("chunk lost on reopen");
        };
        assert_eq!(decode_payload(&bytes).unwrap()[0].part_type, 7);
    }

    #[test]
    fn test_legacy_snappy_values_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let key = PersistenceKey::chunk(addr(2, 2, 2, 3)).to_be_bytes();

        store.put_with_format(&key, b"old data", CompressionFormat::Snappy).unwrap();
        assert_eq!(store.get_raw(&key).unwrap(), Some(b"old data".to_vec()));

        // Rewrites use the configured format
        store.put_raw(&key, b"new data").unwrap();
        let raw = store.tree.get(key).unwrap().unwrap();
        assert_eq!(raw[0], 1);
        assert_eq!(store.get_raw(&key).unwrap(), Some(b"new data".to_vec()));
    }

    #[test]
    fn test_chunks_at_level_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        for a in [addr(3, 0, 0, 2), addr(0, 1, 0, 2), addr(1, 1, 1, 1), addr(0, 0, 3, 2)] {
            store.write_chunk(a, &encode_payload(&[])).unwrap();
        }
        store.write_player_state(&PlayerState::default()).unwrap();

        let level_2: Vec<_> = store.chunks_at_level(2).unwrap().into_iter().map(|(a, _)| a).collect();
        assert_eq!(level_2, vec![addr(0, 0, 3, 2), addr(0, 1, 0, 2), addr(3, 0, 0, 2)]);
        assert_eq!(store.chunks_at_level(1).unwrap().len(), 1);
        assert!(store.chunks_at_level(5).unwrap().is_empty());
    }

    #[test]
    fn test_player_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert_eq!(store.get_player_state().unwrap(), None);

        let state = PlayerState {
            position: [1.0, 64.0, -3.5],
            held_item: Some(12),
            inventory: vec![1, 1, 4, 9],
        };
        store.write_player_state(&state).unwrap();
        assert_eq!(store.get_player_state().unwrap(), Some(state));
    }

    #[test]
    fn test_filter_rebuilt_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir);
            store.write_chunk(addr(5, 5, 5, 3), &[1, 0, 0, 0]).unwrap();
            store.flush().unwrap();
        }
        let store = open(&dir);
        let key = PersistenceKey::chunk(addr(5, 5, 5, 3)).to_be_bytes();
        assert!(store.filter.read().unwrap().may_contain(&key));
    }

    #[test]
    fn test_service_get_and_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open(&dir));
        let mut service = StoreService::new(store.clone());
        let key = PersistenceKey::chunk(addr(1, 0, 0, 1)).to_be_bytes().to_vec();

        let miss = service.handle_request(Message::request(MessageKind::GetValue, key.clone(), None));
        assert_eq!(miss.data, None);

        let set = Message::request(MessageKind::SetValue, key.clone(), Some(vec![4, 0, 0, 0]));
        let ack = service.handle_request(set.clone());
        assert_eq!(ack.uid, set.uid);
        assert_eq!(ack.data, Some(vec![WRITE_OK]));

        let hit = service.handle_request(Message::request(MessageKind::GetValue, key, None));
        assert_eq!(hit.data, Some(vec![4, 0, 0, 0]));
    }

    #[test]
    fn test_service_rejects_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = StoreService::new(Arc::new(open(&dir)));

        let short_key = Message::request(MessageKind::SetValue, vec![1, 2], Some(vec![1]));
        assert_eq!(service.handle_request(short_key).data, Some(vec![WRITE_FAILED]));

        let short_get = Message::request(MessageKind::GetValue, vec![1, 2], None);
        assert_eq!(service.handle_request(short_get).kind, MessageKind::Failure);

        let key = PersistenceKey::chunk(OctreeAddress::ROOT).to_be_bytes().to_vec();
        let no_data = Message::request(MessageKind::SetValue, key, None);
        assert_eq!(service.handle_request(no_data).data, Some(vec![WRITE_FAILED]));
    }

    #[test]
    fn test_service_reports_unreadable_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open(&dir));
        let key = PersistenceKey::chunk(addr(2, 0, 1, 4)).to_be_bytes();
        // Unknown compression tag
        store.put_stored(&key, vec![9, 1, 2]).unwrap();
        assert!(store.get_chunk(addr(2, 0, 1, 4)).is_err());

        let mut service = StoreService::new(store);
        let reply = service.handle_request(Message::request(MessageKind::GetValue, key.to_vec(), None));
        assert_eq!(reply.kind, MessageKind::Failure);
        assert!(reply.failure_reason().unwrap().contains("format tag 9"));
    }
}
