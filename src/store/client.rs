//! Store client: forwards reads and writes to a remote [`super::StoreService`]
//!
//! Reads never block. The first `get_chunk` for an address sends one request
//! and answers `Pending`; later calls answer `Pending` until the response has
//! been drained. Answers wait in a pick-up map until their address is asked
//! for again, then move into the completed cache. Writes block for their
//! single acknowledgement.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use brickstream_net::{Message, MessageKind, PendingRequest, TransportClient, TransportError};

use crate::core::config::ClientStoreConfig;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::octree::{OctreeAddress, PersistenceKey};
use super::cache::CompletedCache;
use super::server::WRITE_OK;
use super::{ChunkFetch, ChunkStore, PlayerState};

struct ClientState {
    /// At most one in-flight read per address
    pending: HashMap<OctreeAddress, PendingRequest>,
    /// Answers nobody has picked up yet
    answered: HashMap<OctreeAddress, Option<Vec<u8>>>,
    /// Pick-up order of `answered`, oldest first (may hold stale entries)
    answered_order: VecDeque<OctreeAddress>,
    /// Reads the server could not serve; reported once, then requested again
    failed: HashMap<OctreeAddress, String>,
    completed: CompletedCache,
}

impl ClientState {
    fn new(capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            answered: HashMap::new(),
            answered_order: VecDeque::new(),
            failed: HashMap::new(),
            completed: CompletedCache::new(capacity),
        }
    }

    /// Take every response that has arrived out of the pending map
    fn drain_completed(&mut self) {
        let answered = &mut self.answered;
        let order = &mut self.answered_order;
        let failed = &mut self.failed;
        self.pending.retain(|address, request| match request.try_poll() {
            Ok(Some(response)) => {
                match response.failure_reason() {
                    Some(reason) => {
                        log::warn!("Server failed read of {}: {}", address, reason);
                        failed.insert(*address, reason);
                    }
                    None => {
                        answered.insert(*address, response.data);
                        order.push_back(*address);
                    }
                }
                false
            }
            Ok(None) => true,
            Err(e) => {
                log::warn!("Read of {} lost: {}", address, e);
                false
            }
        });

        // Answers left unclaimed (their chunk went away) spill into the cache
        let limit = self.completed.capacity();
        while self.answered.len() > limit {
            let Some(address) = self.answered_order.pop_front() else {
                break;
            };
            if let Some(value) = self.answered.remove(&address) {
                self.completed.insert(address, value);
            }
        }
        if self.answered_order.len() > 2 * limit {
            let answered = &self.answered;
            self.answered_order.retain(|address| answered.contains_key(address));
        }
    }

    /// Answer from what has already arrived, if anything
    fn lookup(&mut self, address: OctreeAddress) -> Option<Result<ChunkFetch>> {
        if let Some(reason) = self.failed.remove(&address) {
            return Some(Err(Error::Remote(format!("read of {}: {}", address, reason))));
        }
        let value = match self.answered.remove(&address) {
            Some(value) => {
                self.completed.insert(address, value.clone());
                value
            }
            None => self.completed.get(address)?,
        };
        Some(Ok(match value {
            Some(bytes) => ChunkFetch::Found(bytes),
            None => ChunkFetch::Absent,
        }))
    }
}

pub struct ClientStore {
    transport: TransportClient,
    state: Mutex<ClientState>,
    requests_issued: AtomicU64,
}

impl ClientStore {
    /// Connect to a store server
    pub fn connect(config: &ClientStoreConfig) -> Result<Self> {
        let transport = TransportClient::connect(config.transport.clone())?;
        Ok(Self {
            transport,
            state: Mutex::new(ClientState::new(config.completed_cache_capacity)),
            requests_issued: AtomicU64::new(0),
        })
    }

    /// Read requests sent so far (coalesced and cached reads excluded)
    pub fn requests_issued(&self) -> u64 {
        self.requests_issued.load(Ordering::Relaxed)
    }

    /// Reads currently in flight
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer one address with the state already drained
    fn fetch(&self, state: &mut ClientState, address: OctreeAddress) -> Result<ChunkFetch> {
        if let Some(result) = state.lookup(address) {
            return result;
        }
        if state.pending.contains_key(&address) {
            return Ok(ChunkFetch::Pending);
        }
        if !self.transport.is_connected() {
            return Err(TransportError::Disconnected.into());
        }

        let key = PersistenceKey::chunk(address).to_be_bytes().to_vec();
        let request = self.transport.send(MessageKind::GetValue, key, None);
        log::trace!("Requested {} (uid={})", address, request.uid());
        state.pending.insert(address, request);
        self.requests_issued.fetch_add(1, Ordering::Relaxed);
        Ok(ChunkFetch::Pending)
    }

    /// Send a write and block for its acknowledgement
    fn write_value(&self, key: PersistenceKey, data: &[u8]) -> Result<()> {
        let response = self
            .transport
            .send(MessageKind::SetValue, key.to_be_bytes().to_vec(), Some(data.to_vec()))
            .wait()?;
        if let Some(reason) = response.failure_reason() {
            return Err(Error::Remote(reason));
        }
        if response.data.as_deref() == Some(&[WRITE_OK][..]) {
            Ok(())
        } else {
            Err(Error::WriteRejected(format!("{:?}", key)))
        }
    }

    /// Block for a read outside the chunk path
    fn read_value(&self, key: PersistenceKey) -> Result<Option<Vec<u8>>> {
        let response: Message = self
            .transport
            .send(MessageKind::GetValue, key.to_be_bytes().to_vec(), None)
            .wait()?;
        match response.failure_reason() {
            Some(reason) => Err(Error::Remote(reason)),
            None => Ok(response.data),
        }
    }
}

impl ChunkStore for ClientStore {
    fn get_chunk(&self, address: OctreeAddress) -> Result<ChunkFetch> {
        let mut state = self.lock();
        state.drain_completed();
        self.fetch(&mut state, address)
    }

    fn get_chunks(&self, addresses: &[OctreeAddress]) -> Vec<Result<ChunkFetch>> {
        let mut state = self.lock();
        state.drain_completed();
        addresses
            .iter()
            .map(|address| self.fetch(&mut state, *address))
            .collect()
    }

    fn write_chunk(&self, address: OctreeAddress, payload: &[u8]) -> Result<()> {
        self.write_value(PersistenceKey::chunk(address), payload)?;

        // An older read still in flight would overwrite the cache with stale data
        let mut state = self.lock();
        state.pending.remove(&address);
        state.answered.remove(&address);
        state.failed.remove(&address);
        state.completed.insert(address, Some(payload.to_vec()));
        Ok(())
    }

    fn get_player_state(&self) -> Result<Option<PlayerState>> {
        match self.read_value(PersistenceKey::player_state())? {
            Some(json) => Ok(Some(serde_json::from_slice(&json)?)),
            None => Ok(None),
        }
    }

    fn write_player_state(&self, state: &PlayerState) -> Result<()> {
        let json = serde_json::to_vec(state)?;
        self.write_value(PersistenceKey::player_state(), &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{PlacedInstance, decode_payload, encode_payload};
    use crate::core::config::StoreConfig;
    use crate::core::types::{Quat, Vec3};
    use crate::store::{ServerStore, StoreService};
    use brickstream_net::{ClientConfig, RequestHandler, ServerConfig, TransportServer};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    struct Harness {
        server: TransportServer,
        store: Arc<ServerStore>,
        _dir: tempfile::TempDir,
    }

    fn start() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ServerStore::open_at(&dir.path().join("db"), &StoreConfig::default()).unwrap());
        let handler: Arc<tokio::sync::Mutex<dyn RequestHandler>> =
            Arc::new(tokio::sync::Mutex::new(StoreService::new(store.clone())));
        let config = ServerConfig {
            addr: "127.0.0.1:0".into(),
            ..Default::default()
        };
        let server = TransportServer::start(config, handler).unwrap();
        Harness { server, store, _dir: dir }
    }

    fn client(harness: &Harness) -> ClientStore {
        let config = ClientStoreConfig {
            transport: ClientConfig::for_addr(harness.server.local_addr()),
            ..Default::default()
        };
        ClientStore::connect(&config).unwrap()
    }

    /// Poll until the read resolves
    fn resolve(client: &ClientStore, address: OctreeAddress) -> ChunkFetch {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let result = client.get_chunk(address).unwrap();
            if !result.is_pending() {
                return result;
            }
            assert!(Instant::now() < deadline, "read of {} never resolved", address);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn addr(x: u32) -> OctreeAddress {
        OctreeAddress::new(x, 3, 1, 4).unwrap()
    }

    #[test]
    fn test_duplicate_reads_coalesce() {
        let harness = start();
        let client = client(&harness);

        assert_eq!(client.get_chunk(addr(1)).unwrap(), ChunkFetch::Pending);
        // Either still in flight or already answered; never a second request
        client.get_chunk(addr(1)).unwrap();
        assert_eq!(client.requests_issued(), 1);

        assert_eq!(resolve(&client, addr(1)), ChunkFetch::Absent);
        // Served from the completed cache from now on
        assert_eq!(client.get_chunk(addr(1)).unwrap(), ChunkFetch::Absent);
        assert_eq!(client.requests_issued(), 1);
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn test_distinct_addresses_each_request() {
        let harness = start();
        let client = client(&harness);
        for x in 0..5 {
            client.get_chunk(addr(x)).unwrap();
        }
        assert_eq!(client.requests_issued(), 5);
        for x in 0..5 {
            assert_eq!(resolve(&client, addr(x)), ChunkFetch::Absent);
        }
    }

    #[test]
    fn test_written_chunk_read_by_fresh_client() {
        let harness = start();
        let instances = vec![
            PlacedInstance::new(1, 0, Vec3::new(0.5, 0.5, 0.5), Quat::IDENTITY, false),
            PlacedInstance::new(2, 3, Vec3::new(1.5, 0.5, 0.5), Quat::from_rotation_y(1.0), true),
            PlacedInstance::new(3, 7, Vec3::new(-4.0, 2.0, 0.0), Quat::IDENTITY, false),
        ];

        let writer = client(&harness);
        writer.write_chunk(addr(9), &encode_payload(&instances)).unwrap();
        // Write-through: the writer sees its own data without a read request
        assert!(matches!(writer.get_chunk(addr(9)).unwrap(), ChunkFetch::Found(_)));
        assert_eq!(writer.requests_issued(), 0);

        let reader = client(&harness);
        let ChunkFetch::Found(bytes) = resolve(&reader, addr(9)) else {
            panic!("written chunk not found");
        };
        assert_eq!(decode_payload(&bytes).unwrap(), instances);
        assert_eq!(harness.store.get_chunk(addr(9)).unwrap(), ChunkFetch::Found(bytes));
    }

    #[test]
    fn test_player_state_over_network() {
        let harness = start();
        let client = client(&harness);
        assert_eq!(client.get_player_state().unwrap(), None);

        let state = PlayerState {
            position: [0.0, 10.0, 0.0],
            held_item: None,
            inventory: vec![3, 3],
        };
        client.write_player_state(&state).unwrap();
        assert_eq!(client.get_player_state().unwrap(), Some(state.clone()));
        assert_eq!(harness.store.get_player_state().unwrap(), Some(state));
    }

    #[test]
    fn test_reads_fail_after_server_loss() {
        let mut harness = start();
        let client = client(&harness);
        harness.server.shutdown();

        let deadline = Instant::now() + Duration::from_secs(5);
        while client.is_connected() {
            assert!(Instant::now() < deadline, "disconnect never observed");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(
            client.get_chunk(addr(1)),
            Err(Error::Transport(TransportError::Disconnected))
        ));
        assert!(client.write_chunk(addr(1), &encode_payload(&[])).is_err());
    }

    #[test]
    fn test_unreadable_value_is_an_error_not_absent() {
        let harness = start();
        let key = PersistenceKey::chunk(addr(4)).to_be_bytes();
        harness.store.put_stored(&key, vec![9, 1, 2]).unwrap();
        let client = client(&harness);

        let deadline = Instant::now() + Duration::from_secs(5);
        let error = loop {
            match client.get_chunk(addr(4)) {
                Ok(ChunkFetch::Pending) => {}
                Ok(other) => panic!("unreadable value answered as {:?}", other),
                Err(e) => break e,
            }
            assert!(Instant::now() < deadline, "read never resolved");
            std::thread::sleep(Duration::from_millis(1));
        };
        assert!(matches!(error, Error::Remote(_)));

        // Not cached: the next read asks the server again
        assert_eq!(client.get_chunk(addr(4)).unwrap(), ChunkFetch::Pending);
        assert_eq!(client.requests_issued(), 2);
    }

    #[test]
    fn test_coarse_loads_request_each_leaf_once_with_small_cache() {
        use crate::chunk::{Chunk, LoadContext};

        let harness = start();
        let config = ClientStoreConfig {
            transport: ClientConfig::for_addr(harness.server.local_addr()),
            completed_cache_capacity: 16,
        };
        let client = ClientStore::connect(&config).unwrap();
        let ctx = LoadContext {
            store: &client,
            leaf_level: 4,
            max_aggregate_levels: 2,
        };

        // 4 coarse chunks of 8 leaves each: twice the cache
        let mut chunks: Vec<Chunk> = (0..4)
            .map(|x| Chunk::new(OctreeAddress::new(x, 1, 0, 3).unwrap()))
            .collect();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !chunks.iter().all(Chunk::is_ready) {
            assert!(Instant::now() < deadline, "coarse chunks never loaded");
            for chunk in &mut chunks {
                chunk.background_load(&ctx);
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(client.requests_issued(), 32);
    }
}
