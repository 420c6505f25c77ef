//! Background-threaded store client
//!
//! Requests are queued under a lock by any thread. A single network thread
//! drains the queue in batches, records each request's completion slot in a
//! waiting map keyed by uid, and writes it to one of `channel_count`
//! connections. Reader tasks on the same thread match responses back to
//! their slots by uid, so responses may arrive in any order.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{Notify, oneshot};

use crate::protocol::{Message, MessageKind, read_message, write_message};
use crate::{DEFAULT_PORT, TransportError, throttle};

/// Client endpoint parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address (host:port)
    pub addr: String,
    /// Number of connections requests are spread over (by uid)
    pub channel_count: usize,
    /// Bytes per second read per channel (0 = unlimited)
    pub incoming_bandwidth: u32,
    /// Bytes per second written in total (0 = unlimited)
    pub outgoing_bandwidth: u32,
    /// Upper bound on how long a queued request waits for the network thread
    pub poll_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            channel_count: 1,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            poll_interval_ms: 5,
        }
    }
}

impl ClientConfig {
    /// Default parameters pointed at `addr`
    pub fn for_addr(addr: SocketAddr) -> Self {
        Self {
            addr: addr.to_string(),
            ..Default::default()
        }
    }
}

/// Completion slot for one in-flight request
#[derive(Debug)]
pub struct PendingRequest {
    uid: u64,
    receiver: oneshot::Receiver<Message>,
}

impl PendingRequest {
    /// Request id embedded in the wire header
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Check for the response without blocking.
    ///
    /// Returns `Ok(None)` while the response is outstanding and
    /// `Err(Disconnected)` if it can no longer arrive. Once a response has
    /// been returned the slot is spent.
    pub fn try_poll(&mut self) -> Result<Option<Message>, TransportError> {
        match self.receiver.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => Err(TransportError::Disconnected),
        }
    }

    /// Block the calling thread until the response arrives.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Result<Message, TransportError> {
        self.receiver
            .blocking_recv()
            .map_err(|_| TransportError::Disconnected)
    }
}

struct Outbound {
    queue: VecDeque<(Message, oneshot::Sender<Message>)>,
    closed: bool,
}

struct Shared {
    outbound: Mutex<Outbound>,
    waiting: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
    wake: Notify,
    requests_sent: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    /// Take the next batch, at most `budget` bytes (always at least one
    /// message). `None` once the client is closed.
    fn take_batch(&self, budget: usize) -> Option<Vec<(Message, oneshot::Sender<Message>)>> {
        let mut outbound = lock(&self.outbound);
        if outbound.closed {
            return None;
        }

        let mut batch = Vec::new();
        let mut bytes = 0usize;
        while let Some((message, _)) = outbound.queue.front() {
            let len = 4 + message.body_len();
            if !batch.is_empty() && bytes + len > budget {
                break;
            }
            bytes += len;
            if let Some(entry) = outbound.queue.pop_front() {
                batch.push(entry);
            }
        }
        Some(batch)
    }

    /// Mark closed and drop every outstanding completion slot, which fails
    /// the matching `PendingRequest`s with `Disconnected`.
    fn close(&self) {
        {
            let mut outbound = lock(&self.outbound);
            outbound.closed = true;
            outbound.queue.clear();
        }
        lock(&self.waiting).clear();
        self.wake.notify_one();
    }
}

/// Store client handle. Dropping it closes the connections and joins the
/// network thread.
pub struct TransportClient {
    shared: Arc<Shared>,
    peer_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl TransportClient {
    /// Connect all channels on a new network thread. Connection failures are
    /// reported here and not retried.
    pub fn connect(config: ClientConfig) -> Result<Self, TransportError> {
        let shared = Arc::new(Shared {
            outbound: Mutex::new(Outbound {
                queue: VecDeque::new(),
                closed: false,
            }),
            waiting: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            requests_sent: AtomicU64::new(0),
        });
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("store-client".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                runtime.block_on(run(config, thread_shared, ready_tx));
            })?;

        let peer_addr = match ready_rx.recv() {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e.into());
            }
            Err(_) => {
                let _ = thread.join();
                return Err(TransportError::Disconnected);
            }
        };

        Ok(Self {
            shared,
            peer_addr,
            thread: Some(thread),
        })
    }

    /// Queue a request. Never blocks on the network.
    pub fn send(&self, kind: MessageKind, key: Vec<u8>, data: Option<Vec<u8>>) -> PendingRequest {
        let message = Message::request(kind, key, data);
        let uid = message.uid;
        let (slot, receiver) = oneshot::channel();

        {
            let mut outbound = lock(&self.shared.outbound);
            if outbound.closed {
                // Dropping the slot fails the request immediately
                drop(slot);
            } else {
                outbound.queue.push_back((message, slot));
                self.shared.requests_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.shared.wake.notify_one();

        PendingRequest { uid, receiver }
    }

    /// Total requests accepted for sending
    pub fn requests_sent(&self) -> u64 {
        self.shared.requests_sent.load(Ordering::Relaxed)
    }

    /// Whether the connections are still up
    pub fn is_connected(&self) -> bool {
        !lock(&self.shared.outbound).closed
    }

    /// Server address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Close the connections and join the network thread
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.shared.close();
            if thread.join().is_err() {
                log::error!("Store client thread panicked");
            }
        }
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run(
    config: ClientConfig,
    shared: Arc<Shared>,
    ready_tx: std::sync::mpsc::Sender<std::io::Result<SocketAddr>>,
) {
    let channel_count = config.channel_count.max(1);
    let mut writers = Vec::with_capacity(channel_count);
    let mut peer_addr = None;

    for channel in 0..channel_count {
        let stream = match TcpStream::connect(&config.addr).await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Failed to connect to store server {}: {}", config.addr, e);
                shared.close();
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("Could not disable Nagle on channel {}: {}", channel, e);
        }
        if peer_addr.is_none() {
            peer_addr = stream.peer_addr().ok();
        }

        let (reader, writer) = stream.into_split();
        tokio::spawn(receive_loop(
            reader,
            shared.clone(),
            config.incoming_bandwidth,
            channel,
        ));
        writers.push(writer);
    }

    let Some(peer_addr) = peer_addr else {
        shared.close();
        let _ = ready_tx.send(Err(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "no peer address",
        )));
        return;
    };
    log::info!(
        "Connected to store server {} over {} channel(s)",
        peer_addr,
        channel_count
    );
    let _ = ready_tx.send(Ok(peer_addr));

    let poll_interval = Duration::from_millis(config.poll_interval_ms.max(1));
    let batch_budget = if config.outgoing_bandwidth == 0 {
        usize::MAX
    } else {
        ((config.outgoing_bandwidth as f64 * poll_interval.as_secs_f64()) as usize).max(1)
    };

    'network: loop {
        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }

        let Some(batch) = shared.take_batch(batch_budget) else {
            break;
        };

        for (message, slot) in batch {
            lock(&shared.waiting).insert(message.uid, slot);
            let channel = (message.uid % channel_count as u64) as usize;
            if let Err(e) = write_message(&mut writers[channel], &message).await {
                log::error!("Store client write on channel {} failed: {}", channel, e);
                break 'network;
            }
            log::trace!(
                "Sent {:?} uid={} on channel {}",
                message.kind,
                message.uid,
                channel
            );
        }
    }

    shared.close();
    log::info!("Store client for {} stopped", peer_addr);
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    incoming_bandwidth: u32,
    channel: usize,
) {
    loop {
        match read_message(&mut reader).await {
            Ok(Some(message)) => {
                let len = 4 + message.body_len();
                let slot = lock(&shared.waiting).remove(&message.uid);
                match slot {
                    Some(slot) => {
                        // The requester may have given up; that is fine
                        let _ = slot.send(message);
                    }
                    None => {
                        log::warn!("Dropping response with unknown uid {}", message.uid);
                    }
                }
                throttle(len, incoming_bandwidth).await;
            }
            Ok(None) => {
                log::warn!("Store server closed channel {}", channel);
                break;
            }
            Err(e) => {
                log::error!("Store client read on channel {} failed: {}", channel, e);
                break;
            }
        }
    }

    shared.close();
}
