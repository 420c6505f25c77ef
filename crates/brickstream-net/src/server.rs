//! TCP store server

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};

use crate::protocol::{Message, read_message, write_message};
use crate::{DEFAULT_PORT, TransportError, throttle};

/// Trait that the store implements to answer requests
pub trait RequestHandler: Send + 'static {
    /// Produce the response for `request`. The response must carry the
    /// request's uid; [`Message::reply`] takes care of that.
    fn handle_request(&mut self, request: Message) -> Message;
}

/// Server endpoint parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (host:port, port 0 picks a free port)
    pub addr: String,
    /// Connections beyond this many are refused
    pub max_peers: usize,
    /// Bytes per second written per connection (0 = unlimited)
    pub outgoing_bandwidth: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            max_peers: 32,
            outgoing_bandwidth: 0,
        }
    }
}

/// Server handle - keep this alive to keep the server running.
///
/// The listener is created on the network thread when it starts and is
/// dropped when the thread is joined (on [`TransportServer::shutdown`] or drop).
pub struct TransportServer {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    thread: Option<JoinHandle<()>>,
}

impl TransportServer {
    /// Start the server on its own network thread.
    /// Returns once the listener is bound.
    pub fn start(
        config: ServerConfig,
        handler: Arc<Mutex<dyn RequestHandler>>,
    ) -> Result<Self, TransportError> {
        let shutdown = Arc::new(Notify::new());
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let thread_shutdown = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name("store-server".into())
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
                runtime.block_on(serve(config, handler, thread_shutdown, ready_tx));
            })?;

        let local_addr = match ready_rx.recv() {
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
            local_addr,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drop all connections and join the network thread
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.shutdown.notify_one();
            if thread.join().is_err() {
                log::error!("Store server thread panicked");
            }
        }
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve(
    config: ServerConfig,
    handler: Arc<Mutex<dyn RequestHandler>>,
    shutdown: Arc<Notify>,
    ready_tx: std::sync::mpsc::Sender<std::io::Result<SocketAddr>>,
) {
    let listener = match TcpListener::bind(&config.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind store server on {}: {}", config.addr, e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    log::info!("Store server listening on {}", local_addr);
    let _ = ready_tx.send(Ok(local_addr));

    let peers = Arc::new(AtomicUsize::new(0));

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                log::info!("Store server on {} shutting down", local_addr);
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if peers.load(Ordering::Acquire) >= config.max_peers {
                        log::warn!("Refusing {}: peer limit {} reached", peer, config.max_peers);
                        continue;
                    }
                    peers.fetch_add(1, Ordering::AcqRel);
                    log::info!("Store client connected from {}", peer);

                    let handler = handler.clone();
                    let peers = peers.clone();
                    let bandwidth = config.outgoing_bandwidth;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler, bandwidth).await {
                            log::error!("Store connection {} failed: {}", peer, e);
                        }
                        peers.fetch_sub(1, Ordering::AcqRel);
                        log::info!("Store client disconnected: {}", peer);
                    });
                }
                Err(e) => {
                    log::error!("Store server accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    handler: Arc<Mutex<dyn RequestHandler>>,
    outgoing_bandwidth: u32,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    while let Some(request) = read_message(&mut reader).await? {
        log::trace!(
            "Request {:?} uid={} key={}B",
            request.kind,
            request.uid,
            request.key.len()
        );

        let response = {
            let mut h = handler.lock().await;
            h.handle_request(request)
        };

        write_message(&mut writer, &response).await?;
        throttle(4 + response.body_len(), outgoing_bandwidth).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use std::io::{Read, Write};

    struct Echo;

    impl RequestHandler for Echo {
        fn handle_request(&mut self, request: Message) -> Message {
            let data = request.data.clone();
            request.reply(data)
        }
    }

    fn read_frame(stream: &mut std::net::TcpStream) -> Message {
        let mut size = [0u8; 4];
        stream.read_exact(&mut size).unwrap();
        let mut body = vec![0u8; u32::from_le_bytes(size) as usize];
        stream.read_exact(&mut body).unwrap();
        Message::decode(&body).unwrap()
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            addr: "127.0.0.1:0".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_dispatches_to_handler() {
        let handler: Arc<Mutex<dyn RequestHandler>> = Arc::new(Mutex::new(Echo));
        let server = TransportServer::start(local_config(), handler).unwrap();

        let mut stream = std::net::TcpStream::connect(server.local_addr()).unwrap();
        let request = Message::request(MessageKind::SetValue, vec![1, 2, 3], Some(vec![4, 5]));
        stream.write_all(&request.encode()).unwrap();

        let response = read_frame(&mut stream);
        assert_eq!(response.uid, request.uid);
        assert_eq!(response.key, vec![1, 2, 3]);
        assert_eq!(response.data, Some(vec![4, 5]));
    }

    #[test]
    fn test_pipelined_requests_answered_in_order() {
        let handler: Arc<Mutex<dyn RequestHandler>> = Arc::new(Mutex::new(Echo));
        let server = TransportServer::start(local_config(), handler).unwrap();

        let mut stream = std::net::TcpStream::connect(server.local_addr()).unwrap();
        let requests: Vec<_> = (0..5u8)
            .map(|i| Message::request(MessageKind::GetValue, vec![i], None))
            .collect();
        for request in &requests {
            stream.write_all(&request.encode()).unwrap();
        }

        for request in &requests {
            let response = read_frame(&mut stream);
            assert_eq!(response.uid, request.uid);
            assert_eq!(response.data, None);
        }
    }

    #[test]
    fn test_bind_failure_is_reported() {
        let handler: Arc<Mutex<dyn RequestHandler>> = Arc::new(Mutex::new(Echo));
        let first = TransportServer::start(local_config(), handler.clone()).unwrap();

        let taken = ServerConfig {
            addr: first.local_addr().to_string(),
            ..Default::default()
        };
        assert!(TransportServer::start(taken, handler).is_err());
    }

    #[test]
    fn test_shutdown_joins_thread() {
        let handler: Arc<Mutex<dyn RequestHandler>> = Arc::new(Mutex::new(Echo));
        let mut server = TransportServer::start(local_config(), handler).unwrap();
        let addr = server.local_addr();
        server.shutdown();

        // Listener is gone once the thread has been joined
        assert!(std::net::TcpStream::connect(addr).is_err());
    }
}
