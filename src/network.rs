use crate::config::NodeConfig;
use crate::error::Result;
use crate::packet::{read_packet, write_packet, Packet};
use crate::protocol::{DialRequest, NodeCore};
use crate::types::ChannelId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LOG_TARGET: &str = "remote_objects::io";

struct Shared {
    core: Mutex<NodeCore>,
    channels: Mutex<HashMap<ChannelId, mpsc::UnboundedSender<Packet>>>,
    next_channel: AtomicU64,
    max_frame_bytes: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// Runs `f` on the core, then hands every queued packet to its channel
    /// writer before releasing the core, so per-channel order is the order
    /// the core produced.
    fn with_core<R>(self: &Arc<Self>, f: impl FnOnce(&mut NodeCore) -> R) -> R {
        let mut core = self.core.lock().unwrap();
        let result = f(&mut core);
        let outgoing = core.take_outgoing();
        let dials = core.take_dials();
        {
            let channels = self.channels.lock().unwrap();
            for (channel, packet) in outgoing {
                match channels.get(&channel) {
                    Some(tx) => {
                        let _ = tx.send(packet);
                    }
                    None => debug!(target: LOG_TARGET, %channel, "dropping packet for closed channel"),
                }
            }
        }
        drop(core);
        for request in dials {
            self.spawn(dial(Arc::clone(self), request));
        }
        result
    }

    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn open_channel(self: &Arc<Self>, stream: TcpStream, endpoint: Option<String>) {
        let _ = stream.set_nodelay(true);
        let channel = ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed));
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
        self.channels.lock().unwrap().insert(channel, tx);

        let max_frame_bytes = self.max_frame_bytes;
        self.spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(e) = write_packet(&mut writer, &packet, max_frame_bytes).await {
                    warn!(target: LOG_TARGET, %channel, error = %e, "write failed");
                    break;
                }
            }
        });

        // Registered before the reader starts so the peer's Hello finds it.
        self.with_core(|core| core.channel_opened(channel, endpoint));

        let shared = Arc::clone(self);
        self.spawn(async move {
            loop {
                match read_packet(&mut reader, max_frame_bytes).await {
                    Ok(Some(packet)) => shared.with_core(|core| core.handle_packet(channel, packet)),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(target: LOG_TARGET, %channel, error = %e, "read failed, closing channel");
                        break;
                    }
                }
            }
            shared.close_channel(channel);
        });
    }

    fn close_channel(self: &Arc<Self>, channel: ChannelId) {
        self.channels.lock().unwrap().remove(&channel);
        self.with_core(|core| core.channel_closed(channel));
    }
}

async fn dial(shared: Arc<Shared>, request: DialRequest) {
    if !request.after.is_zero() {
        tokio::time::sleep(request.after).await;
    }
    match TcpStream::connect(request.endpoint.as_str()).await {
        Ok(stream) => {
            debug!(target: LOG_TARGET, endpoint = %request.endpoint, "connected");
            shared.open_channel(stream, Some(request.endpoint));
        }
        Err(e) => {
            debug!(target: LOG_TARGET, endpoint = %request.endpoint, error = %e, "connect failed");
            shared.with_core(|core| core.dial_failed(&request.endpoint));
        }
    }
}

/// A node driven over TCP.
///
/// All protocol work happens inside [`NodeCore`]; this type only moves
/// frames between sockets and the core.
pub struct RemoteObjectNode {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
}

impl RemoteObjectNode {
    /// Listens on `address` and registers the bound address as the node's
    /// endpoint. Port 0 picks a free port.
    pub async fn bind(address: SocketAddr, config: NodeConfig) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let heartbeat = config.heartbeat_interval();
        let shared = Arc::new(Shared {
            max_frame_bytes: config.max_frame_bytes,
            core: Mutex::new(NodeCore::new(local_addr.to_string(), config)?),
            channels: Mutex::new(HashMap::new()),
            next_channel: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
        });
        info!(target: LOG_TARGET, address = %local_addr, "node listening");

        let accept = Arc::clone(&shared);
        shared.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(target: LOG_TARGET, %peer, "accepted connection");
                        accept.open_channel(stream, None);
                    }
                    Err(e) => {
                        warn!(target: LOG_TARGET, error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        });

        if let Some(period) = heartbeat {
            let ticker = Arc::clone(&shared);
            shared.spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    ticker.with_core(|core| core.heartbeat());
                }
            });
        }

        Ok(Self { shared, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn endpoint(&self) -> String {
        self.local_addr.to_string()
    }

    /// Runs `f` with exclusive access to the node and sends whatever it
    /// queued. Must not be called from inside another `with_core`.
    pub fn with_core<R>(&self, f: impl FnOnce(&mut NodeCore) -> R) -> R {
        self.shared.with_core(f)
    }

    /// Polls `predicate` until it holds or `timeout` elapses.
    pub async fn wait_until(&self, timeout: Duration, predicate: impl Fn(&mut NodeCore) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.with_core(&predicate) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Releases every replica, flushes the writers and stops all tasks.
    pub async fn shutdown(self) {
        self.with_core(|core| core.release_all());
        self.shared.channels.lock().unwrap().clear();
        // Writers exit once their queue is drained.
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.abort_tasks();
    }

    fn abort_tasks(&self) {
        for task in self.shared.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for RemoteObjectNode {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
